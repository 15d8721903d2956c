use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbImage};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Image {
    pub data: DynamicImage,
    pub name: String,
    pub file_size: u64,
}

impl Image {
    pub fn load(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ArtifactNotFound(path));
        }
        let data = image::ImageReader::open(&path)?.decode()?;
        let file_size = std::fs::metadata(&path)?.len();

        Ok(Image {
            data,
            name: stem(&path),
            file_size,
        })
    }

    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self> {
        let data = image::load_from_memory(bytes)
            .map_err(|e| Error::Validation(format!("cannot decode uploaded image: {e}")))?;

        Ok(Image {
            data,
            name: stem(Path::new(name)),
            file_size: bytes.len() as u64,
        })
    }

    /// Alpha is dropped, the model only sees colour.
    pub fn rgb(&self) -> RgbImage {
        self.data.to_rgb8()
    }
}

fn stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_bytes_fail_validation() {
        let res = Image::from_bytes(b"definitely not a png", "upload.png");
        assert!(matches!(res, Err(Error::Validation(_))));
    }

    #[test]
    fn load_keeps_file_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.png");
        image::RgbImage::new(3, 2).save(&path).unwrap();

        let img = Image::load(path).unwrap();
        assert_eq!(img.name, "cat");
        assert_eq!((img.data.width(), img.data.height()), (3, 2));
    }

    #[test]
    fn rgba_upload_is_flattened_to_rgb() {
        let png = crate::utils::encode_png(&DynamicImage::new_rgba8(4, 4)).unwrap();
        let img = Image::from_bytes(&png, "a.png").unwrap();
        assert_eq!(img.rgb().dimensions(), (4, 4));
    }
}
