use std::path::PathBuf;
use std::sync::Arc;

use image::{DynamicImage, GrayImage, RgbaImage};
use tracing::{info, warn};

use super::artifacts::{ArtifactDir, ArtifactStore};
use super::generate::{CameraType, GenerationRequest, Generator};
use super::model::sam::prompt::Prompt;
use super::threads::{self, image_loader::Image, SegmentWorker};
use crate::error::{Error, Result};
use crate::utils;

/// Output of the segment stage, already written to `dir`.
pub struct Segmented {
    pub dir: ArtifactDir,
    pub mask: GrayImage,
    pub cutout: RgbaImage,
    pub overlay: RgbaImage,
}

pub enum Outcome {
    SegmentedOnly(Segmented),
    Completed { segmented: Segmented, model: PathBuf },
}

impl Outcome {
    pub fn segmented(&self) -> &Segmented {
        match self {
            Outcome::SegmentedOnly(s) => s,
            Outcome::Completed { segmented, .. } => segmented,
        }
    }
}

/// Segment, then optionally hand the cut-out to the 3D generator.
#[derive(Clone)]
pub struct Pipeline {
    worker: SegmentWorker,
    generator: Arc<dyn Generator>,
    store: ArtifactStore,
}

impl Pipeline {
    pub fn new(worker: SegmentWorker, generator: Arc<dyn Generator>, store: ArtifactStore) -> Self {
        Pipeline {
            worker,
            generator,
            store,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Writes the segment artifacts under `name` (sanitized), or under a fresh
    /// id when `name` is `None`. Nothing is created for an out-of-bounds prompt.
    pub async fn segment(&self, img: Image, prompt: Prompt, name: Option<&str>) -> Result<Segmented> {
        prompt.check_bounds(img.data.width(), img.data.height())?;
        let dir = match name {
            Some(name) => self.store.create(&ArtifactStore::id_for_name(name))?,
            None => self.store.create_unique()?,
        };

        let label = img.name.clone();
        let (rgb, dir) = threads::blocking(move || {
            let rgb = img.rgb();
            rgb.save(dir.original())?;
            Ok((rgb, dir))
        })
        .await?;

        let mask = self
            .worker
            .segment(DynamicImage::ImageRgb8(rgb.clone()), prompt)
            .await?;

        let segmented = threads::blocking(move || {
            let (cutout, overlay) = utils::apply_mask(&rgb, &mask)?;
            utils::colorize_mask(&mask).save(dir.predicted_mask())?;
            cutout.save(dir.cutout())?;
            overlay.save(dir.overlay())?;
            Ok(Segmented {
                dir,
                mask,
                cutout,
                overlay,
            })
        })
        .await?;
        info!("segmented {label} into {}", segmented.dir.path().display());

        Ok(segmented)
    }

    pub async fn generate(&self, dir: &ArtifactDir, camera: CameraType) -> Result<PathBuf> {
        let req = GenerationRequest {
            cutout: dir.require(dir.cutout())?,
            camera,
            output_dir: dir.model_dir(),
        };

        self.generator.generate(&req).await.map_err(|e| {
            warn!(
                "generation failed, segment artifacts kept in {}",
                dir.path().display()
            );
            e
        })
    }

    /// A segment failure returns before the generator is ever started.
    pub async fn run(
        &self,
        img: Image,
        prompt: Prompt,
        name: Option<&str>,
        camera: Option<CameraType>,
    ) -> Result<Outcome> {
        let segmented = self.segment(img, prompt, name).await?;

        match camera {
            None => Ok(Outcome::SegmentedOnly(segmented)),
            Some(camera) => {
                let model = self.generate(&segmented.dir, camera).await?;
                info!("pipeline completed: {}", model.display());
                Ok(Outcome::Completed { segmented, model })
            }
        }
    }

    /// Segments an image file into `<root>/<image name>/`; returns the cut-out path.
    pub async fn segment_file(&self, path: PathBuf, prompt: Prompt) -> Result<PathBuf> {
        let img = threads::blocking(move || Image::load(path)).await?;
        let name = img.name.clone();

        let segmented = self.segment(img, prompt, Some(name.as_str())).await?;
        segmented.dir.require(segmented.dir.cutout())
    }

    /// Segments and generates from an image file; returns the model path.
    pub async fn run_file(&self, path: PathBuf, camera: CameraType, prompt: Prompt) -> Result<PathBuf> {
        let img = threads::blocking(move || Image::load(path)).await?;
        info!("loaded {} ({} bytes)", img.name, img.file_size);
        let name = img.name.clone();

        match self.run(img, prompt, Some(name.as_str()), Some(camera)).await? {
            Outcome::Completed { model, .. } => Ok(model),
            Outcome::SegmentedOnly(_) => Err(Error::Generation("generation stage was skipped".into())),
        }
    }
}
