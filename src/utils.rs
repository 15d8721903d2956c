use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::{DynamicImage, GrayImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::error::{Error, Result};

pub const OVERLAY_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);

// jet colormap endpoints, as matplotlib draws a 0/255 mask
const JET_LOW: Rgb<u8> = Rgb([0, 0, 128]);
const JET_HIGH: Rgb<u8> = Rgb([128, 0, 0]);

fn is_foreground(p: image::Luma<u8>) -> bool {
    p[0] > 127
}

/// Splits `img` by `mask` into a cut-out (source colours, alpha from the mask)
/// and a display overlay (`OVERLAY_COLOR` on the foreground, transparent elsewhere).
pub fn apply_mask(img: &RgbImage, mask: &GrayImage) -> Result<(RgbaImage, RgbaImage)> {
    if img.dimensions() != mask.dimensions() {
        return Err(Error::Validation(format!(
            "mask is {:?} but image is {:?}",
            mask.dimensions(),
            img.dimensions()
        )));
    }

    let cutout = imageproc::map::map_colors2(img, mask, |p, m| {
        let alpha = if is_foreground(m) { 255 } else { 0 };
        Rgba([p[0], p[1], p[2], alpha])
    });
    let overlay = imageproc::map::map_colors(mask, |m| {
        if is_foreground(m) {
            OVERLAY_COLOR
        } else {
            Rgba([0, 0, 0, 0])
        }
    });

    Ok((cutout, overlay))
}

pub fn colorize_mask(mask: &GrayImage) -> RgbImage {
    imageproc::map::map_colors(mask, |m| if is_foreground(m) { JET_HIGH } else { JET_LOW })
}

/// Placeholder segmentation: a 5px red frame inset 50px from the border.
pub fn demo_frame(img: &RgbImage) -> RgbaImage {
    let mut out = DynamicImage::ImageRgb8(img.clone()).to_rgba8();
    let (w, h) = out.dimensions();

    for i in 0..5u32 {
        let inset = 50 + i;
        if w <= 2 * inset + 1 || h <= 2 * inset + 1 {
            break;
        }
        let rect = Rect::at(inset as i32, inset as i32).of_size(w - 2 * inset, h - 2 * inset);
        draw_hollow_rect_mut(&mut out, rect, OVERLAY_COLOR);
    }

    out
}

pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

pub fn png_base64(img: &DynamicImage) -> Result<String> {
    Ok(B64.encode(encode_png(img)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| Rgb([x as u8, y as u8, (x + y) as u8]))
    }

    #[test]
    fn full_mask_keeps_colors_and_is_opaque() {
        let img = gradient(16, 9);
        let mask = GrayImage::from_pixel(16, 9, Luma([255]));

        let (cutout, _) = apply_mask(&img, &mask).unwrap();
        for (x, y, p) in cutout.enumerate_pixels() {
            let src = img.get_pixel(x, y);
            assert_eq!(p.0, [src[0], src[1], src[2], 255]);
        }
    }

    #[test]
    fn empty_mask_is_fully_transparent() {
        let img = gradient(16, 9);
        let mask = GrayImage::new(16, 9);

        let (cutout, overlay) = apply_mask(&img, &mask).unwrap();
        assert!(cutout.pixels().all(|p| p[3] == 0));
        assert!(overlay.pixels().all(|p| p.0 == [0, 0, 0, 0]));
    }

    #[test]
    fn overlay_is_deterministic() {
        let img = gradient(20, 20);
        let mask = GrayImage::from_fn(20, 20, |x, _| Luma([if x < 10 { 255 } else { 0 }]));

        let (_, first) = apply_mask(&img, &mask).unwrap();
        let (_, second) = apply_mask(&img, &mask).unwrap();
        assert_eq!(first.as_raw(), second.as_raw());
        assert_eq!(*first.get_pixel(3, 3), OVERLAY_COLOR);
        assert_eq!(first.get_pixel(15, 3).0, [0, 0, 0, 0]);
    }

    #[test]
    fn mismatched_mask_is_rejected() {
        let res = apply_mask(&gradient(4, 4), &GrayImage::new(5, 4));
        assert!(matches!(res, Err(Error::Validation(_))));
    }

    #[test]
    fn png_round_trips_through_base64() {
        let img = DynamicImage::ImageRgba8(RgbaImage::new(7, 3));
        let encoded = png_base64(&img).unwrap();

        let bytes = B64.decode(encoded).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (7, 3));
    }

    #[test]
    fn demo_frame_draws_inside_border() {
        let img = RgbImage::new(200, 150);
        let out = demo_frame(&img);

        assert_eq!(*out.get_pixel(50, 75), OVERLAY_COLOR);
        assert_eq!(*out.get_pixel(54, 75), OVERLAY_COLOR);
        assert_eq!(out.get_pixel(100, 75).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(10, 10).0, [0, 0, 0, 255]);
    }
}
