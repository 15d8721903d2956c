pub mod prompt;

use prompt::Prompt;

use lazy_static::lazy_static;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView2, ArrayViewD, Axis, Ix3, Ix4};
use ort::{inputs, GraphOptimizationLevel, Session};
use tracing::debug;

use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma};

use super::{Candidate, CandidateSet, Segmenter};
use crate::app::device::Device;
use crate::error::{Error, Result};

// SAM2 encoders take a square 1024x1024 input, normalised with ImageNet stats
const INPUT_SIZE: u32 = 1024;
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

lazy_static! {
    static ref MASK: Array4<f32> = Array4::<f32>::zeros((1, 1, 256, 256));
    static ref HAS_MASK_INPUT: Array1<f32> = Array1::from(vec![0.0f32]);
}

struct Embedding {
    image_embed: Array4<f32>,
    high_res_feats_0: Array4<f32>,
    high_res_feats_1: Array4<f32>,
}

/// SAM2 image predictor split into an encoder and a prompt decoder session.
pub struct SAMmodel {
    encoder: Session,
    decoder: Session,
    threshold: f32,

    embedding: Option<Embedding>,
    ori_w: u32,
    ori_h: u32,
}

impl SAMmodel {
    pub fn new_path(
        encoder_path: &str,
        decoder_path: &str,
        device: Device,
        intra_threads: usize,
        threshold: f32,
    ) -> Result<Self> {
        debug!("Loading SAM2 encoder from {encoder_path}, decoder from {decoder_path}");
        let encoder = Self::session(encoder_path, device, intra_threads)?;
        let decoder = Self::session(decoder_path, device, intra_threads)?;

        Ok(Self {
            encoder,
            decoder,
            threshold,
            embedding: None,
            ori_w: 0,
            ori_h: 0,
        })
    }

    fn session(path: &str, device: Device, intra_threads: usize) -> Result<Session> {
        if !std::path::Path::new(path).exists() {
            return Err(Error::ArtifactNotFound(path.into()));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(device.execution_providers())?
            .with_intra_threads(intra_threads)?
            .commit_from_file(path)?;

        Ok(session)
    }

    fn embed(&mut self, img: &DynamicImage) -> Result<()> {
        let (input, w, h) = Self::preprocess_img(img);
        self.ori_w = w;
        self.ori_h = h;

        let encoder_input = inputs!(&self.encoder.inputs[0].name => input.view())?;
        let mut encoder_output = self.encoder.run(encoder_input)?;

        let mut feature = |name: &str| -> Result<Array4<f32>> {
            let value = encoder_output
                .remove(name)
                .ok_or_else(|| Error::ModelInference(format!("encoder output {name} missing")))?;
            let tensor = value.try_extract_tensor::<f32>()?;
            Ok(tensor.into_dimensionality::<Ix4>()?.to_owned())
        };

        self.embedding = Some(Embedding {
            image_embed: feature("image_embed")?,
            high_res_feats_0: feature("high_res_feats_0")?,
            high_res_feats_1: feature("high_res_feats_1")?,
        });

        Ok(())
    }

    fn generate_masks(&self, prompt: &Prompt) -> Result<CandidateSet> {
        let emb = self
            .embedding
            .as_ref()
            .ok_or_else(|| Error::ModelInference("predict called before set_image".into()))?;
        let (points, labels) = self.preprocess_prompt(prompt)?;

        let decoder_input = inputs!(
            &self.decoder.inputs[0].name => emb.image_embed.view(),
            &self.decoder.inputs[1].name => emb.high_res_feats_0.view(),
            &self.decoder.inputs[2].name => emb.high_res_feats_1.view(),
            &self.decoder.inputs[3].name => points.view(),
            &self.decoder.inputs[4].name => labels.view(),
            &self.decoder.inputs[5].name => MASK.view(),
            &self.decoder.inputs[6].name => HAS_MASK_INPUT.view(),
        )?;
        let decoder_output = self.decoder.run(decoder_input)?;

        let masks = decoder_output["masks"].try_extract_tensor::<f32>()?;
        let scores = decoder_output["iou_predictions"].try_extract_tensor::<f32>()?;
        self.postprocess(masks, scores.iter().copied().collect())
    }

    fn preprocess_img(img: &DynamicImage) -> (Array4<f32>, u32, u32) {
        let (ori_w, ori_h) = img.dimensions();
        let img = img.resize_exact(
            INPUT_SIZE,
            INPUT_SIZE,
            image::imageops::FilterType::CatmullRom,
        );

        let mut arr = Array4::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
        for pixel in img.pixels() {
            let x = pixel.0 as usize;
            let y = pixel.1 as usize;
            let [r, g, b, _] = pixel.2 .0;

            for (c, v) in [r, g, b].into_iter().enumerate() {
                arr[[0, c, y, x]] = (v as f32 / 255.0 - MEAN[c]) / STD[c];
            }
        }

        (arr, ori_w, ori_h)
    }

    fn preprocess_prompt(&self, prompt: &Prompt) -> Result<(Array3<f32>, Array2<f32>)> {
        // prompts arrive in source pixels, the decoder wants encoder-input pixels
        let sx = INPUT_SIZE as f32 / self.ori_w.max(1) as f32;
        let sy = INPUT_SIZE as f32 / self.ori_h.max(1) as f32;
        let (points, labels) = prompt.to_decoder_inputs(sx, sy);

        let n = labels.len();
        let points = Array3::from_shape_vec((1, n, 2), points)?;
        let labels = Array2::from_shape_vec((1, n), labels)?;

        Ok((points, labels))
    }

    fn postprocess(&self, masks: ArrayViewD<f32>, scores: Vec<f32>) -> Result<CandidateSet> {
        // [1, C, H, W] -> C masks of H x W
        let masks = masks.index_axis(Axis(0), 0).into_dimensionality::<Ix3>()?;

        let mut candidates = Vec::with_capacity(masks.len_of(Axis(0)));
        for (i, logits) in masks.axis_iter(Axis(0)).enumerate() {
            candidates.push(Candidate {
                mask: upscale_logits(logits, self.ori_w, self.ori_h, self.threshold)?,
                score: scores.get(i).copied().unwrap_or(f32::MIN),
            });
        }

        Ok(CandidateSet::new(candidates))
    }
}

/// Resizes decoder logits bilinearly to `w` x `h`, then thresholds them.
///
/// `resize` clamps f32 samples to `[0, 1]`, so the logits are mapped into that
/// range first. The map is affine and the triangle filter's weights are
/// convex, so the threshold moves with it unchanged.
fn upscale_logits(logits: ArrayView2<f32>, w: u32, h: u32, threshold: f32) -> Result<GrayImage> {
    let (mh, mw) = logits.dim();
    let (lo, hi) = logits
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    if hi - lo <= f32::EPSILON {
        let fill = if lo > threshold { 255u8 } else { 0u8 };
        return Ok(GrayImage::from_pixel(w, h, Luma([fill])));
    }

    let span = hi - lo;
    let unit: Vec<f32> = logits.iter().map(|&v| (v - lo) / span).collect();
    let grid = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(mw as u32, mh as u32, unit)
        .ok_or_else(|| Error::ModelInference("mask buffer size mismatch".into()))?;
    let grid = if grid.dimensions() == (w, h) {
        grid
    } else {
        image::imageops::resize(&grid, w, h, image::imageops::FilterType::Triangle)
    };

    let cut = (threshold - lo) / span;
    Ok(imageproc::map::map_colors(&grid, |p| {
        Luma([if p[0] > cut { 255u8 } else { 0u8 }])
    }))
}

impl Segmenter for SAMmodel {
    fn set_image(&mut self, img: &DynamicImage) -> Result<()> {
        self.embed(img)
    }

    fn predict(&mut self, prompt: &Prompt) -> Result<CandidateSet> {
        self.generate_masks(prompt)
    }
}
