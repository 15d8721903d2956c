use image::{DynamicImage, GenericImageView, GrayImage};
use tracing::warn;

use crate::error::{Error, Result};
use sam::prompt::Prompt;

pub mod sam;

/// A segmentation backend holding one working image at a time.
///
/// `set_image` and `predict` both mutate the backend, so a `Segmenter` is
/// driven by exactly one thread (see `threads`).
pub trait Segmenter: Send {
    fn set_image(&mut self, img: &DynamicImage) -> Result<()>;

    fn predict(&mut self, prompt: &Prompt) -> Result<CandidateSet>;
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub mask: GrayImage,
    pub score: f32,
}

/// The (mask, score) pairs produced by one `predict` call.
#[derive(Debug, Clone, Default)]
pub struct CandidateSet(Vec<Candidate>);

impl CandidateSet {
    pub fn new(candidates: Vec<Candidate>) -> Self {
        CandidateSet(candidates)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Orders candidates by descending score. The sort is stable, so equal
    /// scores keep the order the model returned them in.
    pub fn ranked(mut self) -> Vec<Candidate> {
        self.0.sort_by(|a, b| b.score.total_cmp(&a.score));
        self.0
    }

    pub fn best(self) -> Option<Candidate> {
        self.ranked().into_iter().next()
    }
}

/// Runs one prompt against `img` and keeps the highest scoring mask.
///
/// The returned mask always has the dimensions of `img`.
pub fn predict_best(
    segmenter: &mut dyn Segmenter,
    img: &DynamicImage,
    prompt: &Prompt,
) -> Result<GrayImage> {
    segmenter.set_image(img)?;
    let candidates = segmenter.predict(prompt)?;

    let best = candidates
        .best()
        .ok_or_else(|| Error::ModelInference("model returned no mask candidates".into()))?;

    let (w, h) = img.dimensions();
    if best.mask.dimensions() == (w, h) {
        return Ok(best.mask);
    }

    warn!(
        "mask is {:?}, resizing to the {w}x{h} source image",
        best.mask.dimensions()
    );
    Ok(image::imageops::resize(
        &best.mask,
        w,
        h,
        image::imageops::FilterType::Nearest,
    ))
}


#[cfg(test)]
mod tests {
    use super::sam::prompt::PointPrompt;
    use super::testing::Scripted;
    use super::*;

    fn prompt() -> Prompt {
        Prompt::new(vec![PointPrompt::positive(5.0, 5.0)], None).unwrap()
    }

    #[test]
    fn highest_score_wins() {
        let mut seg = Scripted::new(vec![(10, 0.2), (20, 0.9), (30, 0.5)]);
        let img = DynamicImage::new_rgb8(8, 6);

        let mask = predict_best(&mut seg, &img, &prompt()).unwrap();
        assert_eq!(mask.get_pixel(0, 0)[0], 20);
    }

    #[test]
    fn ties_keep_first_candidate() {
        let mut seg = Scripted::new(vec![(10, 0.7), (20, 0.7), (30, 0.1)]);
        let img = DynamicImage::new_rgb8(8, 6);

        for _ in 0..3 {
            let mask = predict_best(&mut seg, &img, &prompt()).unwrap();
            assert_eq!(mask.get_pixel(0, 0)[0], 10);
        }
    }

    #[test]
    fn mask_matches_image_dimensions() {
        let mut seg = Scripted::new(vec![(255, 1.0)]);
        seg.mask_size = Some((4, 4));
        let img = DynamicImage::new_rgb8(100, 60);

        let mask = predict_best(&mut seg, &img, &prompt()).unwrap();
        assert_eq!(mask.dimensions(), (100, 60));
    }

    #[test]
    fn empty_candidate_set_is_an_inference_error() {
        let mut seg = Scripted::new(vec![]);
        let img = DynamicImage::new_rgb8(8, 6);

        let res = predict_best(&mut seg, &img, &prompt());
        assert!(matches!(res, Err(Error::ModelInference(_))));
    }
}
