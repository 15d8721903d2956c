use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Label {
    Negative,
    #[default]
    Positive,
}

impl TryFrom<u8> for Label {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        match v {
            0 => Ok(Label::Negative),
            1 => Ok(Label::Positive),
            other => Err(format!("point label must be 0 or 1, got {other}")),
        }
    }
}

impl From<Label> for u8 {
    fn from(label: Label) -> u8 {
        match label {
            Label::Negative => 0,
            Label::Positive => 1,
        }
    }
}

impl From<Label> for f32 {
    fn from(label: Label) -> f32 {
        u8::from(label) as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointPrompt {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub label: Label,
}

impl PointPrompt {
    pub fn positive(x: f32, y: f32) -> Self {
        PointPrompt {
            x,
            y,
            label: Label::Positive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoxPrompt {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoxPrompt {
    // corners may come in any order
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        BoxPrompt {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }
}

/// Points and an optional box in image pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    points: Vec<PointPrompt>,
    bbox: Option<BoxPrompt>,
}

impl Prompt {
    pub fn new(points: Vec<PointPrompt>, bbox: Option<BoxPrompt>) -> Result<Self> {
        if points.is_empty() && bbox.is_none() {
            return Err(Error::Validation(
                "a prompt needs at least one point or a box".into(),
            ));
        }

        let coords_finite = points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
            && bbox.map_or(true, |b| {
                [b.x1, b.y1, b.x2, b.y2].iter().all(|v| v.is_finite())
            });
        if !coords_finite {
            return Err(Error::Validation("prompt coordinates must be finite".into()));
        }

        let bbox = bbox.map(|b| BoxPrompt::new(b.x1, b.y1, b.x2, b.y2));
        Ok(Prompt { points, bbox })
    }

    pub fn points(&self) -> &[PointPrompt] {
        &self.points
    }

    pub fn bbox(&self) -> Option<&BoxPrompt> {
        self.bbox.as_ref()
    }

    /// Rejects prompts that fall outside a `w` x `h` image.
    ///
    /// Points are pixel indices, so `x == w` is already outside. Box corners
    /// are edges and may sit on the far border.
    pub fn check_bounds(&self, w: u32, h: u32) -> Result<()> {
        let (w, h) = (w as f32, h as f32);
        let on_pixel = |x: f32, y: f32| x >= 0.0 && y >= 0.0 && x < w && y < h;
        let on_edge = |x: f32, y: f32| x >= 0.0 && y >= 0.0 && x <= w && y <= h;

        for p in &self.points {
            if !on_pixel(p.x, p.y) {
                return Err(Error::Validation(format!(
                    "point ({}, {}) lies outside the {w}x{h} image",
                    p.x, p.y
                )));
            }
        }
        if let Some(b) = &self.bbox {
            if !on_edge(b.x1, b.y1) || !on_edge(b.x2, b.y2) {
                return Err(Error::Validation(format!(
                    "box ({}, {}, {}, {}) lies outside the {w}x{h} image",
                    b.x1, b.y1, b.x2, b.y2
                )));
            }
        }

        Ok(())
    }

    /// Flattened `(coords, labels)` as the SAM decoder expects them, scaled by
    /// `(sx, sy)`. A box becomes its two corners with labels 2 and 3.
    pub fn to_decoder_inputs(&self, sx: f32, sy: f32) -> (Vec<f32>, Vec<f32>) {
        let mut coords = Vec::with_capacity((self.points.len() + 2) * 2);
        let mut labels = Vec::with_capacity(self.points.len() + 2);

        for p in &self.points {
            coords.extend([p.x * sx, p.y * sy]);
            labels.push(f32::from(p.label));
        }
        if let Some(b) = &self.bbox {
            coords.extend([b.x1 * sx, b.y1 * sy, b.x2 * sx, b.y2 * sy]);
            labels.extend([2.0, 3.0]);
        }

        (coords, labels)
    }
}
