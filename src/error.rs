use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("segmentation failed: {0}")]
    ModelInference(String),

    #[error("3D generation failed: {0}")]
    Generation(String),

    #[error("artifact not found: {}", .0.display())]
    ArtifactNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<ort::Error> for Error {
    fn from(e: ort::Error) -> Self {
        Error::ModelInference(e.to_string())
    }
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::ModelInference(format!("unexpected tensor shape: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
