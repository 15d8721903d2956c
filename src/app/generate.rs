use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::GeneratorConfig;
use crate::error::{Error, Result};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CameraType {
    Ortho,
    #[default]
    Persp,
}

impl CameraType {
    pub fn parse(s: &str) -> Result<Self> {
        s.trim().parse().map_err(|_| {
            let allowed: Vec<String> = CameraType::iter().map(|c| c.to_string()).collect();
            Error::Validation(format!(
                "camera_type must be one of {}, got {s:?}",
                allowed.join(", ")
            ))
        })
    }
}

/// Where the generator leaves its result, relative to the output directory
/// it was given: `<stage_dir>/<camera>/<model_file>`.
///
/// The external tool decides this layout on its own; this is the single
/// place that knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub stage_dir: String,
    pub model_file: String,
}

impl OutputLayout {
    pub fn model_path(&self, output_dir: &Path, camera: CameraType) -> PathBuf {
        output_dir
            .join(&self.stage_dir)
            .join(camera.to_string())
            .join(&self.model_file)
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub cutout: PathBuf,
    pub camera: CameraType,
    pub output_dir: PathBuf,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// Builds a 3D model from a cut-out and returns the model file's path.
    async fn generate(&self, req: &GenerationRequest) -> Result<PathBuf>;
}

/// Runs the image-to-3D tool as a child process:
/// `<program> <args..> --input_path <cutout> --camera_type <cam> --output_path <dir>`.
pub struct Wonder3dGenerator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    layout: OutputLayout,
}

impl Wonder3dGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        Wonder3dGenerator {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            layout: OutputLayout {
                stage_dir: config.stage_dir.clone(),
                model_file: config.model_file.clone(),
            },
        }
    }

    /// `cutout` and `output_dir` must already be absolute when `working_dir` is set.
    fn command(&self, req: &GenerationRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--input_path")
            .arg(&req.cutout)
            .arg("--camera_type")
            .arg(req.camera.to_string())
            .arg("--output_path")
            .arg(&req.output_dir)
            .stdin(Stdio::null());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl Generator for Wonder3dGenerator {
    async fn generate(&self, req: &GenerationRequest) -> Result<PathBuf> {
        if !req.cutout.is_file() {
            return Err(Error::ArtifactNotFound(req.cutout.clone()));
        }
        // the child may run elsewhere, so relative paths are resolved here
        let req = &GenerationRequest {
            cutout: std::path::absolute(&req.cutout)?,
            camera: req.camera,
            output_dir: std::path::absolute(&req.output_dir)?,
        };
        tokio::fs::create_dir_all(&req.output_dir).await?;

        let timer = std::time::Instant::now();
        info!(
            "generating {} model from {}",
            req.camera,
            req.cutout.display()
        );
        let status = self
            .command(req)
            .status()
            .await
            .map_err(|e| Error::Generation(format!("failed to start {}: {e}", self.program)))?;
        debug!("generator finished in {:?} with {status}", timer.elapsed());

        if !status.success() {
            return Err(Error::Generation(format!(
                "{} exited with {status}",
                self.program
            )));
        }

        let model = self.layout.model_path(&req.output_dir, req.camera);
        if !model.is_file() {
            return Err(Error::Generation(format!(
                "generator succeeded but {} is missing",
                model.display()
            )));
        }

        Ok(model)
    }
}
