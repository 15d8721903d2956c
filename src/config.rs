use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sam_e_path: String,
    pub sam_d_path: String,
    pub intra_threads: usize,
    /// Decoder logits above this value count as foreground.
    pub mask_threshold: f32,

    pub output_root: PathBuf,
    pub bind: String,
    pub body_limit_mb: usize,

    pub generator: GeneratorConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    // where the generator leaves its mesh: <output>/<stage_dir>/<camera>/<model_file>
    pub stage_dir: String,
    pub model_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub max_age_secs: Option<u64>,
    pub max_dirs: Option<usize>,
    pub max_bytes: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sam_e_path: "weights/sam2.1_hiera_large.encoder.onnx".to_string(),
            sam_d_path: "weights/sam2.1_hiera_large.decoder.onnx".to_string(),
            intra_threads: 4,
            mask_threshold: 0.0,
            output_root: PathBuf::from("output"),
            bind: "0.0.0.0:8000".to_string(),
            body_limit_mb: 50,
            generator: GeneratorConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        GeneratorConfig {
            program: "python".to_string(),
            args: vec!["Wonder3DPlus/run.py".to_string()],
            working_dir: None,
            stage_dir: "wonder3d".to_string(),
            model_file: "model.obj".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("{} not found, using default configuration", path.display());
            return Ok(Config::default());
        }

        let json_content = std::fs::read_to_string(path)?;
        Self::from_json(&json_content)
    }

    pub fn from_json(json_content: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json_content)
            .map_err(|e| Error::Config(format!("malformed config: {e}")))?;

        if config.generator.program.is_empty() {
            return Err(Error::Config("generator.program must not be empty".into()));
        }
        if config.intra_threads == 0 {
            return Err(Error::Config("intra_threads must be at least 1".into()));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_json(
            r#"{ "output_root": "/srv/artifacts", "retention": { "max_dirs": 10 } }"#,
        )
        .unwrap();

        assert_eq!(config.output_root, PathBuf::from("/srv/artifacts"));
        assert_eq!(config.retention.max_dirs, Some(10));
        assert_eq!(config.retention.max_age_secs, None);
        assert_eq!(config.bind, "0.0.0.0:8000");
        assert_eq!(config.generator.stage_dir, "wonder3d");
    }

    #[test]
    fn empty_generator_program_is_rejected() {
        let err = Config::from_json(r#"{ "generator": { "program": "" } }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load("definitely/not/here.json").unwrap();
        assert_eq!(config.intra_threads, 4);
    }
}
