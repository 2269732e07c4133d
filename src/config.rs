//! Config module.
//! Loads `analyser_config.json` (model paths, input preprocessing, capture bounds).
//! Uses serde for JSON; every field falls back to a default so a partial file is fine.
//! A missing default file is not an error, a missing `--config` file is.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::Level;

use crate::preprocess::InputSpec;

pub const DEFAULT_CONFIG_PATH: &str = "analyser_config.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub input: InputSpec,
    pub capture: CaptureConfig,
    /// One of trace, debug, info, warn, error.
    pub log_level: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    /// JSON file with an `id2label` object (Hugging Face config layout).
    pub labels_path: PathBuf,
    pub top_k: usize,
    pub use_gpu: bool,
    pub intra_threads: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Crop rectangle (x, y, width, height) applied to screen captures.
    pub bounds: Option<[u32; 4]>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            input: InputSpec::default(),
            capture: CaptureConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/chess_layout.onnx"),
            labels_path: PathBuf::from("models/chess_layout_config.json"),
            top_k: 5,
            use_gpu: false,
            intra_threads: 4,
        }
    }
}

impl Config {
    /// Reads the config from `path`, or from [`DEFAULT_CONFIG_PATH`] when it exists.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.input.size == 0 {
            anyhow::bail!("input.size must be greater than zero");
        }
        if !(self.input.crop_pct > 0.0 && self.input.crop_pct <= 1.0) {
            anyhow::bail!("input.crop_pct must be in (0, 1], got {}", self.input.crop_pct);
        }
        if self.input.std.iter().any(|s| *s == 0.0) {
            anyhow::bail!("input.std must not contain zeros");
        }
        if let Some([_, _, w, h]) = self.capture.bounds {
            if w == 0 || h == 0 {
                anyhow::bail!("capture.bounds width and height must be non-zero");
            }
        }
        self.level()?;
        Ok(())
    }

    pub fn level(&self) -> Result<Level> {
        self.log_level
            .parse::<Level>()
            .map_err(|_| anyhow::anyhow!("Unknown log level '{}'", self.log_level))
    }
}
