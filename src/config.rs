//! Run configuration for the `causal-tune` binary

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::EngineOptions;
use crate::error::{Error, Result};
use crate::training::TrainingConfig;
use crate::utils::{select_device, DeviceType};

/// Where the base model comes from
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelSection {
    /// Hub model id or local directory
    pub name: Option<String>,
    /// Saved checkpoint directory; wins over `name`
    pub weights_path: Option<PathBuf>,
    /// Quantize the base to 8-bit
    pub load_8bit: bool,
    /// Device to run on
    pub device: DeviceType,
    /// CUDA device ordinal
    pub device_ordinal: usize,
    /// Score validation accuracy on target tokens only
    pub masked_accuracy: bool,
}

impl ModelSection {
    /// Engine options for this section, with the device resolved
    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            model_name: self.name.clone(),
            weights_path: self.weights_path.clone(),
            load_8bit: self.load_8bit,
            device: Some(select_device(self.device, self.device_ordinal)?),
            masked_accuracy: self.masked_accuracy,
            ..EngineOptions::default()
        })
    }
}

/// LoRA switch and targets; the remaining hyperparameters are fixed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoraSection {
    pub enabled: bool,
    /// Module names to adapt (`q_proj`, `v_proj` when unset)
    pub target_modules: Option<Vec<String>>,
}

impl Default for LoraSection {
    fn default() -> Self {
        Self {
            enabled: true,
            target_modules: None,
        }
    }
}

/// JSONL datasets
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataSection {
    pub train: Option<PathBuf>,
    pub validation: Option<PathBuf>,
}

/// Full configuration of a fine-tuning run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub model: ModelSection,
    #[serde(default)]
    pub lora: LoraSection,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub data: DataSection,
    /// Where checkpoints and the run summary are written
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl RunConfig {
    /// Load from a `.json`, `.yaml` or `.yml` file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => {
                return Err(Error::config(format!(
                    "Unsupported config format: {} (expected .json, .yaml or .yml)",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Write as JSON or YAML depending on the extension
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.name.is_none() && self.model.weights_path.is_none() {
            return Err(Error::config("model.name or model.weights_path must be set"));
        }
        if let Some(targets) = &self.lora.target_modules {
            if targets.is_empty() {
                return Err(Error::config("lora.target_modules must not be empty"));
            }
        }
        if self.model.load_8bit && !self.lora.enabled {
            return Err(Error::config(
                "8-bit models have no trainable weights; enable lora to fine-tune them",
            ));
        }
        self.training.validate()
    }
}
