//! LoRA configuration types and PEFT-compatible adapter metadata

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};

/// File name of the serialized adapter configuration
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// File name of the serialized adapter weights
pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";

/// Types of bias handling in LoRA
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BiasType {
    /// No bias adaptation
    #[default]
    None,
    /// Adapt all bias terms
    All,
    /// Only adapt LoRA bias terms
    LoraOnly,
}

/// Task the adapted model is trained for
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskType {
    /// Next-token prediction
    #[default]
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
}

/// Main LoRA configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoraConfig {
    /// LoRA rank (size of the low-rank matrices)
    pub r: usize,
    /// LoRA alpha (scaling factor)
    pub lora_alpha: f64,
    /// Dropout probability applied to the adapter input
    pub lora_dropout: f32,
    /// Module name suffixes to adapt
    pub target_modules: Vec<String>,
    /// Bias configuration
    pub bias: BiasType,
    /// Task type
    pub task_type: TaskType,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 8,
            lora_alpha: 32.0,
            lora_dropout: 0.05,
            target_modules: Self::default_target_modules(),
            bias: BiasType::None,
            task_type: TaskType::CausalLm,
        }
    }
}

impl LoraConfig {
    /// Attention projections adapted when no targets are given
    pub fn default_target_modules() -> Vec<String> {
        vec!["q_proj".to_string(), "v_proj".to_string()]
    }

    /// The fixed configuration used by the LoRA engine
    pub fn causal_lm(target_modules: Option<Vec<String>>) -> Self {
        Self {
            target_modules: target_modules.unwrap_or_else(Self::default_target_modules),
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.r == 0 {
            return Err(Error::config("LoRA rank must be greater than 0"));
        }
        if self.lora_alpha <= 0.0 {
            return Err(Error::config("LoRA alpha must be positive"));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(Error::config("LoRA dropout must be in [0.0, 1.0)"));
        }
        if self.target_modules.is_empty() {
            return Err(Error::config("At least one target module must be specified"));
        }
        let mut unique_modules = HashSet::new();
        for module in &self.target_modules {
            if !unique_modules.insert(module) {
                return Err(Error::config(format!("Duplicate target module: {}", module)));
            }
        }
        // The decoder's projections carry no bias terms
        if self.bias != BiasType::None {
            return Err(Error::config(format!(
                "Bias mode {:?} is not supported by bias-free projections",
                self.bias
            )));
        }
        Ok(())
    }

    /// Effective scaling factor (alpha / rank)
    pub fn scaling_factor(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    /// Whether a module path is targeted: exact match or dotted suffix match
    pub fn is_target_module(&self, module_name: &str) -> bool {
        self.target_modules.iter().any(|target| {
            module_name == target
                || module_name
                    .strip_suffix(target.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    /// Adapter metadata in the layout PEFT writes next to adapter weights
    pub fn adapter_config(&self, base_model_name_or_path: Option<String>) -> AdapterConfig {
        AdapterConfig {
            peft_type: "LORA".to_string(),
            task_type: self.task_type,
            base_model_name_or_path,
            r: self.r,
            lora_alpha: self.lora_alpha,
            lora_dropout: self.lora_dropout,
            target_modules: self.target_modules.clone(),
            bias: self.bias,
            fan_in_fan_out: false,
            inference_mode: true,
        }
    }
}

/// Serialized form of `adapter_config.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    /// Always `LORA`
    pub peft_type: String,
    /// Task type
    pub task_type: TaskType,
    /// Base model the adapter was trained on
    pub base_model_name_or_path: Option<String>,
    /// Rank
    pub r: usize,
    /// Alpha
    pub lora_alpha: f64,
    /// Dropout
    pub lora_dropout: f32,
    /// Adapted modules
    pub target_modules: Vec<String>,
    /// Bias handling
    pub bias: BiasType,
    /// Weights stored as `(in, out)` instead of `(out, in)`
    pub fan_in_fan_out: bool,
    /// Saved for inference
    pub inference_mode: bool,
}

impl AdapterConfig {
    /// Write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read from JSON
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl From<&AdapterConfig> for LoraConfig {
    fn from(adapter: &AdapterConfig) -> Self {
        Self {
            r: adapter.r,
            lora_alpha: adapter.lora_alpha,
            lora_dropout: adapter.lora_dropout,
            target_modules: adapter.target_modules.clone(),
            bias: adapter.bias,
            task_type: adapter.task_type,
        }
    }
}
