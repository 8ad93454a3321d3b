//! Causal LM engine that trains LoRA adapters over a frozen base

use candle_core::{Tensor, Var};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::lora::{AdapterConfig, LoraConfig, ADAPTER_CONFIG_FILENAME, ADAPTER_WEIGHTS_FILENAME};
use crate::model::{loader, CausalLm};
use crate::utils::ensure_dir_exists;

use super::{Batch, CausalEngine, Engine, EngineOptions};

/// [`CausalEngine`] with LoRA adapters injected.
///
/// Uses rank 8, alpha 32, dropout 0.05, no bias. Only adapter matrices are
/// trainable; steps run through the wrapped engine unchanged.
pub struct CausalLoraEngine {
    inner: CausalEngine,
    lora_config: LoraConfig,
}

impl CausalLoraEngine {
    /// Load the base engine, then inject adapters into `target_modules`
    /// (`q_proj` and `v_proj` when `None`)
    pub async fn load(options: EngineOptions, target_modules: Option<Vec<String>>) -> Result<Self> {
        let engine = CausalEngine::load(options).await?;
        Self::from_engine(engine, LoraConfig::causal_lm(target_modules))
    }

    /// Wrap an already loaded engine
    #[instrument(skip(engine, lora_config), fields(targets = ?lora_config.target_modules))]
    pub fn from_engine(mut engine: CausalEngine, lora_config: LoraConfig) -> Result<Self> {
        engine.model_mut().inject_lora(&lora_config)?;
        let counts = engine.model().parameter_counts();
        info!("{}", counts);
        Ok(Self {
            inner: engine,
            lora_config,
        })
    }

    /// Wrap an engine and restore adapters saved by [`Engine::save`]
    pub fn from_adapter_dir(engine: CausalEngine, dir: &Path) -> Result<Self> {
        let adapter_config = AdapterConfig::from_file(dir.join(ADAPTER_CONFIG_FILENAME))?;
        if adapter_config.peft_type != "LORA" {
            return Err(Error::lora(format!(
                "Unsupported adapter type {}",
                adapter_config.peft_type
            )));
        }
        let mut engine = Self::from_engine(engine, LoraConfig::from(&adapter_config))?;
        engine
            .inner
            .model_mut()
            .load_adapter_safetensors(dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        info!("Restored LoRA adapters from {}", dir.display());
        Ok(engine)
    }

    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora_config
    }

    /// The wrapped engine
    pub fn inner(&self) -> &CausalEngine {
        &self.inner
    }
}

impl Engine for CausalLoraEngine {
    fn training_step(&self, batch: &Batch) -> Result<Tensor> {
        self.inner.training_step(batch)
    }

    fn validation_step(&self, batch: &Batch) -> Result<f64> {
        self.inner.validation_step(batch)
    }

    /// Writes adapter weights, `adapter_config.json` and the tokenizer
    #[instrument(skip(self))]
    fn save(&self, dir: &Path) -> Result<()> {
        ensure_dir_exists(dir)?;
        self.inner
            .model()
            .save_adapter_safetensors(dir.join(ADAPTER_WEIGHTS_FILENAME))?;
        self.lora_config
            .adapter_config(self.inner.model_name().map(str::to_string))
            .save(dir.join(ADAPTER_CONFIG_FILENAME))?;
        loader::save_tokenizer(self.inner.tokenizer(), dir)?;
        info!("Saved LoRA adapter to {}", dir.display());
        Ok(())
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.inner.trainable_vars()
    }

    fn tokenizer(&self) -> &Tokenizer {
        self.inner.tokenizer()
    }

    fn model(&self) -> &CausalLm {
        self.inner.model()
    }
}
