//! Full-precision and 8-bit causal LM engine

use candle_core::{Device, Tensor, Var};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::model::loader::{self, ModelFiles, CONFIG_FILENAME, WEIGHTS_FILENAME};
use crate::model::{CausalLm, ForwardContext};
use crate::training::{accuracy, CrossEntropyLoss};
use crate::utils::{autocast_dtype, default_dtype, ensure_dir_exists, select_device, DeviceType};

use super::{Batch, Engine};

/// Where the engine gets its model and tokenizer from.
///
/// Sources are tried in order: `weights_path`, then `model` with `tokenizer`,
/// then `model_name`.
#[derive(Default)]
pub struct EngineOptions {
    /// Hub model id or local checkpoint directory
    pub model_name: Option<String>,
    /// Existing directory holding a saved checkpoint
    pub weights_path: Option<PathBuf>,
    /// Already constructed model
    pub model: Option<CausalLm>,
    /// Tokenizer to pair with `model`
    pub tokenizer: Option<Tokenizer>,
    /// Quantize projections to 8-bit and train under autocast
    pub load_8bit: bool,
    /// Target device; picked automatically when unset
    pub device: Option<Device>,
    /// Score validation accuracy only where `label_mask` is set
    pub masked_accuracy: bool,
}

impl EngineOptions {
    /// Load by Hub id or local directory name
    pub fn from_model_name(model_name: impl Into<String>) -> Self {
        Self {
            model_name: Some(model_name.into()),
            ..Self::default()
        }
    }

    /// Load from a saved checkpoint directory
    pub fn from_weights_path(path: impl Into<PathBuf>) -> Self {
        Self {
            weights_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Use an in-memory model and tokenizer
    pub fn from_pretrained(model: CausalLm, tokenizer: Tokenizer) -> Self {
        Self {
            model: Some(model),
            tokenizer: Some(tokenizer),
            ..Self::default()
        }
    }

    pub fn with_8bit(mut self, load_8bit: bool) -> Self {
        self.load_8bit = load_8bit;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_masked_accuracy(mut self, masked_accuracy: bool) -> Self {
        self.masked_accuracy = masked_accuracy;
        self
    }
}

/// Engine that fine-tunes every weight of a causal LM (or, in 8-bit mode,
/// keeps the quantized base frozen)
pub struct CausalEngine {
    model: CausalLm,
    tokenizer: Tokenizer,
    loss_fn: CrossEntropyLoss,
    load_8bit: bool,
    masked_accuracy: bool,
    model_name: Option<String>,
}

impl CausalEngine {
    /// Resolve the model source and build the engine
    #[instrument(skip(options), fields(load_8bit = options.load_8bit))]
    pub async fn load(options: EngineOptions) -> Result<Self> {
        let EngineOptions {
            model_name,
            weights_path,
            model,
            tokenizer,
            load_8bit,
            device,
            masked_accuracy,
        } = options;
        let device = match device {
            Some(device) => device,
            None => select_device(DeviceType::Auto, 0)?,
        };

        let (model, tokenizer, model_name) = if let Some(path) = weights_path {
            info!("Loading weights from {}", path.display());
            let files = loader::resolve_local(&path).await?;
            let model = Self::load_files(&files, &device, load_8bit).await?;
            let tokenizer = loader::load_tokenizer(&files.tokenizer)?;
            (model, tokenizer, model_name.or_else(|| Some(path.display().to_string())))
        } else if let (Some(model), Some(tokenizer)) = (model, tokenizer) {
            debug!("Using supplied model and tokenizer");
            if load_8bit && !model.is_quantized() {
                warn!("load_8bit is set but the supplied model is not quantized; using it as-is");
            }
            (model, tokenizer, model_name)
        } else if let Some(name) = model_name {
            info!("Loading model {}", name);
            let files = loader::resolve_model_name(&name).await?;
            let model = Self::load_files(&files, &device, load_8bit).await?;
            let tokenizer = loader::load_tokenizer(&files.tokenizer)?;
            (model, tokenizer, Some(name))
        } else {
            return Err(Error::MissingModelSource);
        };

        Ok(Self {
            model,
            tokenizer,
            loss_fn: CrossEntropyLoss::new(),
            load_8bit,
            masked_accuracy,
            model_name,
        })
    }

    async fn load_files(files: &ModelFiles, device: &Device, load_8bit: bool) -> Result<CausalLm> {
        let mut model = loader::load_model(files, default_dtype(device), device).await?;
        if load_8bit {
            model.quantize_8bit()?;
        }
        Ok(model)
    }

    pub fn model_mut(&mut self) -> &mut CausalLm {
        &mut self.model
    }

    /// Whether the base was loaded in 8-bit
    pub fn load_8bit(&self) -> bool {
        self.load_8bit
    }

    /// Name or path the model was loaded from
    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    fn training_context(&self) -> ForwardContext {
        let autocast = if self.load_8bit {
            autocast_dtype(self.model.device())
        } else {
            None
        };
        ForwardContext::train().with_autocast(autocast)
    }
}

impl Engine for CausalEngine {
    fn training_step(&self, batch: &Batch) -> Result<Tensor> {
        let ctx = self.training_context();
        let logits = self
            .model
            .forward(batch.input_ids(), batch.attention_mask(), &ctx)?;
        self.loss_fn
            .forward(&logits, batch.targets()?, batch.label_mask())
    }

    fn validation_step(&self, batch: &Batch) -> Result<f64> {
        let logits = self.model.forward(
            batch.input_ids(),
            batch.attention_mask(),
            &ForwardContext::eval(),
        )?;
        let mask = if self.masked_accuracy {
            batch.label_mask()
        } else {
            None
        };
        accuracy(&logits, batch.labels()?, mask)
    }

    #[instrument(skip(self))]
    fn save(&self, dir: &Path) -> Result<()> {
        ensure_dir_exists(dir)?;
        self.model.save_safetensors(dir.join(WEIGHTS_FILENAME))?;
        self.model.config().save(dir.join(CONFIG_FILENAME))?;
        loader::save_tokenizer(&self.tokenizer, dir)?;
        info!("Saved model to {}", dir.display());
        Ok(())
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.model.trainable_vars()
    }

    fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    fn model(&self) -> &CausalLm {
        &self.model
    }
}
