//! Fine-tuning engines for causal language models
//!
//! An engine owns a model, its tokenizer and the loss, and exposes one
//! training step, one validation step and checkpoint saving:
//!
//! - [`CausalEngine`] trains the whole model, or a frozen 8-bit base.
//! - [`CausalLoraEngine`] wraps a [`CausalEngine`] and trains LoRA adapters only.
//!
//! ```rust,ignore
//! use causal_tune::engine::{CausalLoraEngine, Engine, EngineOptions};
//!
//! let engine = CausalLoraEngine::load(EngineOptions::from_model_name("my-org/tiny-llama"), None).await?;
//! let loss = engine.training_step(&batch)?;
//! let accuracy = engine.validation_step(&batch)?;
//! engine.save(Path::new("out/adapter"))?;
//! ```

pub mod batch;
pub mod causal;
pub mod lora;

#[cfg(test)]
mod tests;

pub use batch::Batch;
pub use causal::{CausalEngine, EngineOptions};
pub use lora::CausalLoraEngine;

use candle_core::{Tensor, Var};
use std::path::Path;
use tokenizers::Tokenizer;

use crate::error::Result;
use crate::model::CausalLm;

/// Operations shared by every engine
pub trait Engine {
    /// Forward pass and loss; returns a rank-0 F32 tensor ready for `backward`
    fn training_step(&self, batch: &Batch) -> Result<Tensor>;

    /// Forward pass in eval mode; returns argmax accuracy in `[0, 1]`
    fn validation_step(&self, batch: &Batch) -> Result<f64>;

    /// Write a checkpoint into `dir`, creating it if needed
    fn save(&self, dir: &Path) -> Result<()>;

    /// Variables the optimizer should update
    fn trainable_vars(&self) -> Vec<Var>;

    fn tokenizer(&self) -> &Tokenizer;

    fn model(&self) -> &CausalLm;
}
