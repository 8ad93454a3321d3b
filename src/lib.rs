//! causal-tune: fine-tuning engines for causal language models
//!
//! Loads a Llama-style decoder from a checkpoint directory, the Hugging Face
//! Hub or memory, optionally quantized to 8-bit, and fine-tunes it either in
//! full or through LoRA adapters.

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod lora;
pub mod model;
pub mod training;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports
pub use config::RunConfig;
pub use engine::{Batch, CausalEngine, CausalLoraEngine, Engine, EngineOptions};
pub use error::{Error, Result};
pub use lora::LoraConfig;
pub use model::{CausalLm, CausalLmConfig, ForwardContext};
pub use training::{Trainer, TrainingConfig};
