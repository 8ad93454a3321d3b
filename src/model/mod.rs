//! Decoder-only causal language model and checkpoint loading

pub mod causal_lm;
pub mod config;
pub mod layers;
pub mod loader;

pub use causal_lm::{CausalLm, ParameterCounts, WeightInit};
pub use config::{CausalLmConfig, EosTokenId};
pub use layers::{ForwardContext, Projection, ProjectionWeight, RmsNorm, RotaryEmbedding};
pub use loader::{load_model, load_tokenizer, resolve_local, resolve_model_name, save_tokenizer, ModelFiles};
