//! Causal language model configuration (`config.json`)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_model_type() -> String {
    "llama".to_string()
}

/// `eos_token_id` is a single id in most checkpoints and a list in some
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum EosTokenId {
    /// One end-of-sequence id
    Single(u32),
    /// Several accepted end-of-sequence ids
    Multiple(Vec<u32>),
}

/// Architecture hyperparameters of a Llama-style decoder.
///
/// Field names follow the Hugging Face `config.json` layout so pretrained
/// checkpoints can be read without conversion. Unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CausalLmConfig {
    /// Model family tag
    #[serde(default = "default_model_type")]
    pub model_type: String,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Hidden (residual stream) size
    pub hidden_size: usize,
    /// MLP inner size
    pub intermediate_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Number of query heads
    pub num_attention_heads: usize,
    /// Number of key/value heads (grouped-query attention)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    /// Longest supported sequence
    pub max_position_embeddings: usize,
    /// RMSNorm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    /// Rotary embedding base
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    /// Share the embedding matrix with the LM head
    #[serde(default)]
    pub tie_word_embeddings: bool,
    /// Beginning-of-sequence token id
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    /// End-of-sequence token id(s)
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
    /// Padding token id
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

impl CausalLmConfig {
    /// Read and validate a `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the dimensions are consistent
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 || self.hidden_size == 0 || self.num_hidden_layers == 0 {
            return Err(Error::config(
                "vocab_size, hidden_size and num_hidden_layers must be > 0",
            ));
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::config("Rotary embeddings need an even head dimension"));
        }
        let kv_heads = self.kv_heads();
        if kv_heads == 0 || self.num_attention_heads % kv_heads != 0 {
            return Err(Error::config(format!(
                "num_attention_heads {} is not a multiple of num_key_value_heads {}",
                self.num_attention_heads, kv_heads
            )));
        }
        if self.max_position_embeddings == 0 {
            return Err(Error::config("max_position_embeddings must be > 0"));
        }
        Ok(())
    }

    /// Per-head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Key/value head count, defaulting to full multi-head attention
    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// A tiny configuration for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            model_type: default_model_type(),
            vocab_size,
            hidden_size: 64,
            intermediate_size: 128,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            num_key_value_heads: Some(2),
            max_position_embeddings: 128,
            rms_norm_eps: default_rms_norm_eps(),
            rope_theta: default_rope_theta(),
            tie_word_embeddings: false,
            bos_token_id: None,
            eos_token_id: None,
            pad_token_id: None,
        }
    }
}
