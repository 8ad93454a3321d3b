//! Training hyperparameters

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings for the fine-tuning loop
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Passes over the training set
    pub num_epochs: usize,
    /// Sequences per optimizer step
    pub batch_size: usize,
    /// AdamW learning rate
    pub learning_rate: f64,
    /// AdamW decoupled weight decay
    pub weight_decay: f64,
    /// Longest tokenized input; longer records are truncated
    pub max_length: usize,
    /// Log the running loss every N steps
    pub log_steps: usize,
    /// Shuffle seed
    pub seed: u64,
    /// Reshuffle training records each epoch
    pub shuffle: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            num_epochs: 3,
            batch_size: 8,
            learning_rate: 1e-4,
            weight_decay: 0.0,
            max_length: 512,
            log_steps: 10,
            seed: 42,
            shuffle: true,
        }
    }
}

impl TrainingConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::config("Number of epochs must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("Batch size must be greater than 0"));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("Learning rate must be positive"));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::config("Weight decay must be non-negative"));
        }
        if self.max_length < 2 {
            return Err(Error::config("max_length must be at least 2"));
        }
        if self.log_steps == 0 {
            return Err(Error::config("log_steps must be greater than 0"));
        }
        Ok(())
    }
}
