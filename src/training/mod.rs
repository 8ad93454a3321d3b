//! Training infrastructure for causal LM fine-tuning
//!
//! - **Loss**: token cross-entropy with an optional label mask
//! - **Metrics**: argmax accuracy and perplexity
//! - **Data**: JSONL text records and a collator producing padded batches
//! - **Trainer**: AdamW loop over an engine's trainable variables
//!
//! ```rust,ignore
//! use causal_tune::training::{load_jsonl, Trainer, TrainingConfig};
//!
//! let records = load_jsonl(Path::new("data/train.jsonl")).await?;
//! let mut trainer = Trainer::new(&engine, TrainingConfig::default())?;
//! let summary = trainer.train(&records, None)?;
//! ```

pub mod config;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod trainer;

pub use config::TrainingConfig;
pub use data::{batch_indices, load_jsonl, Collator, TextRecord};
pub use loss::CrossEntropyLoss;
pub use metrics::{accuracy, perplexity};
pub use trainer::{evaluate, EpochMetrics, Trainer, TrainingState, TrainingSummary, SUMMARY_FILENAME};
