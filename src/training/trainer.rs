//! Fine-tuning loop over an [`Engine`]

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};

use super::config::TrainingConfig;
use super::data::{batch_indices, Collator, TextRecord};
use super::metrics::perplexity;

/// File the trainer writes next to the saved checkpoint
pub const SUMMARY_FILENAME: &str = "training_summary.json";

/// Progress through a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current epoch (0-based)
    pub epoch: usize,
    /// Optimizer steps taken
    pub global_step: usize,
    /// Best validation accuracy seen
    pub best_accuracy: Option<f64>,
}

/// Per-epoch results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Mean training loss over the epoch
    pub train_loss: f64,
    pub train_perplexity: f64,
    pub validation_accuracy: Option<f64>,
    pub duration_secs: f64,
}

/// Outcome of [`Trainer::train`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs: Vec<EpochMetrics>,
    pub global_step: usize,
    pub best_accuracy: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TrainingSummary {
    /// Write as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Drives an engine with AdamW over its trainable variables
pub struct Trainer<'a, E: Engine> {
    engine: &'a E,
    config: TrainingConfig,
    collator: Collator,
    optimizer: AdamW,
    device: Device,
    state: TrainingState,
}

impl<'a, E: Engine> Trainer<'a, E> {
    pub fn new(engine: &'a E, config: TrainingConfig) -> Result<Self> {
        config.validate()?;
        let vars = engine.trainable_vars();
        if vars.is_empty() {
            return Err(Error::config(
                "Model has no trainable parameters; 8-bit models need LoRA to be trained",
            ));
        }
        let num_params: usize = vars.iter().map(|v| v.elem_count()).sum();
        debug!("Optimizing {} variables ({} parameters)", vars.len(), num_params);

        let optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;
        let collator = Collator::new(engine.tokenizer().clone(), config.max_length)?;
        let device = engine.model().device().clone();
        Ok(Self {
            engine,
            config,
            collator,
            optimizer,
            device,
            state: TrainingState::default(),
        })
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Run all epochs, validating after each one when validation records are given
    #[instrument(skip_all, fields(train = train.len(), epochs = self.config.num_epochs))]
    pub fn train(
        &mut self,
        train: &[TextRecord],
        validation: Option<&[TextRecord]>,
    ) -> Result<TrainingSummary> {
        if train.is_empty() {
            return Err(Error::invalid_input("Training set is empty"));
        }
        let started_at = Utc::now();
        let mut epochs = Vec::with_capacity(self.config.num_epochs);

        for epoch in 0..self.config.num_epochs {
            self.state.epoch = epoch;
            let start = Instant::now();
            let train_loss = self.train_epoch(train)?;

            let validation_accuracy = match validation {
                Some(records) if !records.is_empty() => {
                    let accuracy = self.evaluate(records)?;
                    if self.state.best_accuracy.map_or(true, |best| accuracy > best) {
                        self.state.best_accuracy = Some(accuracy);
                    }
                    Some(accuracy)
                }
                _ => None,
            };

            let metrics = EpochMetrics {
                epoch,
                train_loss,
                train_perplexity: perplexity(train_loss),
                validation_accuracy,
                duration_secs: start.elapsed().as_secs_f64(),
            };
            info!(
                "Epoch {}/{} - loss: {:.4}, ppl: {:.2}, val acc: {}, {:.1}s",
                epoch + 1,
                self.config.num_epochs,
                metrics.train_loss,
                metrics.train_perplexity,
                metrics
                    .validation_accuracy
                    .map_or_else(|| "n/a".to_string(), |a| format!("{:.4}", a)),
                metrics.duration_secs
            );
            epochs.push(metrics);
        }

        Ok(TrainingSummary {
            epochs,
            global_step: self.state.global_step,
            best_accuracy: self.state.best_accuracy,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn train_epoch(&mut self, records: &[TextRecord]) -> Result<f64> {
        let shuffle = self
            .config
            .shuffle
            .then(|| self.config.seed.wrapping_add(self.state.epoch as u64));
        let mut total_loss = 0.0;
        let mut num_batches = 0usize;

        for indices in batch_indices(records.len(), self.config.batch_size, shuffle) {
            let chunk: Vec<TextRecord> = indices.iter().map(|&i| records[i].clone()).collect();
            let batch = match self.collator.collate(&chunk, &self.device) {
                Ok(batch) => batch,
                Err(Error::InvalidInput(msg)) => {
                    warn!("Skipping batch: {}", msg);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let loss = self.engine.training_step(&batch)?;
            self.optimizer.backward_step(&loss)?;
            let loss = loss.to_scalar::<f32>()? as f64;
            if !loss.is_finite() {
                return Err(Error::internal(format!(
                    "Loss became {} at step {}",
                    loss, self.state.global_step
                )));
            }

            total_loss += loss;
            num_batches += 1;
            self.state.global_step += 1;
            if self.state.global_step % self.config.log_steps == 0 {
                info!(
                    "Step {} - loss: {:.4}, running mean: {:.4}",
                    self.state.global_step,
                    loss,
                    total_loss / num_batches as f64
                );
            }
        }

        if num_batches == 0 {
            return Err(Error::invalid_input("No usable training batches"));
        }
        Ok(total_loss / num_batches as f64)
    }

    /// Mean validation accuracy, weighted by batch size
    pub fn evaluate(&self, records: &[TextRecord]) -> Result<f64> {
        evaluate(self.engine, &self.collator, records, self.config.batch_size)
    }
}

/// Accuracy of `engine` over `records`, weighted by batch size
pub fn evaluate<E: Engine>(
    engine: &E,
    collator: &Collator,
    records: &[TextRecord],
    batch_size: usize,
) -> Result<f64> {
    let device = engine.model().device().clone();
    let mut weighted = 0.0;
    let mut seen = 0usize;
    for chunk in records.chunks(batch_size.max(1)) {
        let batch = match collator.collate(chunk, &device) {
            Ok(batch) => batch,
            Err(Error::InvalidInput(msg)) => {
                warn!("Skipping validation batch: {}", msg);
                continue;
            }
            Err(e) => return Err(e),
        };
        let accuracy = engine.validation_step(&batch)?;
        weighted += accuracy * batch.len() as f64;
        seen += batch.len();
    }
    if seen == 0 {
        return Err(Error::invalid_input("No usable validation records"));
    }
    Ok(weighted / seen as f64)
}
