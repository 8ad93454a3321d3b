//! Batches fed to training and validation steps

use candle_core::Tensor;

use crate::error::{Error, Result};

/// One batch of token data.
///
/// `input_ids` is always present; every other field is optional and checked
/// only when a step needs it.
#[derive(Debug, Clone)]
pub struct Batch {
    input_ids: Tensor,
    attention_mask: Option<Tensor>,
    targets: Option<Tensor>,
    label_mask: Option<Tensor>,
    labels: Option<Tensor>,
}

impl Batch {
    /// Batch of `(batch, seq)` token ids
    pub fn new(input_ids: Tensor) -> Self {
        Self {
            input_ids,
            attention_mask: None,
            targets: None,
            label_mask: None,
            labels: None,
        }
    }

    /// 1 for real tokens, 0 for padding
    pub fn with_attention_mask(mut self, mask: Tensor) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    /// Next-token targets used by the training loss
    pub fn with_targets(mut self, targets: Tensor) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Positions that count towards loss and accuracy
    pub fn with_label_mask(mut self, mask: Tensor) -> Self {
        self.label_mask = Some(mask);
        self
    }

    /// Reference labels used by validation
    pub fn with_labels(mut self, labels: Tensor) -> Self {
        self.labels = Some(labels);
        self
    }

    pub fn input_ids(&self) -> &Tensor {
        &self.input_ids
    }

    pub fn attention_mask(&self) -> Option<&Tensor> {
        self.attention_mask.as_ref()
    }

    pub fn label_mask(&self) -> Option<&Tensor> {
        self.label_mask.as_ref()
    }

    /// Targets, or [`Error::MissingBatchField`]
    pub fn targets(&self) -> Result<&Tensor> {
        self.targets
            .as_ref()
            .ok_or(Error::MissingBatchField("targets"))
    }

    /// Labels for validation, falling back to the targets
    pub fn labels(&self) -> Result<&Tensor> {
        self.labels
            .as_ref()
            .or(self.targets.as_ref())
            .ok_or(Error::MissingBatchField("labels"))
    }

    /// Number of sequences
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
