//! Token-level cross-entropy with an optional label mask

use candle_core::{DType, Tensor, D};
use candle_nn as nn;

use crate::error::{Error, Result};

/// Cross-entropy over next-token logits.
///
/// Logits are `(..., vocab)` and targets hold one class id per leading
/// position. With a mask, the loss is the mean over positions where the mask
/// is non-zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Create the loss
    pub fn new() -> Self {
        Self
    }

    /// Rank-0 F32 loss
    pub fn forward(&self, logits: &Tensor, targets: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let vocab = logits.dim(D::Minus1)?;
        let flat_logits = logits.to_dtype(DType::F32)?.reshape(((), vocab))?;
        let flat_targets = targets.to_dtype(DType::U32)?.flatten_all()?;
        let positions = flat_logits.dim(0)?;
        if flat_targets.dim(0)? != positions {
            return Err(Error::invalid_input(format!(
                "targets shape {:?} does not match logits shape {:?}",
                targets.dims(),
                logits.dims()
            )));
        }

        let log_probs = nn::ops::log_softmax(&flat_logits, D::Minus1)?;
        let nll = log_probs
            .gather(&flat_targets.unsqueeze(1)?, 1)?
            .squeeze(1)?
            .neg()?;

        match mask {
            None => Ok(nll.mean_all()?),
            Some(mask) => {
                let flat_mask = mask.to_dtype(DType::F32)?.flatten_all()?;
                if flat_mask.dim(0)? != positions {
                    return Err(Error::invalid_input(format!(
                        "label_mask shape {:?} does not match targets shape {:?}",
                        mask.dims(),
                        targets.dims()
                    )));
                }
                let count = flat_mask.sum_all()?.to_scalar::<f32>()?;
                if count <= 0.0 {
                    return Err(Error::invalid_input("label_mask selects no positions"));
                }
                Ok((nll * flat_mask)?.sum_all()?.affine(1.0 / count as f64, 0.0)?)
            }
        }
    }
}
