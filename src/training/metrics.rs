//! Evaluation metrics

use candle_core::{DType, Tensor, D};

use crate::error::{Error, Result};

/// Fraction of positions where the argmax of `logits` equals `labels`.
///
/// With a mask only the selected positions are counted. The result is in `[0, 1]`.
pub fn accuracy(logits: &Tensor, labels: &Tensor, mask: Option<&Tensor>) -> Result<f64> {
    let predictions = logits.argmax(D::Minus1)?.flatten_all()?;
    let labels = labels.to_dtype(DType::U32)?.flatten_all()?;
    if predictions.dims() != labels.dims() {
        return Err(Error::invalid_input(format!(
            "labels shape does not match predictions: {:?} vs {:?}",
            labels.dims(),
            predictions.dims()
        )));
    }
    let correct = predictions.eq(&labels)?.to_dtype(DType::F32)?;

    let (hits, total) = match mask {
        Some(mask) => {
            let mask = mask.to_dtype(DType::F32)?.flatten_all()?;
            if mask.dims() != correct.dims() {
                return Err(Error::invalid_input("label_mask shape does not match labels"));
            }
            let hits = (&correct * &mask)?.sum_all()?.to_scalar::<f32>()?;
            (hits, mask.sum_all()?.to_scalar::<f32>()?)
        }
        None => (correct.sum_all()?.to_scalar::<f32>()?, correct.elem_count() as f32),
    };
    if total <= 0.0 {
        return Err(Error::invalid_input("No positions to score"));
    }
    Ok((hits / total) as f64)
}

/// `exp(loss)` for a mean token-level cross-entropy
pub fn perplexity(mean_loss: f64) -> f64 {
    mean_loss.exp()
}
