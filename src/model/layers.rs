//! Building blocks of the decoder: projections, normalization, rotary embeddings

use candle_core::quantized::{GgmlDType, QTensor};
use candle_core::{DType, Device, Tensor, D};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::lora::LoraAdapter;

/// Per-call forward settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardContext {
    /// Training mode enables dropout in adapters
    pub train: bool,
    /// Mixed-precision compute dtype; `None` computes in the weights' dtype
    pub compute_dtype: Option<DType>,
}

impl ForwardContext {
    /// Evaluation mode, no autocast
    pub fn eval() -> Self {
        Self::default()
    }

    /// Training mode, no autocast
    pub fn train() -> Self {
        Self {
            train: true,
            compute_dtype: None,
        }
    }

    /// Run inside an autocast context with the given compute dtype
    pub fn with_autocast(mut self, dtype: Option<DType>) -> Self {
        self.compute_dtype = dtype;
        self
    }
}

/// Storage of a projection's base weight, laid out `(out_features, in_features)`
#[derive(Debug, Clone)]
pub enum ProjectionWeight {
    /// Full or half precision tensor
    Dense(Tensor),
    /// 8-bit block-quantized tensor
    Quantized(Arc<QTensor>),
}

/// A bias-free linear projection, optionally carrying a LoRA adapter
#[derive(Debug, Clone)]
pub struct Projection {
    name: String,
    weight: ProjectionWeight,
    adapter: Option<LoraAdapter>,
}

impl Projection {
    /// Wrap a dense `(out, in)` weight
    pub fn new(name: impl Into<String>, weight: Tensor) -> Self {
        Self {
            name: name.into(),
            weight: ProjectionWeight::Dense(weight),
            adapter: None,
        }
    }

    /// Module path, e.g. `model.layers.0.self_attn.q_proj`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Safetensors key of the base weight
    pub fn weight_key(&self) -> String {
        format!("{}.weight", self.name)
    }

    /// `(out_features, in_features)`
    pub fn dims(&self) -> Result<(usize, usize)> {
        let dims = match &self.weight {
            ProjectionWeight::Dense(w) => w.dims2()?,
            ProjectionWeight::Quantized(q) => q.shape().dims2()?,
        };
        Ok(dims)
    }

    /// Number of base weight elements
    pub fn num_parameters(&self) -> usize {
        match &self.weight {
            ProjectionWeight::Dense(w) => w.elem_count(),
            ProjectionWeight::Quantized(q) => q.shape().elem_count(),
        }
    }

    /// Whether the base weight is stored quantized
    pub fn is_quantized(&self) -> bool {
        matches!(self.weight, ProjectionWeight::Quantized(_))
    }

    /// The injected adapter, if any
    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    /// Attach a LoRA adapter to this projection
    pub fn attach_adapter(&mut self, adapter: LoraAdapter) -> Result<()> {
        if self.adapter.is_some() {
            return Err(Error::lora(format!(
                "{} already carries a LoRA adapter",
                self.name
            )));
        }
        self.adapter = Some(adapter);
        Ok(())
    }

    /// Quantize the base weight to 8-bit blocks.
    ///
    /// Returns `false` and leaves the weight untouched when the input dimension
    /// is not a multiple of the quantization block size.
    pub fn quantize_8bit(&mut self) -> Result<bool> {
        let weight = match &self.weight {
            ProjectionWeight::Dense(w) => w,
            ProjectionWeight::Quantized(_) => return Ok(true),
        };
        let (_, in_features) = weight.dims2()?;
        if in_features % GgmlDType::Q8_0.block_size() != 0 {
            return Ok(false);
        }
        let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
        self.weight = ProjectionWeight::Quantized(Arc::new(qtensor));
        Ok(true)
    }

    /// Stop gradients from flowing into the base weight
    pub fn freeze(&mut self) {
        if let ProjectionWeight::Dense(w) = &self.weight {
            self.weight = ProjectionWeight::Dense(w.detach());
        }
    }

    /// Base weight as a dense tensor (dequantizing if needed)
    pub fn dense_weight(&self, device: &Device) -> Result<Tensor> {
        match &self.weight {
            ProjectionWeight::Dense(w) => Ok(w.clone()),
            ProjectionWeight::Quantized(q) => Ok(q.dequantize(device)?),
        }
    }

    /// `xs @ W^T`, plus the adapter's low-rank update when present
    pub fn forward(&self, xs: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let weight = match &self.weight {
            ProjectionWeight::Dense(w) => w.to_dtype(xs.dtype())?,
            ProjectionWeight::Quantized(q) => q.dequantize(xs.device())?.to_dtype(xs.dtype())?,
        };
        let out = xs.broadcast_matmul(&weight.t()?)?;
        match &self.adapter {
            Some(adapter) => Ok((out + adapter.forward(xs, ctx)?)?),
            None => Ok(out),
        }
    }
}

/// Root-mean-square layer normalization, computed in F32
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    /// Create from a `(hidden,)` scale vector
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    /// Scale vector
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Stop gradients from flowing into the scale
    pub fn freeze(&mut self) {
        self.weight = self.weight.detach();
    }

    /// Normalize over the last dimension
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let rms = xs.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, self.eps)?.sqrt()?;
        let normed = xs
            .broadcast_div(&rms)?
            .broadcast_mul(&self.weight.to_dtype(DType::F32)?)?;
        Ok(normed.to_dtype(dtype)?)
    }
}

/// Precomputed rotary position tables
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    /// Build `(max_positions, head_dim)` cos/sin tables
    pub fn new(head_dim: usize, max_positions: usize, theta: f32, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1f32 / theta.powf(i as f32 / head_dim as f32))
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_positions as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_positions, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: freqs.cos()?,
            sin: freqs.sin()?,
        })
    }

    /// Rotate a `(batch, heads, seq, head_dim)` tensor
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, seq_len, head_dim) = xs.dims4()?;
        let cos = self
            .cos
            .narrow(0, 0, seq_len)?
            .to_dtype(xs.dtype())?
            .reshape((1, 1, seq_len, head_dim))?;
        let sin = self
            .sin
            .narrow(0, 0, seq_len)?
            .to_dtype(xs.dtype())?
            .reshape((1, 1, seq_len, head_dim))?;
        let rotated = rotate_half(xs)?;
        Ok((xs.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?)
    }
}

fn rotate_half(xs: &Tensor) -> Result<Tensor> {
    let last = xs.dim(D::Minus1)?;
    let x1 = xs.narrow(D::Minus1, 0, last / 2)?;
    let x2 = xs.narrow(D::Minus1, last / 2, last - last / 2)?;
    Ok(Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?)
}
