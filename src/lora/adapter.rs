//! Trainable low-rank update attached to a frozen projection

use candle_core::Tensor;
use candle_nn::{init, Init, VarBuilder};

use crate::error::Result;
use crate::model::ForwardContext;

use super::LoraConfig;

/// LoRA matrices for one projection.
///
/// `lora_a` is `(r, in_features)`, `lora_b` is `(out_features, r)`; the update
/// is `scaling * B @ A`. B starts at zero so injection leaves outputs unchanged.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    lora_a: Tensor,
    lora_b: Tensor,
    scaling: f64,
    dropout: f32,
}

impl LoraAdapter {
    /// Create adapter variables under `vb`, named `lora_A.weight` / `lora_B.weight`
    pub fn new(
        in_features: usize,
        out_features: usize,
        config: &LoraConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let lora_a = vb.pp("lora_A").get_with_hints(
            (config.r, in_features),
            "weight",
            init::DEFAULT_KAIMING_UNIFORM,
        )?;
        let lora_b = vb
            .pp("lora_B")
            .get_with_hints((out_features, config.r), "weight", Init::Const(0.0))?;
        Ok(Self {
            lora_a,
            lora_b,
            scaling: config.scaling_factor(),
            dropout: config.lora_dropout,
        })
    }

    /// Rank of the update
    pub fn rank(&self) -> usize {
        self.lora_a.dims()[0]
    }

    /// alpha / r
    pub fn scaling(&self) -> f64 {
        self.scaling
    }

    /// Number of trainable elements
    pub fn num_parameters(&self) -> usize {
        self.lora_a.elem_count() + self.lora_b.elem_count()
    }

    /// Dense `scaling * B @ A` update, shaped like the base weight
    pub fn delta_weight(&self) -> Result<Tensor> {
        Ok(self.lora_b.matmul(&self.lora_a)?.affine(self.scaling, 0.0)?)
    }

    /// Low-rank contribution for `xs`, in the dtype of `xs`
    pub fn forward(&self, xs: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let xs = if ctx.train && self.dropout > 0.0 {
            candle_nn::ops::dropout(xs, self.dropout)?
        } else {
            xs.clone()
        };
        let a = self.lora_a.to_dtype(xs.dtype())?;
        let b = self.lora_b.to_dtype(xs.dtype())?;
        let hidden = xs.broadcast_matmul(&a.t()?)?;
        Ok(hidden.broadcast_matmul(&b.t()?)?.affine(self.scaling, 0.0)?)
    }
}
