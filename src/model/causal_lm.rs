//! Llama-style decoder-only causal language model

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{init, Init, VarBuilder, VarMap};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::lora::{LoraAdapter, LoraConfig};

use super::config::CausalLmConfig;
use super::layers::{ForwardContext, Projection, RmsNorm, RotaryEmbedding};

/// How freshly created weights are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightInit {
    /// Random initialization for training from scratch
    Random,
    /// Zeros, to be overwritten by pretrained weights
    Zeros,
}

impl WeightInit {
    fn embedding(self) -> Init {
        match self {
            Self::Random => Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
            Self::Zeros => Init::Const(0.0),
        }
    }

    fn linear(self) -> Init {
        match self {
            Self::Random => init::DEFAULT_KAIMING_NORMAL,
            Self::Zeros => Init::Const(0.0),
        }
    }
}

/// Trainable vs total parameter counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterCounts {
    /// Parameters the optimizer updates
    pub trainable: usize,
    /// All parameters, including frozen and quantized ones
    pub total: usize,
}

impl ParameterCounts {
    /// Percentage of trainable parameters
    pub fn trainable_percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            100.0 * self.trainable as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for ParameterCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "trainable params: {} || all params: {} || trainable%: {:.4}",
            self.trainable,
            self.total,
            self.trainable_percent()
        )
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Projection,
    k_proj: Projection,
    v_proj: Projection,
    o_proj: Projection,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    fn new(config: &CausalLmConfig, vb: VarBuilder, prefix: &str, weights: WeightInit) -> Result<Self> {
        let hidden = config.hidden_size;
        let head_dim = config.head_dim();
        let q_out = config.num_attention_heads * head_dim;
        let kv_out = config.kv_heads() * head_dim;
        let proj = |name: &str, out: usize, inp: usize| -> Result<Projection> {
            let weight = vb.pp(name).get_with_hints((out, inp), "weight", weights.linear())?;
            Ok(Projection::new(format!("{}.{}", prefix, name), weight))
        };
        Ok(Self {
            q_proj: proj("q_proj", q_out, hidden)?,
            k_proj: proj("k_proj", kv_out, hidden)?,
            v_proj: proj("v_proj", kv_out, hidden)?,
            o_proj: proj("o_proj", hidden, q_out)?,
            num_heads: config.num_attention_heads,
            num_kv_heads: config.kv_heads(),
            head_dim,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let q = self
            .q_proj
            .forward(xs, ctx)?
            .reshape((b, t, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(xs, ctx)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(xs, ctx)?
            .reshape((b, t, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = rotary.apply(&q)?;
        let k = rotary.apply(&k)?;
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        // Scores and softmax in F32 regardless of the compute dtype
        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = q
            .matmul(&k.t()?.contiguous()?)?
            .to_dtype(DType::F32)?
            .affine(scale, 0.0)?;
        let blocked = Tensor::new(f32::NEG_INFINITY, scores.device())?.broadcast_as(scores.shape())?;
        let mask = mask.broadcast_as(scores.shape())?;
        let scores = mask.where_cond(&blocked, &scores)?;
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?.to_dtype(v.dtype())?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, t, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out, ctx)
    }

    fn projections_mut(&mut self) -> [&mut Projection; 4] {
        [&mut self.q_proj, &mut self.k_proj, &mut self.v_proj, &mut self.o_proj]
    }

    fn projections(&self) -> [&Projection; 4] {
        [&self.q_proj, &self.k_proj, &self.v_proj, &self.o_proj]
    }
}

fn repeat_kv(xs: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(xs);
    }
    let (b, kv_heads, t, d) = xs.dims4()?;
    let repeated = Tensor::cat(&vec![&xs; n_rep], 2)?.reshape((b, kv_heads * n_rep, t, d))?;
    Ok(repeated)
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: Projection,
    up_proj: Projection,
    down_proj: Projection,
}

impl Mlp {
    fn new(config: &CausalLmConfig, vb: VarBuilder, prefix: &str, weights: WeightInit) -> Result<Self> {
        let hidden = config.hidden_size;
        let inner = config.intermediate_size;
        let proj = |name: &str, out: usize, inp: usize| -> Result<Projection> {
            let weight = vb.pp(name).get_with_hints((out, inp), "weight", weights.linear())?;
            Ok(Projection::new(format!("{}.{}", prefix, name), weight))
        };
        Ok(Self {
            gate_proj: proj("gate_proj", inner, hidden)?,
            up_proj: proj("up_proj", inner, hidden)?,
            down_proj: proj("down_proj", hidden, inner)?,
        })
    }

    fn forward(&self, xs: &Tensor, ctx: &ForwardContext) -> Result<Tensor> {
        let gate = self.gate_proj.forward(xs, ctx)?.silu()?;
        let up = self.up_proj.forward(xs, ctx)?;
        self.down_proj.forward(&(gate * up)?, ctx)
    }

    fn projections_mut(&mut self) -> [&mut Projection; 3] {
        [&mut self.gate_proj, &mut self.up_proj, &mut self.down_proj]
    }

    fn projections(&self) -> [&Projection; 3] {
        [&self.gate_proj, &self.up_proj, &self.down_proj]
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    prefix: String,
}

impl DecoderLayer {
    fn new(config: &CausalLmConfig, vb: VarBuilder, prefix: String, weights: WeightInit) -> Result<Self> {
        let norm = |name: &str| -> Result<RmsNorm> {
            let weight = vb
                .pp(name)
                .get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
            Ok(RmsNorm::new(weight, config.rms_norm_eps))
        };
        Ok(Self {
            self_attn: Attention::new(
                config,
                vb.pp("self_attn"),
                &format!("{}.self_attn", prefix),
                weights,
            )?,
            mlp: Mlp::new(config, vb.pp("mlp"), &format!("{}.mlp", prefix), weights)?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            prefix,
        })
    }

    fn forward(
        &self,
        xs: &Tensor,
        mask: &Tensor,
        rotary: &RotaryEmbedding,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let residual = xs;
        let hidden = self.input_layernorm.forward(xs)?;
        let hidden = (self.self_attn.forward(&hidden, mask, rotary, ctx)? + residual)?;
        let residual = &hidden;
        let out = self.post_attention_layernorm.forward(&hidden)?;
        Ok((self.mlp.forward(&out, ctx)? + residual)?)
    }

    fn projections_mut(&mut self) -> impl Iterator<Item = &mut Projection> {
        self.self_attn
            .projections_mut()
            .into_iter()
            .chain(self.mlp.projections_mut())
    }

    fn projections(&self) -> impl Iterator<Item = &Projection> {
        self.self_attn.projections().into_iter().chain(self.mlp.projections())
    }

    fn freeze(&mut self) {
        self.input_layernorm.freeze();
        self.post_attention_layernorm.freeze();
        for proj in self.projections_mut() {
            proj.freeze();
        }
    }
}

/// Decoder-only transformer with an LM head.
///
/// Weights live in a [`VarMap`] so a full-precision model can be fine-tuned
/// end to end. Freezing, 8-bit quantization and LoRA injection rewrite the
/// projections in place.
///
/// Variables are always held in F32 so optimizer state stays finite; `dtype`
/// only selects the precision the forward pass runs in and checkpoints are
/// written in.
pub struct CausalLm {
    config: CausalLmConfig,
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Option<Projection>,
    rotary: RotaryEmbedding,
    varmap: VarMap,
    adapters: Option<(VarMap, LoraConfig)>,
    frozen: bool,
    dtype: DType,
    device: Device,
}

impl std::fmt::Debug for CausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalLm")
            .field("config", &self.config)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("frozen", &self.frozen)
            .field("lora", &self.adapters.as_ref().map(|(_, c)| c))
            .finish()
    }
}

impl CausalLm {
    /// Create a model with fresh weights
    pub fn new(config: CausalLmConfig, dtype: DType, device: &Device, weights: WeightInit) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let model_vb = vb.pp("model");
        let embed_tokens = model_vb.pp("embed_tokens").get_with_hints(
            (config.vocab_size, config.hidden_size),
            "weight",
            weights.embedding(),
        )?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                DecoderLayer::new(
                    &config,
                    model_vb.pp("layers").pp(i),
                    format!("model.layers.{}", i),
                    weights,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let norm_weight = model_vb
            .pp("norm")
            .get_with_hints(config.hidden_size, "weight", Init::Const(1.0))?;
        let norm = RmsNorm::new(norm_weight, config.rms_norm_eps);
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            let weight = vb.pp("lm_head").get_with_hints(
                (config.vocab_size, config.hidden_size),
                "weight",
                weights.linear(),
            )?;
            Some(Projection::new("lm_head", weight))
        };
        let rotary = RotaryEmbedding::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
            device,
        )?;

        debug!(
            "Built {} layer decoder (hidden {}, vocab {})",
            config.num_hidden_layers, config.hidden_size, config.vocab_size
        );

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            varmap,
            adapters: None,
            frozen: false,
            dtype,
            device: device.clone(),
        })
    }

    /// Randomly initialized model
    pub fn random(config: CausalLmConfig, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(config, dtype, device, WeightInit::Random)
    }

    /// Model configuration
    pub fn config(&self) -> &CausalLmConfig {
        &self.config
    }

    /// Device holding the weights
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Compute and checkpoint dtype
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// LoRA configuration, once adapters are injected
    pub fn lora_config(&self) -> Option<&LoraConfig> {
        self.adapters.as_ref().map(|(_, config)| config)
    }

    /// Whether any projection is stored in 8-bit
    pub fn is_quantized(&self) -> bool {
        self.projections().any(Projection::is_quantized)
    }

    fn projections(&self) -> impl Iterator<Item = &Projection> {
        self.layers
            .iter()
            .flat_map(|layer| layer.projections())
            .chain(self.lm_head.iter())
    }

    fn projections_mut(&mut self) -> impl Iterator<Item = &mut Projection> {
        self.layers
            .iter_mut()
            .flat_map(|layer| layer.projections_mut())
            .chain(self.lm_head.iter_mut())
    }

    /// Copy pretrained weights from safetensors files into the model.
    ///
    /// Every weight the model owns must be present in one of the files with a
    /// matching shape; extra entries in the files are ignored.
    #[instrument(skip(self, files))]
    pub fn load_safetensors(&mut self, files: &[impl AsRef<Path>]) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("weight map lock poisoned"))?;
        let mut missing: Vec<&String> = data.keys().collect();

        for file in files {
            let file = file.as_ref();
            debug!("Reading weights from {}", file.display());
            let tensors = candle_core::safetensors::load(file, &self.device)?;
            for (name, tensor) in tensors {
                let Some(var) = data.get(&name) else {
                    continue;
                };
                if tensor.dims() != var.dims() {
                    return Err(Error::model_loading(format!(
                        "Shape mismatch for {}: checkpoint {:?}, model {:?}",
                        name,
                        tensor.dims(),
                        var.dims()
                    )));
                }
                var.set(&tensor.to_dtype(var.dtype())?)?;
                missing.retain(|m| **m != name);
            }
        }

        if !missing.is_empty() {
            missing.sort();
            return Err(Error::model_loading(format!(
                "Checkpoint is missing {} weights, e.g. {}",
                missing.len(),
                missing[0]
            )));
        }
        info!("Loaded {} weight tensors", data.len());
        Ok(())
    }

    /// Stop gradients into every base weight
    pub fn freeze(&mut self) {
        self.embed_tokens = self.embed_tokens.detach();
        self.norm.freeze();
        for layer in &mut self.layers {
            layer.freeze();
        }
        if let Some(head) = &mut self.lm_head {
            head.freeze();
        }
        self.frozen = true;
    }

    /// Quantize the decoder projections to 8-bit and freeze the model.
    ///
    /// The LM head stays in full precision. Returns how many projections were
    /// quantized.
    #[instrument(skip(self))]
    pub fn quantize_8bit(&mut self) -> Result<usize> {
        self.freeze();
        let mut quantized = Vec::new();
        let mut skipped = 0;
        for layer in &mut self.layers {
            for proj in layer.projections_mut() {
                if proj.quantize_8bit()? {
                    quantized.push(proj.weight_key());
                } else {
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            warn!("{} projections kept in full precision (unaligned input size)", skipped);
        }

        // Dense copies are no longer referenced by the forward pass
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::internal("weight map lock poisoned"))?;
        for key in &quantized {
            data.remove(key);
        }
        info!("Quantized {} projections to 8-bit", quantized.len());
        Ok(quantized.len())
    }

    /// Freeze the base model and attach LoRA adapters to every targeted projection.
    ///
    /// Returns the number of adapted projections.
    #[instrument(skip(self, config), fields(r = config.r, targets = ?config.target_modules))]
    pub fn inject_lora(&mut self, config: &LoraConfig) -> Result<usize> {
        config.validate()?;
        if self.adapters.is_some() {
            return Err(Error::lora("LoRA adapters are already injected"));
        }
        self.freeze();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &self.device);
        let mut adapted = 0;
        for proj in self.projections_mut() {
            if !config.is_target_module(proj.name()) {
                continue;
            }
            let (out_features, in_features) = proj.dims()?;
            let prefix = format!("base_model.model.{}", proj.name());
            let adapter = LoraAdapter::new(in_features, out_features, config, vb.pp(prefix))?;
            proj.attach_adapter(adapter)?;
            adapted += 1;
        }

        if adapted == 0 {
            return Err(Error::lora(format!(
                "Target modules {:?} not found in the base model",
                config.target_modules
            )));
        }
        debug!("Attached {} LoRA adapters", adapted);
        self.adapters = Some((varmap, config.clone()));
        Ok(adapted)
    }

    /// Variables the optimizer should update
    pub fn trainable_vars(&self) -> Vec<Var> {
        match &self.adapters {
            Some((varmap, _)) => varmap.all_vars(),
            None if self.frozen => Vec::new(),
            None => self.varmap.all_vars(),
        }
    }

    /// Trainable and total parameter counts
    pub fn parameter_counts(&self) -> ParameterCounts {
        let trainable = self.trainable_vars().iter().map(|v| v.elem_count()).sum();
        let norms: usize = self
            .layers
            .iter()
            .map(|l| l.input_layernorm.weight().elem_count() + l.post_attention_layernorm.weight().elem_count())
            .sum();
        let projections: usize = self.projections().map(Projection::num_parameters).sum();
        let adapters: usize = self
            .projections()
            .filter_map(Projection::adapter)
            .map(LoraAdapter::num_parameters)
            .sum();
        let total = self.embed_tokens.elem_count()
            + self.norm.weight().elem_count()
            + norms
            + projections
            + adapters;
        ParameterCounts { trainable, total }
    }

    /// Base weights keyed by their checkpoint names; quantized weights are dequantized
    pub fn named_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        tensors.insert("model.embed_tokens.weight".to_string(), self.embed_tokens.clone());
        tensors.insert("model.norm.weight".to_string(), self.norm.weight().clone());
        for layer in &self.layers {
            tensors.insert(
                format!("{}.input_layernorm.weight", layer.prefix),
                layer.input_layernorm.weight().clone(),
            );
            tensors.insert(
                format!("{}.post_attention_layernorm.weight", layer.prefix),
                layer.post_attention_layernorm.weight().clone(),
            );
        }
        for proj in self.projections() {
            let weight = proj.dense_weight(&self.device)?.to_dtype(self.dtype)?;
            tensors.insert(proj.weight_key(), weight);
        }
        Ok(tensors)
    }

    /// Write base weights to a safetensors file
    pub fn save_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let tensors = self.named_tensors()?;
        candle_core::safetensors::save(&tensors, path.as_ref())?;
        debug!("Wrote {} tensors to {}", tensors.len(), path.as_ref().display());
        Ok(())
    }

    /// Write adapter weights (PEFT key layout) to a safetensors file
    pub fn save_adapter_safetensors(&self, path: impl AsRef<Path>) -> Result<()> {
        let (varmap, _) = self
            .adapters
            .as_ref()
            .ok_or_else(|| Error::lora("No LoRA adapters to save"))?;
        varmap.save(path.as_ref())?;
        Ok(())
    }

    /// Restore adapter weights written by [`CausalLm::save_adapter_safetensors`]
    pub fn load_adapter_safetensors(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let (varmap, _) = self
            .adapters
            .as_mut()
            .ok_or_else(|| Error::lora("Inject LoRA adapters before loading their weights"))?;
        varmap.load(path.as_ref())?;
        Ok(())
    }

    /// Logits `(batch, seq, vocab)` in F32.
    ///
    /// `attention_mask` is `(batch, seq)` with 1 for real tokens and 0 for padding.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        ctx: &ForwardContext,
    ) -> Result<Tensor> {
        let (b, t) = input_ids.dims2()?;
        if t > self.config.max_position_embeddings {
            return Err(Error::invalid_input(format!(
                "Sequence length {} exceeds max_position_embeddings {}",
                t, self.config.max_position_embeddings
            )));
        }
        let ids = input_ids.to_dtype(DType::U32)?.flatten_all()?;
        let mut hidden = self
            .embed_tokens
            .index_select(&ids, 0)?
            .reshape((b, t, self.config.hidden_size))?
            .to_dtype(ctx.compute_dtype.unwrap_or(self.dtype))?;

        let mask = self.blocked_positions(b, t, attention_mask)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask, &self.rotary, ctx)?;
        }
        let hidden = self.norm.forward(&hidden)?;
        let logits = match &self.lm_head {
            Some(head) => head.forward(&hidden, ctx)?,
            None => hidden.broadcast_matmul(&self.embed_tokens.to_dtype(hidden.dtype())?.t()?)?,
        };
        Ok(logits.to_dtype(DType::F32)?)
    }

    /// Mask with 1 where attention is not allowed, broadcastable to
    /// `(batch, heads, seq, seq)`.
    ///
    /// A query may attend to earlier non-padding keys and always to itself, so
    /// no row is fully blocked.
    fn blocked_positions(&self, b: usize, t: usize, attention_mask: Option<&Tensor>) -> Result<Tensor> {
        let positions = Tensor::arange(0u32, t as u32, &self.device)?;
        let queries = positions.reshape((t, 1))?.broadcast_as((t, t))?;
        let keys = positions.reshape((1, t))?.broadcast_as((t, t))?;
        let future = keys.gt(&queries)?;

        let Some(mask) = attention_mask else {
            return Ok(future.reshape((1, 1, t, t))?);
        };
        if mask.dims2()? != (b, t) {
            return Err(Error::invalid_input(format!(
                "attention_mask shape {:?} does not match input_ids ({}, {})",
                mask.dims(),
                b,
                t
            )));
        }
        let mask = mask.to_dtype(DType::F32)?;
        let padded_keys = mask.eq(&mask.zeros_like()?)?.reshape((b, 1, 1, t))?;
        let off_diagonal = keys.ne(&queries)?;
        let blocked = padded_keys
            .broadcast_mul(&off_diagonal)?
            .broadcast_maximum(&future)?;
        Ok(blocked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Optimizer;

    fn tiny_model() -> CausalLm {
        CausalLm::random(CausalLmConfig::tiny(32), DType::F32, &Device::Cpu).unwrap()
    }

    fn ids(device: &Device) -> Tensor {
        Tensor::new(&[[1u32, 5, 9, 3], [2, 4, 6, 0]], device).unwrap()
    }

    #[test]
    fn test_forward_shape() -> Result<()> {
        let model = tiny_model();
        let logits = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval())?;
        assert_eq!(logits.dims(), &[2, 4, 32]);
        assert_eq!(logits.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn test_causality() -> Result<()> {
        let model = tiny_model();
        let device = Device::Cpu;
        let a = Tensor::new(&[[1u32, 5, 9, 3]], &device)?;
        let b = Tensor::new(&[[1u32, 5, 9, 7]], &device)?;
        let la = model.forward(&a, None, &ForwardContext::eval())?.narrow(1, 0, 3)?;
        let lb = model.forward(&b, None, &ForwardContext::eval())?.narrow(1, 0, 3)?;
        let diff = (la - lb)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "earlier positions changed: {}", diff);
        Ok(())
    }

    #[test]
    fn test_padding_keys_are_ignored() -> Result<()> {
        let model = tiny_model();
        let device = Device::Cpu;
        // The last real token must not see the padded key before it
        let mask = Tensor::new(&[[1u32, 0, 1]], &device)?;
        let a = Tensor::new(&[[4u32, 8, 2]], &device)?;
        let b = Tensor::new(&[[4u32, 11, 2]], &device)?;
        let la = model.forward(&a, Some(&mask), &ForwardContext::eval())?.narrow(1, 2, 1)?;
        let lb = model.forward(&b, Some(&mask), &ForwardContext::eval())?.narrow(1, 2, 1)?;
        let diff = (la - lb)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);
        Ok(())
    }

    #[test]
    fn test_sequence_too_long() {
        let mut config = CausalLmConfig::tiny(16);
        config.max_position_embeddings = 2;
        let model = CausalLm::random(config, DType::F32, &Device::Cpu).unwrap();
        let result = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_full_model_is_trainable() {
        let model = tiny_model();
        let counts = model.parameter_counts();
        assert_eq!(counts.trainable, counts.total);
        assert!(counts.total > 0);
    }

    #[test]
    fn test_tied_embeddings_have_no_head() -> Result<()> {
        let mut config = CausalLmConfig::tiny(32);
        config.tie_word_embeddings = true;
        let model = CausalLm::random(config, DType::F32, &Device::Cpu)?;
        let tensors = model.named_tensors()?;
        assert!(!tensors.contains_key("lm_head.weight"));
        let logits = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval())?;
        assert_eq!(logits.dims(), &[2, 4, 32]);
        Ok(())
    }

    #[test]
    fn test_save_and_load_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.safetensors");
        let model = tiny_model();
        model.save_safetensors(&path)?;

        let mut restored = CausalLm::new(CausalLmConfig::tiny(32), DType::F32, &Device::Cpu, WeightInit::Zeros)?;
        restored.load_safetensors(&[&path])?;

        let input = ids(&Device::Cpu);
        let a = model.forward(&input, None, &ForwardContext::eval())?;
        let b = restored.forward(&input, None, &ForwardContext::eval())?;
        let diff = (a - b)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-3);
        Ok(())
    }

    #[test]
    fn test_load_rejects_incomplete_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("partial.safetensors");
        let device = Device::Cpu;
        let mut partial = HashMap::new();
        partial.insert("model.norm.weight".to_string(), Tensor::ones(64, DType::F32, &device)?);
        candle_core::safetensors::save(&partial, &path)?;

        let mut model = CausalLm::new(CausalLmConfig::tiny(32), DType::F32, &device, WeightInit::Zeros)?;
        let result = model.load_safetensors(&[&path]);
        assert!(matches!(result, Err(Error::ModelLoading(_))));
        Ok(())
    }

    #[test]
    fn test_quantize_freezes_and_shrinks_varmap() -> Result<()> {
        let mut model = tiny_model();
        let quantized = model.quantize_8bit()?;
        // 7 projections per layer, 2 layers
        assert_eq!(quantized, 14);
        assert!(model.is_quantized());
        assert!(model.trainable_vars().is_empty());

        let logits = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval())?;
        assert_eq!(logits.dims(), &[2, 4, 32]);
        assert!(model.named_tensors()?.contains_key("model.layers.0.self_attn.q_proj.weight"));
        Ok(())
    }

    #[test]
    fn test_lora_injection_marks_only_adapters_trainable() -> Result<()> {
        let mut model = tiny_model();
        let before = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval())?;

        let adapted = model.inject_lora(&LoraConfig::default())?;
        assert_eq!(adapted, 4); // q_proj and v_proj in two layers

        let counts = model.parameter_counts();
        // q: (8x64 + 64x8), v: (8x64 + 32x8), per layer
        assert_eq!(counts.trainable, 2 * ((8 * 64 + 64 * 8) + (8 * 64 + 32 * 8)));
        assert!(counts.trainable < counts.total);
        for var in model.trainable_vars() {
            assert_eq!(var.dims()[0].min(var.dims()[1]), 8);
        }

        // B starts at zero, so outputs are unchanged
        let after = model.forward(&ids(&Device::Cpu), None, &ForwardContext::eval())?;
        let diff = (before - after)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4);

        assert!(model.inject_lora(&LoraConfig::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_lora_unknown_targets() {
        let mut model = tiny_model();
        let config = LoraConfig::causal_lm(Some(vec!["c_attn".into()]));
        assert!(matches!(model.inject_lora(&config), Err(Error::Lora(_))));
    }

    #[test]
    fn test_backward_reaches_only_adapters() -> Result<()> {
        let mut model = tiny_model();
        model.inject_lora(&LoraConfig::default())?;
        let device = Device::Cpu;
        let input = ids(&device);
        let targets = Tensor::new(&[5u32, 9, 3, 1, 4, 6, 0, 2], &device)?;

        let logits = model.forward(&input, None, &ForwardContext::train())?;
        let loss = candle_nn::loss::cross_entropy(&logits.flatten_to(1)?, &targets)?;
        let grads = loss.backward()?;
        for var in model.trainable_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        assert!(grads.get(&model.embed_tokens).is_none());
        Ok(())
    }

    #[test]
    fn test_optimizer_step_changes_loss() -> Result<()> {
        let model = tiny_model();
        let device = Device::Cpu;
        let input = ids(&device);
        let targets = Tensor::new(&[5u32, 9, 3, 1, 4, 6, 0, 2], &device)?;
        let mut opt = candle_nn::AdamW::new(
            model.trainable_vars(),
            candle_nn::ParamsAdamW {
                lr: 1e-2,
                ..Default::default()
            },
        )?;
        let loss = |m: &CausalLm| -> Result<Tensor> {
            let logits = m.forward(&input, None, &ForwardContext::train())?;
            Ok(candle_nn::loss::cross_entropy(&logits.flatten_to(1)?, &targets)?)
        };
        let first = loss(&model)?;
        opt.backward_step(&first)?;
        let second = loss(&model)?;
        assert!(second.to_scalar::<f32>()? < first.to_scalar::<f32>()?);
        Ok(())
    }

    fn all_finite(vars: &[Var]) -> Result<bool> {
        for var in vars {
            let values = var.as_tensor().to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            if values.iter().any(|v| !v.is_finite()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn train_two_steps(model: &CausalLm) -> Result<()> {
        let device = Device::Cpu;
        let input = ids(&device);
        let targets = Tensor::new(&[[5u32, 9, 3, 1], [4, 6, 0, 2]], &device)?;
        let loss_fn = crate::training::CrossEntropyLoss::new();
        let mut opt = candle_nn::AdamW::new(
            model.trainable_vars(),
            candle_nn::ParamsAdamW {
                lr: 1e-4,
                ..Default::default()
            },
        )?;
        for step in 0..2 {
            let logits = model.forward(&input, None, &ForwardContext::train())?;
            assert_eq!(logits.dtype(), DType::F32);
            let loss = loss_fn.forward(&logits, &targets, None)?;
            assert!(loss.to_scalar::<f32>()?.is_finite(), "loss not finite at step {}", step);
            opt.backward_step(&loss)?;
            assert!(all_finite(&model.trainable_vars())?, "weights not finite after step {}", step);
        }
        Ok(())
    }

    #[test]
    fn test_half_precision_lora_training_stays_finite() -> Result<()> {
        let mut model = CausalLm::random(CausalLmConfig::tiny(32), DType::F16, &Device::Cpu)?;
        model.inject_lora(&LoraConfig::default())?;
        assert_eq!(model.dtype(), DType::F16);
        assert!(model.trainable_vars().iter().all(|v| v.dtype() == DType::F32));
        train_two_steps(&model)
    }

    #[test]
    fn test_half_precision_full_training_stays_finite() -> Result<()> {
        let model = CausalLm::random(CausalLmConfig::tiny(32), DType::F16, &Device::Cpu)?;
        assert!(model.trainable_vars().iter().all(|v| v.dtype() == DType::F32));
        train_two_steps(&model)?;

        // Checkpoints are written in the compute dtype
        let tensors = model.named_tensors()?;
        assert_eq!(tensors["model.embed_tokens.weight"].dtype(), DType::F16);
        Ok(())
    }

    #[test]
    fn test_blocked_positions_layout() -> Result<()> {
        let model = tiny_model();
        let device = Device::Cpu;

        let causal = model.blocked_positions(2, 3, None)?;
        assert_eq!(causal.dims(), &[1, 1, 3, 3]);
        assert_eq!(
            causal.squeeze(0)?.squeeze(0)?.to_vec2::<u8>()?,
            vec![vec![0, 1, 1], vec![0, 0, 1], vec![0, 0, 0]]
        );

        let mask = Tensor::new(&[[1u8, 1, 1], [0, 1, 0]], &device)?;
        let blocked = model.blocked_positions(2, 3, Some(&mask))?;
        assert_eq!(blocked.dims(), &[2, 1, 3, 3]);
        let second = blocked.get(1)?.squeeze(0)?.to_vec2::<u8>()?;
        // Padded keys stay visible only from their own position
        assert_eq!(second, vec![vec![0, 1, 1], vec![1, 0, 1], vec![1, 0, 0]]);

        let bad = Tensor::ones((1, 3), DType::U8, &device)?;
        assert!(matches!(
            model.blocked_positions(2, 3, Some(&bad)),
            Err(Error::InvalidInput(_))
        ));
        Ok(())
    }
}
