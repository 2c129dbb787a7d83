//! Llama model architecture implementation using Candle.
//!
//! Supports Llama 2, Llama 3 and Mistral-style checkpoints. All weights are
//! created in a [`VarMap`] so they can be trained, frozen and saved.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Result as CandleResult, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder, VarMap};
use forneus_core::{GenerationConfig, Result};
use tracing::debug;

use crate::config::LlamaConfig;
use crate::lora::{LoraConfig, LoraLinear};
use crate::params::ParamStore;

/// RMS Layer Normalization.
struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> CandleResult<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        x_normed.to_dtype(dtype)?.broadcast_mul(&self.weight)
    }
}

/// Rotary Position Embedding cache.
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn new(config: &LlamaConfig, dtype: DType, device: &Device) -> CandleResult<Self> {
        let head_dim = config.head_dim();
        let max_seq_len = config.max_position_embeddings;
        let theta = config.rope_theta;

        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::new(inv_freq.as_slice(), device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|p| p as f32).collect();
        let positions = Tensor::new(positions.as_slice(), device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;

        let cos = emb.cos()?.to_dtype(dtype)?;
        let sin = emb.sin()?.to_dtype(dtype)?;

        Ok(Self { cos, sin })
    }

    /// Applies rotary embeddings to `q` and `k` of shape (batch, heads, seq, head_dim).
    fn apply(&self, q: &Tensor, k: &Tensor, start_pos: usize) -> CandleResult<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;
        let sin = self.sin.narrow(0, start_pos, seq_len)?.unsqueeze(0)?.unsqueeze(0)?;

        let q_embed = Self::apply_rotary(q, &cos, &sin)?;
        let k_embed = Self::apply_rotary(k, &cos, &sin)?;

        Ok((q_embed, k_embed))
    }

    fn apply_rotary(x: &Tensor, cos: &Tensor, sin: &Tensor) -> CandleResult<Tensor> {
        let half = x.dim(D::Minus1)? / 2;
        let x1 = x.narrow(D::Minus1, 0, half)?;
        let x2 = x.narrow(D::Minus1, half, half)?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        x.broadcast_mul(cos)? + rotated.broadcast_mul(sin)?
    }
}

/// Self-attention layer.
struct Attention {
    q_proj: LoraLinear,
    k_proj: LoraLinear,
    v_proj: LoraLinear,
    o_proj: LoraLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn load(config: &LlamaConfig, lora: Option<&LoraConfig>, vb: &VarBuilder) -> CandleResult<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();

        let q_proj = LoraLinear::load(hidden_size, num_heads * head_dim, "q_proj", lora, vb)?;
        let k_proj = LoraLinear::load(hidden_size, num_kv_heads * head_dim, "k_proj", lora, vb)?;
        let v_proj = LoraLinear::load(hidden_size, num_kv_heads * head_dim, "v_proj", lora, vb)?;
        let o_proj = LoraLinear::load(num_heads * head_dim, hidden_size, "o_proj", lora, vb)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads,
            num_kv_heads,
            head_dim,
            kv_cache: None,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn forward(
        &mut self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        start_pos: usize,
    ) -> CandleResult<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;

        let q = self.q_proj.forward(x)?;
        let k = self.k_proj.forward(x)?;
        let v = self.v_proj.forward(x)?;

        // (batch, num_heads, seq_len, head_dim)
        let q = q
            .reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let (q, k) = rotary.apply(&q, &k, start_pos)?;

        let (k, v) = match &self.kv_cache {
            Some((prev_k, prev_v)) => {
                let k = Tensor::cat(&[prev_k, &k], 2)?;
                let v = Tensor::cat(&[prev_v, &v], 2)?;
                (k, v)
            }
            None => (k, v),
        };

        self.kv_cache = Some((k.clone(), v.clone()));

        let k = Self::repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = Self::repeat_kv(v, self.num_heads / self.num_kv_heads)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
        let attn_weights = (attn_weights / scale)?;

        let attn_weights = match mask {
            Some(m) => attn_weights.broadcast_add(m)?,
            None => attn_weights,
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v.contiguous()?)?;

        let attn_output = attn_output.transpose(1, 2)?.reshape((
            batch_size,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;

        self.o_proj.forward(&attn_output)
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }
        let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)?
            .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
            .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
    }

    fn clear_cache(&mut self) {
        self.kv_cache = None;
    }
}

/// MLP (Feed-Forward) layer.
struct Mlp {
    gate_proj: LoraLinear,
    up_proj: LoraLinear,
    down_proj: LoraLinear,
}

impl Mlp {
    fn load(config: &LlamaConfig, lora: Option<&LoraConfig>, vb: &VarBuilder) -> CandleResult<Self> {
        let hidden_size = config.hidden_size;
        let intermediate_size = config.intermediate_size;

        Ok(Self {
            gate_proj: LoraLinear::load(hidden_size, intermediate_size, "gate_proj", lora, vb)?,
            up_proj: LoraLinear::load(hidden_size, intermediate_size, "up_proj", lora, vb)?,
            down_proj: LoraLinear::load(intermediate_size, hidden_size, "down_proj", lora, vb)?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> CandleResult<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Transformer decoder layer.
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(config: &LlamaConfig, lora: Option<&LoraConfig>, vb: &VarBuilder) -> CandleResult<Self> {
        let self_attn = Attention::load(config, lora, &vb.pp("self_attn"))?;
        let mlp = Mlp::load(config, lora, &vb.pp("mlp"))?;
        let input_layernorm =
            RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = RmsNorm::load(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &mut self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        mask: Option<&Tensor>,
        start_pos: usize,
    ) -> CandleResult<Tensor> {
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary, mask, start_pos)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.post_attention_layernorm.forward(&x)?;
        let x = self.mlp.forward(&x)?;
        residual + x
    }

    fn clear_cache(&mut self) {
        self.self_attn.clear_cache();
    }
}

/// Decoder-only causal language model with trainable parameters.
pub struct CausalLm {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    rotary: RotaryEmbedding,
    config: LlamaConfig,
    lora: Option<LoraConfig>,
    generation_config: GenerationConfig,
    params: ParamStore,
    name_or_path: String,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for CausalLm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalLm")
            .field("name_or_path", &self.name_or_path)
            .field("layers", &self.layers.len())
            .field("lora", &self.lora.is_some())
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl CausalLm {
    /// Module path of the decoder layer stack.
    pub const LAYERS: &'static str = "model.layers";
    /// Module path of the token embeddings.
    pub const EMBED_TOKENS: &'static str = "model.embed_tokens";
    /// Module path of the output head.
    pub const LM_HEAD: &'static str = "lm_head";

    /// Builds a model with freshly initialised weights on `device`.
    ///
    /// Weights are meant to be overwritten from a checkpoint through
    /// [`CausalLm::params`]; adapters (when `lora` is given) start as an identity
    /// update.
    ///
    /// # Errors
    ///
    /// Returns an error if tensors cannot be allocated.
    pub fn new(
        config: LlamaConfig,
        lora: Option<LoraConfig>,
        name_or_path: impl Into<String>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb.pp(Self::EMBED_TOKENS),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let layer_vb = vb.pp(format!("{}.{i}", Self::LAYERS));
            layers.push(DecoderLayer::load(&config, lora.as_ref(), &layer_vb)?);
        }

        let norm = RmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("model.norm"))?;

        let lm_head = if config.tie_word_embeddings {
            Linear::new(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(config.hidden_size, config.vocab_size, vb.pp(Self::LM_HEAD))?
        };

        let rotary = RotaryEmbedding::new(&config, dtype, device)?;
        let params = ParamStore::new(varmap)?;
        debug!(
            layers = config.num_hidden_layers,
            params = params.len(),
            lora = lora.is_some(),
            "Built causal LM"
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary,
            generation_config: config.generation_defaults(),
            config,
            lora,
            params,
            name_or_path: name_or_path.into(),
            device: device.clone(),
            dtype,
        })
    }

    /// Forward pass for the model.
    ///
    /// # Arguments
    /// * `input_ids` - Token IDs of shape (batch_size, seq_len)
    /// * `start_pos` - Starting position for KV cache (0 for prefill, incremental for generation)
    ///
    /// # Returns
    /// Logits tensor of shape (batch_size, seq_len, vocab_size)
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatches or backend failures.
    pub fn forward(&mut self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (_batch_size, seq_len) = input_ids.dims2()?;

        let mut hidden_states = self.embed_tokens.forward(input_ids)?;

        let mask = if seq_len > 1 {
            Some(Self::create_causal_mask(
                seq_len,
                start_pos,
                &self.device,
                self.dtype,
            )?)
        } else {
            None
        };

        for layer in &mut self.layers {
            hidden_states =
                layer.forward(&hidden_states, &self.rotary, mask.as_ref(), start_pos)?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        Ok(self.lm_head.forward(&hidden_states)?)
    }

    /// Runs a full-sequence forward pass from an empty cache.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatches or backend failures.
    pub fn logits(&mut self, input_ids: &Tensor) -> Result<Tensor> {
        self.clear_cache();
        let logits = self.forward(input_ids, 0);
        self.clear_cache();
        logits
    }

    /// Creates a causal attention mask.
    fn create_causal_mask(
        seq_len: usize,
        start_pos: usize,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Tensor> {
        let mask: Vec<f32> = (0..seq_len)
            .flat_map(|i| {
                (0..seq_len + start_pos).map(move |j| {
                    if j > i + start_pos {
                        f32::NEG_INFINITY
                    } else {
                        0.0
                    }
                })
            })
            .collect();

        Tensor::from_vec(mask, (seq_len, seq_len + start_pos), device)?.to_dtype(dtype)
    }

    /// Clears the KV cache (for starting a new generation).
    pub fn clear_cache(&mut self) {
        for layer in &mut self.layers {
            layer.clear_cache();
        }
    }

    /// Writes the model to `dir` in the layout it was loaded from.
    ///
    /// Plain models write `config.json`, `model.safetensors` and
    /// `generation_config.json`. Models with an adapter write only
    /// `adapter_config.json` and `adapter_model.safetensors`.
    ///
    /// # Errors
    ///
    /// Returns an error if any file cannot be written.
    pub fn save_pretrained(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        if let Some(lora) = &self.lora {
            let tensors: HashMap<String, Tensor> = self
                .params
                .tensors(LoraConfig::is_adapter_param)?
                .into_iter()
                .map(|(name, t)| (format!("{}{name}", LoraConfig::PEFT_PREFIX), t))
                .collect();
            candle_core::safetensors::save(&tensors, dir.join(LoraConfig::WEIGHTS_FILE))?;
            lora.save(&dir.join(LoraConfig::CONFIG_FILE))?;
        } else {
            self.params
                .varmap()
                .save(dir.join("model.safetensors"))?;
            self.config.save(&dir.join(LlamaConfig::FILE_NAME))?;
            self.generation_config
                .save(&dir.join(GenerationConfig::FILE_NAME))?;
        }
        debug!(dir = %dir.display(), adapter = self.lora.is_some(), "Saved model");
        Ok(())
    }

    /// Module path of the output head's parameters.
    ///
    /// With tied embeddings the head shares the token embedding matrix.
    #[must_use]
    pub fn head_module(&self) -> &'static str {
        if self.config.tie_word_embeddings {
            Self::EMBED_TOKENS
        } else {
            Self::LM_HEAD
        }
    }

    /// Returns the model configuration.
    #[must_use]
    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    /// Returns the adapter configuration, if an adapter is attached.
    #[must_use]
    pub fn lora_config(&self) -> Option<&LoraConfig> {
        self.lora.as_ref()
    }

    /// Returns the generation defaults this model was loaded with.
    #[must_use]
    pub fn generation_config(&self) -> &GenerationConfig {
        &self.generation_config
    }

    /// Replaces the generation defaults.
    pub fn set_generation_config(&mut self, generation_config: GenerationConfig) {
        self.generation_config = generation_config;
    }

    /// Returns the parameters.
    #[must_use]
    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    /// Returns the parameters mutably, for changing trainability.
    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Identifier the model was loaded from: a directory, or the base model id
    /// for adapters.
    #[must_use]
    pub fn name_or_path(&self) -> &str {
        &self.name_or_path
    }

    /// Returns the device.
    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Returns the dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::tiny_config;

    #[test]
    fn test_forward_shape() {
        let mut model =
            CausalLm::new(tiny_config(), None, "tiny", DType::F32, &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[1u32, 5, 6, 7]], &Device::Cpu).unwrap();
        let logits = model.logits(&ids).unwrap();
        assert_eq!(logits.dims(), &[1, 4, tiny_config().vocab_size]);
    }

    #[test]
    fn test_incremental_decode_matches_full_pass() {
        let mut model =
            CausalLm::new(tiny_config(), None, "tiny", DType::F32, &Device::Cpu).unwrap();
        let ids = Tensor::new(&[[1u32, 5, 6]], &Device::Cpu).unwrap();
        let full = model.logits(&ids).unwrap();

        model.clear_cache();
        model.forward(&ids.narrow(1, 0, 2).unwrap(), 0).unwrap();
        let step = model.forward(&ids.narrow(1, 2, 1).unwrap(), 2).unwrap();

        let last_full = full.narrow(1, 2, 1).unwrap();
        let diff = (last_full - step)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(diff[0] < 1e-4);
    }

    #[test]
    fn test_parameter_names_follow_checkpoint_layout() {
        let model = CausalLm::new(tiny_config(), None, "tiny", DType::F32, &Device::Cpu).unwrap();
        let names: Vec<&str> = model.params().names().collect();
        assert!(names.contains(&"model.embed_tokens.weight"));
        assert!(names.contains(&"model.layers.0.self_attn.q_proj.weight"));
        assert!(names.contains(&"model.norm.weight"));
        assert!(names.contains(&"lm_head.weight"));
        assert_eq!(model.head_module(), "lm_head");
    }

    #[test]
    fn test_tied_embeddings_share_head() {
        let mut config = tiny_config();
        config.tie_word_embeddings = true;
        let model = CausalLm::new(config, None, "tiny", DType::F32, &Device::Cpu).unwrap();
        assert!(model.params().names().all(|n| !n.starts_with("lm_head")));
        assert_eq!(model.head_module(), CausalLm::EMBED_TOKENS);
    }
}
