// ESM-2 masked encoder.
//
// Parameter names follow the Hugging Face `EsmForMaskedLM` checkpoints
// (`esm.embeddings.*`, `esm.encoder.layer.{i}.*`, `esm.encoder.emb_layer_norm_after`)
// so published `model.safetensors` files load without renaming.
use super::{attend, merge_heads, padding_bias, split_heads, Backbone, ModelFamily};
use crate::nn::{AdaptableLinear, BottleneckAdapter, Injection, LayerNorm, LinearRole, RotaryEmbedding};
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};
use serde::{Deserialize, Serialize};

fn default_eps() -> f64 {
    1e-5
}
fn default_pad() -> u32 {
    1
}
fn default_mask() -> u32 {
    32
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Esm2Config {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_pad")]
    pub pad_token_id: u32,
    #[serde(default = "default_mask")]
    pub mask_token_id: u32,
    #[serde(default = "default_true")]
    pub token_dropout: bool,
}

impl Esm2Config {
    fn with_shape(hidden: usize, layers: usize, heads: usize) -> Self {
        Self {
            vocab_size: 33,
            hidden_size: hidden,
            num_hidden_layers: layers,
            num_attention_heads: heads,
            intermediate_size: 4 * hidden,
            layer_norm_eps: default_eps(),
            pad_token_id: default_pad(),
            mask_token_id: default_mask(),
            token_dropout: true,
        }
    }
    pub fn esm2_t6_8m() -> Self {
        Self::with_shape(320, 6, 20)
    }
    pub fn esm2_t12_35m() -> Self {
        Self::with_shape(480, 12, 20)
    }
    pub fn esm2_t30_150m() -> Self {
        Self::with_shape(640, 30, 20)
    }
    pub fn esm2_t33_650m() -> Self {
        Self::with_shape(1280, 33, 20)
    }
    pub fn esm2_t36_3b() -> Self {
        Self::with_shape(2560, 36, 40)
    }
    pub fn esm2_t48_15b() -> Self {
        Self::with_shape(5120, 48, 40)
    }
    /// Small random-weight configuration.
    pub fn tiny(hidden: usize, layers: usize, heads: usize) -> Self {
        Self::with_shape(hidden, layers, heads)
    }
}

struct SelfAttention {
    query: AdaptableLinear,
    key: AdaptableLinear,
    value: AdaptableLinear,
    dense: AdaptableLinear,
    layer_norm: LayerNorm,
    heads: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(vb: VarBuilder, cfg: &Esm2Config, injection: &Injection) -> Result<Self> {
        let h = cfg.hidden_size;
        let sa = vb.pp("self");
        Ok(Self {
            query: injection.linear(sa.pp("query"), h, h, true, LinearRole::Query)?,
            key: injection.linear(sa.pp("key"), h, h, true, LinearRole::Key)?,
            value: injection.linear(sa.pp("value"), h, h, true, LinearRole::Value)?,
            dense: injection.linear(
                vb.pp("output").pp("dense"),
                h,
                h,
                true,
                LinearRole::AttentionOutput,
            )?,
            layer_norm: LayerNorm::load(vb.pp("LayerNorm"), h, cfg.layer_norm_eps)?,
            heads: cfg.num_attention_heads,
            scale: 1.0 / ((h / cfg.num_attention_heads) as f64).sqrt(),
        })
    }

    fn forward_t(&self, xs: &Tensor, bias: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<Tensor> {
        let h = self.layer_norm.forward(xs)?;
        let q = (self.query.forward_t(&h, train)? * self.scale)?;
        let q = rope.apply(&split_heads(&q, self.heads)?)?;
        let k = rope.apply(&split_heads(&self.key.forward_t(&h, train)?, self.heads)?)?;
        let v = split_heads(&self.value.forward_t(&h, train)?, self.heads)?;
        let ctx = merge_heads(&attend(&q, &k, &v, bias)?)?;
        xs + self.dense.forward_t(&ctx, train)?
    }
}

struct EsmLayer {
    attention: SelfAttention,
    layer_norm: LayerNorm,
    intermediate: AdaptableLinear,
    output: AdaptableLinear,
    adapter: Option<BottleneckAdapter>,
}

impl EsmLayer {
    fn load(vb: VarBuilder, cfg: &Esm2Config, layer: usize, injection: &Injection) -> Result<Self> {
        let h = cfg.hidden_size;
        Ok(Self {
            attention: SelfAttention::load(vb.pp("attention"), cfg, injection)?,
            layer_norm: LayerNorm::load(vb.pp("LayerNorm"), h, cfg.layer_norm_eps)?,
            intermediate: injection.linear(
                vb.pp("intermediate").pp("dense"),
                h,
                cfg.intermediate_size,
                true,
                LinearRole::FeedForward,
            )?,
            output: injection.linear(
                vb.pp("output").pp("dense"),
                cfg.intermediate_size,
                h,
                true,
                LinearRole::FeedForward,
            )?,
            adapter: injection.adapter(layer, h)?,
        })
    }

    fn forward_t(&self, xs: &Tensor, bias: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<Tensor> {
        let xs = self.attention.forward_t(xs, bias, rope, train)?;
        let h = self.layer_norm.forward(&xs)?;
        let h = self.intermediate.forward_t(&h, train)?.gelu_erf()?;
        let xs = (&xs + self.output.forward_t(&h, train)?)?;
        match &self.adapter {
            Some(adapter) => &xs + adapter.forward_t(&xs, train)?,
            None => Ok(xs),
        }
    }
}

pub struct Esm2 {
    config: Esm2Config,
    word_embeddings: Embedding,
    layers: Vec<EsmLayer>,
    emb_layer_norm_after: LayerNorm,
    rope: RotaryEmbedding,
}

impl Esm2 {
    pub fn load(vb: VarBuilder, cfg: &Esm2Config, injection: &Injection) -> Result<Self> {
        let esm = vb.pp("esm");
        let word_embeddings = candle_nn::embedding(
            cfg.vocab_size,
            cfg.hidden_size,
            esm.pp("embeddings").pp("word_embeddings"),
        )?;
        let encoder = esm.pp("encoder");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| EsmLayer::load(encoder.pp("layer").pp(i), cfg, i, injection))
            .collect::<Result<Vec<_>>>()?;
        let emb_layer_norm_after = LayerNorm::load(
            encoder.pp("emb_layer_norm_after"),
            cfg.hidden_size,
            cfg.layer_norm_eps,
        )?;
        let head_dim = cfg.hidden_size / cfg.num_attention_heads;
        let rope = RotaryEmbedding::new(head_dim, 10_000.0, false, vb.device())?;
        Ok(Self {
            config: cfg.clone(),
            word_embeddings,
            layers,
            emb_layer_norm_after,
            rope,
        })
    }

    /// Token embedding with mask-token rescaling and pad positions zeroed.
    fn embed(&self, tokens: &Tensor) -> Result<Tensor> {
        let xs = self.word_embeddings.forward(tokens)?;
        let dtype = xs.dtype();
        let not_pad = tokens.ne(self.config.pad_token_id)?.to_dtype(dtype)?;
        let xs = if self.config.token_dropout {
            let is_mask = tokens.eq(self.config.mask_token_id)?.to_dtype(dtype)?;
            let xs = xs.broadcast_mul(&is_mask.affine(-1.0, 1.0)?.unsqueeze(D::Minus1)?)?;
            let observed = (is_mask.sum(1)? / not_pad.sum(1)?)?;
            let mask_ratio_train = 0.15 * 0.8;
            let factor = (observed.affine(-1.0, 1.0)?.recip()? * (1.0 - mask_ratio_train))?;
            xs.broadcast_mul(&factor.unsqueeze(1)?.unsqueeze(2)?)?
        } else {
            xs
        };
        xs.broadcast_mul(&not_pad.unsqueeze(D::Minus1)?)
    }
}

impl Backbone for Esm2 {
    fn family(&self) -> ModelFamily {
        ModelFamily::Esm2
    }
    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }
    fn num_layers(&self) -> usize {
        self.config.num_hidden_layers
    }
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_t(&self, tokens: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let mut xs = self.embed(tokens)?;
        let bias = padding_bias(tokens, self.config.pad_token_id, xs.dtype())?;
        let mut states = Vec::with_capacity(self.layers.len() + 1);
        for layer in &self.layers {
            states.push(xs.clone());
            xs = layer.forward_t(&xs, &bias, &self.rope, train)?;
        }
        states.push(self.emb_layer_norm_after.forward(&xs)?);
        Ok(states)
    }
}
