// Ankh: T5-style encoder.
//
// Only the encoder stack is built; the decoder plays no part in embedding
// extraction. Parameter names follow the `ElnaggarLab/ankh-*` checkpoints:
// `shared`, `encoder.block.{i}.layer.{0,1}.*`, `encoder.final_layer_norm`.
use super::{attend, merge_heads, padding_bias, split_heads, Backbone, ModelFamily};
use crate::nn::{AdaptableLinear, BottleneckAdapter, Injection, LinearRole, RmsNorm};
use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{Embedding, VarBuilder};
use serde::{Deserialize, Serialize};

fn default_buckets() -> usize {
    32
}
fn default_max_distance() -> usize {
    128
}
fn default_eps() -> f64 {
    1e-6
}
fn default_ff_proj() -> String {
    "gated-gelu".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnkhConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    #[serde(default = "default_buckets")]
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_ff_proj")]
    pub feed_forward_proj: String,
    #[serde(default)]
    pub pad_token_id: u32,
}

impl AnkhConfig {
    pub fn ankh_base() -> Self {
        Self {
            vocab_size: 144,
            d_model: 768,
            d_kv: 64,
            d_ff: 3072,
            num_layers: 48,
            num_heads: 12,
            relative_attention_num_buckets: 64,
            relative_attention_max_distance: 128,
            layer_norm_epsilon: default_eps(),
            feed_forward_proj: default_ff_proj(),
            pad_token_id: 0,
        }
    }
    pub fn ankh_large() -> Self {
        Self {
            d_model: 1536,
            d_ff: 3840,
            num_heads: 16,
            relative_attention_num_buckets: 128,
            ..Self::ankh_base()
        }
    }
    /// Small random-weight configuration.
    pub fn tiny(d_model: usize, num_layers: usize, num_heads: usize) -> Self {
        Self {
            vocab_size: 28,
            d_model,
            d_kv: d_model / num_heads,
            d_ff: 2 * d_model,
            num_layers,
            num_heads,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            ..Self::ankh_base()
        }
    }

    fn is_gated(&self) -> bool {
        self.feed_forward_proj.starts_with("gated")
    }
}

/// Bidirectional T5 bucket for the offset `key - query`.
fn relative_bucket(relative: i64, num_buckets: usize, max_distance: usize) -> u32 {
    let half = (num_buckets / 2) as i64;
    let mut bucket = if relative > 0 { half } else { 0 };
    let n = relative.abs();
    let max_exact = half / 2;
    if n < max_exact {
        bucket += n;
    } else {
        let scaled = ((n as f64 / max_exact as f64).ln()
            / (max_distance as f64 / max_exact as f64).ln()
            * (half - max_exact) as f64) as i64;
        bucket += (max_exact + scaled).min(half - 1);
    }
    bucket as u32
}

struct RelativePositionBias {
    embedding: Embedding,
    num_buckets: usize,
    max_distance: usize,
}

impl RelativePositionBias {
    /// `[1, heads, seq, seq]`
    fn forward(&self, seq: usize, device: &Device) -> Result<Tensor> {
        let buckets: Vec<u32> = (0..seq as i64)
            .flat_map(|q| (0..seq as i64).map(move |k| (q, k)))
            .map(|(q, k)| relative_bucket(k - q, self.num_buckets, self.max_distance))
            .collect();
        let buckets = Tensor::from_vec(buckets, (seq, seq), device)?;
        self.embedding
            .forward(&buckets)?
            .permute((2, 0, 1))?
            .unsqueeze(0)
    }
}

struct SelfAttention {
    q: AdaptableLinear,
    k: AdaptableLinear,
    v: AdaptableLinear,
    o: AdaptableLinear,
    heads: usize,
    relative_bias: Option<RelativePositionBias>,
}

impl SelfAttention {
    fn load(vb: VarBuilder, cfg: &AnkhConfig, has_bias: bool, injection: &Injection) -> Result<Self> {
        let inner = cfg.num_heads * cfg.d_kv;
        let relative_bias = if has_bias {
            Some(RelativePositionBias {
                embedding: candle_nn::embedding(
                    cfg.relative_attention_num_buckets,
                    cfg.num_heads,
                    vb.pp("relative_attention_bias"),
                )?,
                num_buckets: cfg.relative_attention_num_buckets,
                max_distance: cfg.relative_attention_max_distance,
            })
        } else {
            None
        };
        Ok(Self {
            q: injection.linear(vb.pp("q"), cfg.d_model, inner, false, LinearRole::Query)?,
            k: injection.linear(vb.pp("k"), cfg.d_model, inner, false, LinearRole::Key)?,
            v: injection.linear(vb.pp("v"), cfg.d_model, inner, false, LinearRole::Value)?,
            o: injection.linear(vb.pp("o"), inner, cfg.d_model, false, LinearRole::AttentionOutput)?,
            heads: cfg.num_heads,
            relative_bias,
        })
    }

    // T5 does not scale the attention logits.
    fn forward_t(&self, xs: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let q = split_heads(&self.q.forward_t(xs, train)?, self.heads)?;
        let k = split_heads(&self.k.forward_t(xs, train)?, self.heads)?;
        let v = split_heads(&self.v.forward_t(xs, train)?, self.heads)?;
        let ctx = merge_heads(&attend(&q, &k, &v, bias)?)?;
        self.o.forward_t(&ctx, train)
    }
}

struct FeedForward {
    wi_0: AdaptableLinear,
    wi_1: Option<AdaptableLinear>,
    wo: AdaptableLinear,
}

impl FeedForward {
    fn load(vb: VarBuilder, cfg: &AnkhConfig, injection: &Injection) -> Result<Self> {
        let (d, ff) = (cfg.d_model, cfg.d_ff);
        let role = LinearRole::FeedForward;
        let (wi_0, wi_1) = if cfg.is_gated() {
            (
                injection.linear(vb.pp("wi_0"), d, ff, false, role)?,
                Some(injection.linear(vb.pp("wi_1"), d, ff, false, role)?),
            )
        } else {
            (injection.linear(vb.pp("wi"), d, ff, false, role)?, None)
        };
        Ok(Self {
            wi_0,
            wi_1,
            wo: injection.linear(vb.pp("wo"), ff, d, false, role)?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = match &self.wi_1 {
            Some(wi_1) => (self.wi_0.forward_t(xs, train)?.gelu()? * wi_1.forward_t(xs, train)?)?,
            None => self.wi_0.forward_t(xs, train)?.relu()?,
        };
        self.wo.forward_t(&h, train)
    }
}

struct Block {
    attn_norm: RmsNorm,
    attention: SelfAttention,
    ff_norm: RmsNorm,
    ff: FeedForward,
    adapter: Option<BottleneckAdapter>,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &AnkhConfig, layer: usize, injection: &Injection) -> Result<Self> {
        let attn = vb.pp("layer").pp(0);
        let ff = vb.pp("layer").pp(1);
        Ok(Self {
            attn_norm: RmsNorm::load(attn.pp("layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?,
            attention: SelfAttention::load(attn.pp("SelfAttention"), cfg, layer == 0, injection)?,
            ff_norm: RmsNorm::load(ff.pp("layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?,
            ff: FeedForward::load(ff.pp("DenseReluDense"), cfg, injection)?,
            adapter: injection.adapter(layer, cfg.d_model)?,
        })
    }

    fn forward_t(&self, xs: &Tensor, bias: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.attention.forward_t(&self.attn_norm.forward(xs)?, bias, train)?;
        let xs = (xs + h)?;
        let xs = (&xs + self.ff.forward_t(&self.ff_norm.forward(&xs)?, train)?)?;
        match &self.adapter {
            Some(adapter) => &xs + adapter.forward_t(&xs, train)?,
            None => Ok(xs),
        }
    }
}

pub struct AnkhEncoder {
    config: AnkhConfig,
    shared: Embedding,
    blocks: Vec<Block>,
    final_layer_norm: RmsNorm,
}

impl AnkhEncoder {
    pub fn load(vb: VarBuilder, cfg: &AnkhConfig, injection: &Injection) -> Result<Self> {
        let shared = candle_nn::embedding(cfg.vocab_size, cfg.d_model, vb.pp("shared"))?;
        let encoder = vb.pp("encoder");
        let blocks = (0..cfg.num_layers)
            .map(|i| Block::load(encoder.pp("block").pp(i), cfg, i, injection))
            .collect::<Result<Vec<_>>>()?;
        let final_layer_norm =
            RmsNorm::load(encoder.pp("final_layer_norm"), cfg.d_model, cfg.layer_norm_epsilon)?;
        Ok(Self {
            config: cfg.clone(),
            shared,
            blocks,
            final_layer_norm,
        })
    }
}

impl Backbone for AnkhEncoder {
    fn family(&self) -> ModelFamily {
        ModelFamily::Ankh
    }
    fn hidden_size(&self) -> usize {
        self.config.d_model
    }
    fn num_layers(&self) -> usize {
        self.config.num_layers
    }
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_t(&self, tokens: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let (_, t) = tokens.dims2()?;
        let mut xs = self.shared.forward(tokens)?;
        // position bias is computed by block 0 and shared by every block
        let position = match self.blocks.first().and_then(|b| b.attention.relative_bias.as_ref()) {
            Some(rel) => rel.forward(t, xs.device())?.to_dtype(xs.dtype())?,
            None => Tensor::zeros((1, 1, t, t), xs.dtype(), xs.device())?,
        };
        let bias = position.broadcast_add(&padding_bias(tokens, self.config.pad_token_id, xs.dtype())?)?;
        let mut states = Vec::with_capacity(self.blocks.len() + 1);
        for block in &self.blocks {
            states.push(xs.clone());
            xs = block.forward_t(&xs, &bias, train)?;
        }
        states.push(self.final_layer_norm.forward(&xs)?);
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_buckets() {
        // 32 buckets, max distance 128: small offsets map one-to-one
        assert_eq!(relative_bucket(0, 32, 128), 0);
        assert_eq!(relative_bucket(-3, 32, 128), 3);
        assert_eq!(relative_bucket(3, 32, 128), 19);
        // far offsets saturate at the last bucket of their half
        assert_eq!(relative_bucket(-1000, 32, 128), 15);
        assert_eq!(relative_bucket(1000, 32, 128), 31);
    }
}
