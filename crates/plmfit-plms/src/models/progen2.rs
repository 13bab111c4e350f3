// ProGen2 causal decoder (GPT-J block layout).
//
// Parameter names follow the `hugohrban/progen2-*` checkpoints:
// `transformer.wte`, `transformer.h.{i}.{ln_1,attn.qkv_proj,attn.out_proj,mlp.fc_in,mlp.fc_out}`,
// `transformer.ln_f`.
use super::{attend, causal_bias, merge_heads, padding_bias, Backbone, ModelFamily};
use crate::nn::{AdaptableLinear, BottleneckAdapter, Injection, LayerNorm, LinearRole, RotaryEmbedding};
use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Embedding, VarBuilder};
use serde::{Deserialize, Serialize};

/// The fused qkv projection is laid out in this many model-parallel shards.
const MP_NUM: usize = 8;

fn default_eps() -> f64 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProGenConfig {
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub rotary_dim: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_eps")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

impl ProGenConfig {
    fn with_shape(n_embd: usize, n_layer: usize, n_head: usize, rotary_dim: usize) -> Self {
        Self {
            vocab_size: 32,
            n_embd,
            n_layer,
            n_head,
            rotary_dim,
            n_inner: None,
            layer_norm_epsilon: default_eps(),
            pad_token_id: Some(0),
        }
    }
    pub fn progen2_small() -> Self {
        Self::with_shape(1024, 12, 16, 32)
    }
    pub fn progen2_medium() -> Self {
        Self::with_shape(1536, 27, 16, 48)
    }
    pub fn progen2_base() -> Self {
        Self::with_shape(2048, 27, 16, 64)
    }
    pub fn progen2_large() -> Self {
        Self::with_shape(2560, 32, 32, 64)
    }
    pub fn progen2_xlarge() -> Self {
        Self::with_shape(4096, 32, 16, 256)
    }
    /// Small random-weight configuration. `n_head` must be a multiple of 8.
    pub fn tiny(n_embd: usize, n_layer: usize, n_head: usize, rotary_dim: usize) -> Self {
        Self::with_shape(n_embd, n_layer, n_head, rotary_dim)
    }

    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    fn pad_id(&self) -> u32 {
        self.pad_token_id.unwrap_or(0)
    }
}

struct Attention {
    qkv_proj: AdaptableLinear,
    out_proj: AdaptableLinear,
    heads: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, cfg: &ProGenConfig, injection: &Injection) -> Result<Self> {
        let e = cfg.n_embd;
        Ok(Self {
            qkv_proj: injection.linear(vb.pp("qkv_proj"), e, 3 * e, false, LinearRole::QueryKeyValue)?,
            out_proj: injection.linear(vb.pp("out_proj"), e, e, false, LinearRole::AttentionOutput)?,
            heads: cfg.n_head,
            head_dim: e / cfg.n_head,
        })
    }

    /// `[b, t, MP_NUM, local]` shard slice to `[b, heads, t, head_dim]`.
    fn shard_to_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, t, _, _) = xs.dims4()?;
        xs.contiguous()?
            .reshape((b, t, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward_t(&self, xs: &Tensor, bias: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<Tensor> {
        let (b, t, e) = xs.dims3()?;
        let local = e / MP_NUM;
        let qkv = self
            .qkv_proj
            .forward_t(xs, train)?
            .reshape((b, t, MP_NUM, 3 * local))?;
        // each shard is laid out as [query | value | key]
        let q = self.shard_to_heads(&qkv.narrow(D::Minus1, 0, local)?)?;
        let v = self.shard_to_heads(&qkv.narrow(D::Minus1, local, local)?)?;
        let k = self.shard_to_heads(&qkv.narrow(D::Minus1, 2 * local, local)?)?;

        let q = (rope.apply(&q)? / (self.head_dim as f64).sqrt())?;
        let k = rope.apply(&k)?;
        let ctx = merge_heads(&attend(&q, &k, &v, bias)?)?;
        self.out_proj.forward_t(&ctx, train)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    fc_in: AdaptableLinear,
    fc_out: AdaptableLinear,
    adapter: Option<BottleneckAdapter>,
}

impl Block {
    fn load(vb: VarBuilder, cfg: &ProGenConfig, layer: usize, injection: &Injection) -> Result<Self> {
        let e = cfg.n_embd;
        let mlp = vb.pp("mlp");
        Ok(Self {
            ln_1: LayerNorm::load(vb.pp("ln_1"), e, cfg.layer_norm_epsilon)?,
            attn: Attention::load(vb.pp("attn"), cfg, injection)?,
            fc_in: injection.linear(mlp.pp("fc_in"), e, cfg.inner_dim(), true, LinearRole::FeedForward)?,
            fc_out: injection.linear(mlp.pp("fc_out"), cfg.inner_dim(), e, true, LinearRole::FeedForward)?,
            adapter: injection.adapter(layer, e)?,
        })
    }

    // attention and feed-forward both read the same normed input
    fn forward_t(&self, xs: &Tensor, bias: &Tensor, rope: &RotaryEmbedding, train: bool) -> Result<Tensor> {
        let h = self.ln_1.forward(xs)?;
        let attn = self.attn.forward_t(&h, bias, rope, train)?;
        let ff = self
            .fc_out
            .forward_t(&self.fc_in.forward_t(&h, train)?.gelu()?, train)?;
        let out = ((attn + ff)? + xs)?;
        match &self.adapter {
            Some(adapter) => &out + adapter.forward_t(&out, train)?,
            None => Ok(out),
        }
    }
}

pub struct ProGen2 {
    config: ProGenConfig,
    wte: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    rope: RotaryEmbedding,
}

impl ProGen2 {
    pub fn load(vb: VarBuilder, cfg: &ProGenConfig, injection: &Injection) -> Result<Self> {
        if cfg.n_head % MP_NUM != 0 || cfg.n_embd % cfg.n_head != 0 {
            candle_core::bail!(
                "progen2 needs n_head divisible by {MP_NUM} and n_embd divisible by n_head, got {} / {}",
                cfg.n_head,
                cfg.n_embd
            )
        }
        let tr = vb.pp("transformer");
        let wte = candle_nn::embedding(cfg.vocab_size, cfg.n_embd, tr.pp("wte"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(tr.pp("h").pp(i), cfg, i, injection))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::load(tr.pp("ln_f"), cfg.n_embd, cfg.layer_norm_epsilon)?;
        let rope = RotaryEmbedding::new(cfg.rotary_dim, 10_000.0, true, vb.device())?;
        Ok(Self {
            config: cfg.clone(),
            wte,
            blocks,
            ln_f,
            rope,
        })
    }
}

impl Backbone for ProGen2 {
    fn family(&self) -> ModelFamily {
        ModelFamily::ProGen2
    }
    fn hidden_size(&self) -> usize {
        self.config.n_embd
    }
    fn num_layers(&self) -> usize {
        self.config.n_layer
    }
    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_t(&self, tokens: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let (_, t) = tokens.dims2()?;
        let mut xs = self.wte.forward(tokens)?;
        let bias = causal_bias(t, xs.dtype(), xs.device())?
            .broadcast_add(&padding_bias(tokens, self.config.pad_id(), xs.dtype())?)?;
        let mut states = Vec::with_capacity(self.blocks.len() + 1);
        for block in &self.blocks {
            states.push(xs.clone());
            xs = block.forward_t(&xs, &bias, &self.rope, train)?;
        }
        states.push(self.ln_f.forward(&xs)?);
        Ok(states)
    }
}
