//! Parameter-efficient injections into a frozen backbone.
//!
//! Injected weights live in their own `VarBuilder` (backed by a separate
//! `VarMap`), so the optimizer can be handed exactly the injected subset.
use super::norm::LayerNorm;
use candle_core::{Module, Result, Tensor};
use candle_nn::{init, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Backbone projections an injection can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LinearRole {
    Query,
    Key,
    Value,
    /// Fused query/key/value projection.
    QueryKeyValue,
    AttentionOutput,
    FeedForward,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f64,
    pub dropout: f32,
    pub targets: Vec<LinearRole>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 8,
            alpha: 16.0,
            dropout: 0.05,
            targets: vec![
                LinearRole::Query,
                LinearRole::Value,
                LinearRole::QueryKeyValue,
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BottleneckConfig {
    pub bottleneck_dim: usize,
    pub dropout: f32,
    pub eps: f64,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            bottleneck_dim: 64,
            dropout: 0.25,
            eps: 1e-5,
        }
    }
}

fn dropout_t(xs: &Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(xs, p)
    } else {
        Ok(xs.clone())
    }
}

/// `W x + (alpha / r) * B A x`
#[derive(Debug, Clone)]
struct LowRankDelta {
    a: Tensor,
    b: Tensor,
    scale: f64,
    dropout: f32,
}

/// A linear projection with an optional low-rank delta.
#[derive(Debug, Clone)]
pub struct AdaptableLinear {
    base: Linear,
    delta: Option<LowRankDelta>,
}

impl AdaptableLinear {
    pub fn plain(base: Linear) -> Self {
        Self { base, delta: None }
    }

    pub fn has_delta(&self) -> bool {
        self.delta.is_some()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.base.forward(xs)?;
        match &self.delta {
            None => Ok(out),
            Some(d) => {
                let h = dropout_t(xs, d.dropout, train)?;
                let h = h.broadcast_matmul(&d.a.t()?)?.broadcast_matmul(&d.b.t()?)?;
                out + (h * d.scale)?
            }
        }
    }
}

impl Module for AdaptableLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

/// Layer norm, down projection, ReLU, up projection, dropout.
/// Callers add the output back onto the block output.
#[derive(Debug, Clone)]
pub struct BottleneckAdapter {
    ln: LayerNorm,
    fc_down: Linear,
    fc_up: Linear,
    dropout: f32,
}

impl BottleneckAdapter {
    pub fn load(vb: VarBuilder, hidden: usize, config: &BottleneckConfig) -> Result<Self> {
        let ln = LayerNorm::load_with_weight_init(vb.pp("ln"), hidden, config.eps, Init::Const(0.01))?;
        let fc_down = kaiming_linear(vb.pp("fc_down"), hidden, config.bottleneck_dim)?;
        let fc_up = kaiming_linear(vb.pp("fc_up"), config.bottleneck_dim, hidden)?;
        Ok(Self {
            ln,
            fc_down,
            fc_up,
            dropout: config.dropout,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.ln.forward(xs)?;
        let h = self.fc_down.forward(&h)?.relu()?;
        let h = self.fc_up.forward(&h)?;
        dropout_t(&h, self.dropout, train)
    }
}

fn kaiming_linear(vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Linear> {
    let w = vb.get_with_hints((out_dim, in_dim), "weight", init::DEFAULT_KAIMING_NORMAL)?;
    let b = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(w, Some(b)))
}

/// How a backbone is built: untouched, with low-rank deltas, or with bottleneck adapters.
#[derive(Clone, Default)]
pub enum Injection {
    #[default]
    None,
    LowRank {
        config: LoraConfig,
        vb: VarBuilder<'static>,
    },
    Bottleneck {
        config: BottleneckConfig,
        vb: VarBuilder<'static>,
    },
}

impl Injection {
    /// Load a backbone projection from `vb`, adding a low-rank delta under the
    /// same path in the injected store when `role` is targeted.
    pub fn linear(
        &self,
        vb: VarBuilder,
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        role: LinearRole,
    ) -> Result<AdaptableLinear> {
        let prefix = vb.prefix();
        let base = if bias {
            candle_nn::linear(in_dim, out_dim, vb)?
        } else {
            candle_nn::linear_no_bias(in_dim, out_dim, vb)?
        };
        let delta = match self {
            Injection::LowRank { config, vb: inj } if config.targets.contains(&role) => {
                let inj = inj.pp(prefix);
                let a = inj.get_with_hints(
                    (config.rank, in_dim),
                    "lora_a",
                    init::DEFAULT_KAIMING_UNIFORM,
                )?;
                let b = inj.get_with_hints((out_dim, config.rank), "lora_b", Init::Const(0.))?;
                Some(LowRankDelta {
                    a,
                    b,
                    scale: config.alpha / config.rank as f64,
                    dropout: config.dropout,
                })
            }
            _ => None,
        };
        Ok(AdaptableLinear { base, delta })
    }

    /// The bottleneck adapter following block `layer`, if any.
    pub fn adapter(&self, layer: usize, hidden: usize) -> Result<Option<BottleneckAdapter>> {
        match self {
            Injection::Bottleneck { config, vb } => Ok(Some(BottleneckAdapter::load(
                vb.pp("adapters").pp(layer),
                hidden,
                config,
            )?)),
            _ => Ok(None),
        }
    }
}
