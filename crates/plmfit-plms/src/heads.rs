//! Downstream heads mapping pooled embeddings to task predictions.
//!
//! A head owns its parameters in a private `VarMap`; it is composed onto a
//! model adapter but never shares storage with the backbone.
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use plmfit_core::{PlmfitError, Result, TaskKind};
use plmfit_io::{ActivationKind, HeadConfig, NetworkType};

pub fn activate(kind: ActivationKind, xs: &Tensor) -> candle_core::Result<Tensor> {
    match kind {
        ActivationKind::Relu => xs.relu(),
        ActivationKind::Sigmoid => (xs.neg()?.exp()? + 1.0)?.recip(),
        ActivationKind::Tanh => xs.tanh(),
        ActivationKind::Gelu => xs.gelu_erf(),
        ActivationKind::Softmax => candle_nn::ops::softmax(xs, D::Minus1),
    }
}

fn linear_with(vb: VarBuilder, in_dim: usize, out_dim: usize, weight: Init) -> candle_core::Result<Linear> {
    let w = vb.get_with_hints((out_dim, in_dim), "weight", weight)?;
    let b = vb.get_with_hints(out_dim, "bias", Init::Const(0.))?;
    Ok(Linear::new(w, Some(b)))
}

fn xavier_uniform(in_dim: usize, out_dim: usize) -> Init {
    let bound = (6.0 / (in_dim + out_dim) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

const NEAR_ZERO: Init = Init::Randn {
    mean: 0.0,
    stdev: 0.01,
};

enum HeadKind {
    Linear(Linear),
    Mlp {
        hidden: Linear,
        dropout: f32,
        hidden_activation: Option<ActivationKind>,
        output: Linear,
    },
}

pub struct Head {
    varmap: VarMap,
    kind: HeadKind,
    task: TaskKind,
    input_dim: usize,
    output_dim: usize,
    output_activation: Option<ActivationKind>,
}

impl Head {
    pub fn from_config(cfg: &HeadConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let classification = cfg.task == TaskKind::Classification;
        let kind = match cfg.network_type {
            NetworkType::Linear => {
                let linear = if classification {
                    linear_with(vb.pp("linear"), cfg.input_dim, cfg.output_dim, NEAR_ZERO)?
                } else {
                    candle_nn::linear(cfg.input_dim, cfg.output_dim, vb.pp("linear"))?
                };
                HeadKind::Linear(linear)
            }
            NetworkType::Mlp => {
                let hidden_dim = cfg
                    .hidden_dim
                    .ok_or_else(|| PlmfitError::configuration("an mlp head requires `hidden_dim`"))?;
                HeadKind::Mlp {
                    hidden: linear_with(
                        vb.pp("hidden"),
                        cfg.input_dim,
                        hidden_dim,
                        xavier_uniform(cfg.input_dim, hidden_dim),
                    )?,
                    dropout: cfg.hidden_dropout as f32,
                    hidden_activation: cfg.hidden_activation,
                    output: linear_with(vb.pp("output"), hidden_dim, cfg.output_dim, NEAR_ZERO)?,
                }
            }
        };
        Ok(Self {
            varmap,
            kind,
            task: cfg.task,
            input_dim: cfg.input_dim,
            output_dim: cfg.output_dim,
            output_activation: cfg.output_activation.filter(|_| classification),
        })
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    /// True when the output already lies in `[0, 1]`.
    pub fn emits_probabilities(&self) -> bool {
        matches!(
            self.output_activation,
            Some(ActivationKind::Sigmoid | ActivationKind::Softmax)
        )
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }

    /// `[batch, input_dim]` to `[batch, output_dim]`.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = match &self.kind {
            HeadKind::Linear(linear) => linear.forward(xs)?,
            HeadKind::Mlp {
                hidden,
                dropout,
                hidden_activation,
                output,
            } => {
                let mut h = hidden.forward(xs)?;
                if train && *dropout > 0.0 {
                    h = candle_nn::ops::dropout(&h, *dropout)?;
                }
                if let Some(act) = hidden_activation {
                    h = activate(*act, &h)?;
                }
                output.forward(&h)?
            }
        };
        Ok(match self.output_activation {
            Some(act) => activate(act, &out)?,
            None => out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plmfit_io::TrainingParameters;

    fn config(network_type: NetworkType, task: TaskKind) -> HeadConfig {
        HeadConfig {
            network_type,
            input_dim: 6,
            output_dim: 1,
            hidden_dim: Some(4),
            task,
            hidden_activation: Some(ActivationKind::Relu),
            output_activation: Some(ActivationKind::Sigmoid),
            hidden_dropout: 0.5,
            training_parameters: TrainingParameters::default(),
        }
    }

    #[test]
    fn test_linear_classification_head() -> anyhow::Result<()> {
        let head = Head::from_config(&config(NetworkType::Linear, TaskKind::Classification), &Device::Cpu)?;
        assert_eq!(head.num_parameters(), 7);
        assert!(head.emits_probabilities());
        let out = head.forward_t(&Tensor::randn(0f32, 1f32, (3, 6), &Device::Cpu)?, false)?;
        assert_eq!(out.dims(), &[3, 1]);
        assert!(out.flatten_all()?.to_vec1::<f32>()?.iter().all(|p| *p > 0.0 && *p < 1.0));
        Ok(())
    }

    #[test]
    fn test_regression_ignores_output_activation() -> anyhow::Result<()> {
        let head = Head::from_config(&config(NetworkType::Mlp, TaskKind::Regression), &Device::Cpu)?;
        assert!(!head.emits_probabilities());
        assert_eq!(head.num_parameters(), 6 * 4 + 4 + 4 + 1);
        let xs = Tensor::randn(0f32, 1f32, (2, 6), &Device::Cpu)?;
        // inference is deterministic even with dropout configured
        let a = head.forward_t(&xs, false)?.to_vec2::<f32>()?;
        let b = head.forward_t(&xs, false)?.to_vec2::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
