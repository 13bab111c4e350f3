//! Fine-tuning strategies and the fine-tuning state machine.
//!
//! A [`FineTuningStrategy`] is chosen once, when the experiment is configured.
//! It decides which parameters are trainable and, for the parameter-efficient
//! variants, what gets injected into the backbone. [`FineTuner`] enforces the
//! order `Unconfigured -> ParametersSelected -> HeadAttached -> Training -> Evaluated`.
pub mod metrics;
pub mod trainer;

use crate::heads::Head;
use crate::nn::{BottleneckConfig, Injection, LoraConfig};
use candle_core::{Tensor, Var};
use candle_nn::VarBuilder;
use plmfit_core::{PlmfitError, Result, TaskKind};
use plmfit_io::TrainingParameters;
use std::fmt;
use std::str::FromStr;
use strum::Display;
use tracing::info;

pub use metrics::{EvaluationReport, Metrics};
pub use trainer::{fit, predict, FittedScaler, TrainingSummary};

#[derive(Debug, Clone, PartialEq)]
pub enum FineTuningStrategy {
    /// Backbone and head are trained.
    FullRetrain,
    /// Frozen backbone; only the head is trained.
    FeatureExtraction,
    LowRankAdaptation(LoraConfig),
    BottleneckAdapter(BottleneckConfig),
}

/// Which backbone-side parameters a strategy unfreezes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainableSet {
    #[default]
    Nothing,
    Backbone,
    Injected,
}

impl FineTuningStrategy {
    pub fn trainable_set(&self) -> TrainableSet {
        match self {
            FineTuningStrategy::FullRetrain => TrainableSet::Backbone,
            FineTuningStrategy::FeatureExtraction => TrainableSet::Nothing,
            FineTuningStrategy::LowRankAdaptation(_) | FineTuningStrategy::BottleneckAdapter(_) => {
                TrainableSet::Injected
            }
        }
    }

    /// Injection to build the backbone with; injected weights land in `vb`.
    pub fn injection(&self, vb: VarBuilder<'static>) -> Injection {
        match self {
            FineTuningStrategy::LowRankAdaptation(config) => Injection::LowRank {
                config: config.clone(),
                vb,
            },
            FineTuningStrategy::BottleneckAdapter(config) => Injection::Bottleneck {
                config: config.clone(),
                vb,
            },
            _ => Injection::None,
        }
    }
}

impl FromStr for FineTuningStrategy {
    type Err = PlmfitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "full-retrain" | "full" => Ok(FineTuningStrategy::FullRetrain),
            "feature-extraction" => Ok(FineTuningStrategy::FeatureExtraction),
            "lora" | "low-rank-adaptation" => {
                Ok(FineTuningStrategy::LowRankAdaptation(LoraConfig::default()))
            }
            "bottleneck-adapter" | "adapters" => {
                Ok(FineTuningStrategy::BottleneckAdapter(BottleneckConfig::default()))
            }
            _ => Err(PlmfitError::configuration(format!(
                "unknown fine-tuning strategy `{s}`"
            ))),
        }
    }
}

impl fmt::Display for FineTuningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FineTuningStrategy::FullRetrain => "full-retrain",
            FineTuningStrategy::FeatureExtraction => "feature-extraction",
            FineTuningStrategy::LowRankAdaptation(_) => "lora",
            FineTuningStrategy::BottleneckAdapter(_) => "bottleneck-adapter",
        };
        f.write_str(name)
    }
}

/// A model the trainer can drive: strategy application, head composition and
/// batched prediction over row indices of its whole-dataset input.
pub trait Predictor {
    type Input;

    fn apply_strategy(&mut self, strategy: &FineTuningStrategy) -> Result<()>;
    fn attach_head(&mut self, head: Head) -> Result<()>;
    fn head(&self) -> Option<&Head>;
    /// Variables handed to the optimizer, head included.
    fn trainable_vars(&self) -> Vec<Var>;
    /// `[rows.len(), output_dim]` predictions.
    fn predict_rows(&self, input: &Self::Input, rows: &[usize], train: bool) -> Result<Tensor>;
}

/// Head-only model over a precomputed `[N, D]` embedding matrix.
pub struct EmbeddingPredictor {
    dim: usize,
    head: Option<Head>,
}

impl EmbeddingPredictor {
    pub fn new(dim: usize) -> Self {
        Self { dim, head: None }
    }
}

impl Predictor for EmbeddingPredictor {
    type Input = Tensor;

    fn apply_strategy(&mut self, strategy: &FineTuningStrategy) -> Result<()> {
        match strategy {
            FineTuningStrategy::FeatureExtraction => Ok(()),
            other => Err(PlmfitError::configuration(format!(
                "`{other}` needs a backbone; precomputed embeddings only support feature-extraction"
            ))),
        }
    }

    fn attach_head(&mut self, head: Head) -> Result<()> {
        if head.input_dim() != self.dim {
            return Err(PlmfitError::BackboneMismatch {
                head_input: head.input_dim(),
                embedding_dim: self.dim,
            });
        }
        self.head = Some(head);
        Ok(())
    }

    fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.head.as_ref().map(Head::vars).unwrap_or_default()
    }

    fn predict_rows(&self, input: &Tensor, rows: &[usize], train: bool) -> Result<Tensor> {
        let head = self
            .head
            .as_ref()
            .ok_or_else(|| PlmfitError::configuration("no head attached"))?;
        let idx: Vec<u32> = rows.iter().map(|&r| r as u32).collect();
        let idx = Tensor::new(idx.as_slice(), input.device())?;
        head.forward_t(&input.index_select(&idx, 0)?, train)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FineTuneState {
    Unconfigured,
    ParametersSelected,
    HeadAttached,
    Training,
    Evaluated,
}

/// Row partition and targets of one experiment.
#[derive(Debug, Clone)]
pub struct Partition {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
    pub test: Vec<usize>,
    /// One target per dataset row.
    pub targets: Vec<f32>,
}

pub struct FineTuner<P: Predictor> {
    model: P,
    state: FineTuneState,
    strategy: Option<FineTuningStrategy>,
    summary: Option<TrainingSummary>,
}

impl<P: Predictor> FineTuner<P> {
    pub fn new(model: P) -> Self {
        Self {
            model,
            state: FineTuneState::Unconfigured,
            strategy: None,
            summary: None,
        }
    }

    pub fn state(&self) -> FineTuneState {
        self.state
    }

    pub fn model(&self) -> &P {
        &self.model
    }

    pub fn into_model(self) -> P {
        self.model
    }

    fn expect_state(&self, allowed: &[FineTuneState], action: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PlmfitError::configuration(format!(
                "cannot {action} in state {}",
                self.state
            )))
        }
    }

    pub fn select_parameters(&mut self, strategy: FineTuningStrategy) -> Result<()> {
        self.expect_state(
            &[FineTuneState::Unconfigured, FineTuneState::ParametersSelected],
            "select parameters",
        )?;
        self.model.apply_strategy(&strategy)?;
        info!("fine-tuning strategy: {strategy}");
        self.strategy = Some(strategy);
        self.state = FineTuneState::ParametersSelected;
        Ok(())
    }

    pub fn attach_head(&mut self, head: Head) -> Result<()> {
        self.expect_state(&[FineTuneState::ParametersSelected], "attach a head")?;
        self.model.attach_head(head)?;
        self.state = FineTuneState::HeadAttached;
        Ok(())
    }

    pub fn train(
        &mut self,
        input: &P::Input,
        partition: &Partition,
        params: &TrainingParameters,
    ) -> Result<&TrainingSummary> {
        self.expect_state(&[FineTuneState::HeadAttached], "train")?;
        let head = self
            .model
            .head()
            .ok_or_else(|| PlmfitError::configuration("cannot train without a head"))?;
        let task = head.task();
        if self.model.trainable_vars().is_empty() {
            return Err(PlmfitError::configuration(
                "the trainable parameter set is empty",
            ));
        }
        self.state = FineTuneState::Training;
        let summary = fit(&self.model, input, partition, task, params)?;
        Ok(self.summary.insert(summary))
    }

    /// Full pass over the test rows; the only way to reach `Evaluated`.
    pub fn evaluate(
        &mut self,
        input: &P::Input,
        partition: &Partition,
        batch_size: usize,
    ) -> Result<EvaluationReport> {
        self.expect_state(&[FineTuneState::Training], "evaluate")?;
        let task = self
            .model
            .head()
            .map(Head::task)
            .unwrap_or(TaskKind::Regression);
        let preds = predict(&self.model, input, &partition.test, batch_size)?;
        let actual: Vec<f32> = partition.test.iter().map(|&r| partition.targets[r]).collect();
        let report = EvaluationReport::new(task, preds, actual);
        info!("test metrics: {}", report.metrics);
        self.state = FineTuneState::Evaluated;
        Ok(report)
    }

    pub fn summary(&self) -> Option<&TrainingSummary> {
        self.summary.as_ref()
    }

    pub fn strategy(&self) -> Option<&FineTuningStrategy> {
        self.strategy.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use plmfit_io::{HeadConfig, NetworkType};

    fn head(input_dim: usize) -> anyhow::Result<Head> {
        let cfg = HeadConfig {
            network_type: NetworkType::Linear,
            input_dim,
            output_dim: 1,
            hidden_dim: None,
            task: TaskKind::Regression,
            hidden_activation: None,
            output_activation: None,
            hidden_dropout: 0.0,
            training_parameters: TrainingParameters::default(),
        };
        Ok(Head::from_config(&cfg, &Device::Cpu)?)
    }

    fn partition() -> Partition {
        Partition {
            train: vec![0, 1, 2],
            validation: vec![3],
            test: vec![4],
            targets: vec![0.0, 1.0, 2.0, 3.0, 4.0],
        }
    }

    #[test]
    fn test_strategy_parsing() -> anyhow::Result<()> {
        assert_eq!(
            "feature_extraction".parse::<FineTuningStrategy>()?,
            FineTuningStrategy::FeatureExtraction
        );
        assert_eq!("lora".parse::<FineTuningStrategy>()?.to_string(), "lora");
        assert_eq!(
            "bottleneck-adapter".parse::<FineTuningStrategy>()?.trainable_set(),
            TrainableSet::Injected
        );
        assert!("dropout".parse::<FineTuningStrategy>().is_err());
        Ok(())
    }

    #[test]
    fn test_train_before_head_is_a_configuration_error() -> anyhow::Result<()> {
        let features = Tensor::zeros((5, 4), candle_core::DType::F32, &Device::Cpu)?;
        let mut tuner = FineTuner::new(EmbeddingPredictor::new(4));
        let params = TrainingParameters::default();
        let err = tuner.train(&features, &partition(), &params);
        assert!(matches!(err, Err(PlmfitError::Configuration(_))));

        tuner.select_parameters(FineTuningStrategy::FeatureExtraction)?;
        let err = tuner.train(&features, &partition(), &params);
        assert!(matches!(err, Err(PlmfitError::Configuration(_))));
        assert_eq!(tuner.state(), FineTuneState::ParametersSelected);
        Ok(())
    }

    #[test]
    fn test_state_order_is_enforced() -> anyhow::Result<()> {
        let mut tuner = FineTuner::new(EmbeddingPredictor::new(4));
        assert!(matches!(
            tuner.attach_head(head(4)?),
            Err(PlmfitError::Configuration(_))
        ));
        assert!(tuner
            .select_parameters(FineTuningStrategy::FullRetrain)
            .is_err());
        tuner.select_parameters(FineTuningStrategy::FeatureExtraction)?;
        assert!(matches!(
            tuner.attach_head(head(3)?),
            Err(PlmfitError::BackboneMismatch {
                head_input: 3,
                embedding_dim: 4
            })
        ));
        tuner.attach_head(head(4)?)?;
        assert_eq!(tuner.state(), FineTuneState::HeadAttached);

        let features = Tensor::zeros((5, 4), candle_core::DType::F32, &Device::Cpu)?;
        assert!(tuner.evaluate(&features, &partition(), 2).is_err());
        Ok(())
    }
}
