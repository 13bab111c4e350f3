//! Head configuration and wild-type reference documents.
//!
//! ```json
//! {
//!   "network_type": "mlp",
//!   "input_dim": 320,
//!   "hidden_dim": 64,
//!   "output_dim": 1,
//!   "task": "regression",
//!   "hidden_activation": "relu",
//!   "hidden_dropout": 0.25,
//!   "training_parameters": {
//!     "batch_size": 16, "val_split": 0.2, "learning_rate": 0.001, "epochs": 50,
//!     "early_stopping": 5, "scaler": "standard"
//!   }
//! }
//! ```
use plmfit_core::{PlmfitError, Result, TaskKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum::{Display, EnumString};
use validator::Validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Linear,
    Mlp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    #[serde(alias = "adamw")]
    Adam,
    Sgd,
}

/// Feature scaling fitted on the training rows of precomputed embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FeatureScaler {
    Standard,
    #[serde(alias = "min_max")]
    MinMax,
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct TrainingParameters {
    #[validate(range(min = 1))]
    pub batch_size: usize,
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub val_split: f64,
    #[validate(range(exclusive_min = 0.0))]
    pub learning_rate: f64,
    #[validate(range(min = 1))]
    pub epochs: usize,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub weight_decay: f64,
    #[serde(default)]
    pub optimizer: OptimizerKind,
    /// Patience in epochs without validation improvement.
    #[serde(default)]
    #[validate(range(min = 1))]
    pub early_stopping: Option<usize>,
    #[serde(default)]
    pub scaler: Option<FeatureScaler>,
    /// Dynamic loss scaling; an exhausted scale ends training early.
    #[serde(default)]
    pub loss_scaling: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for TrainingParameters {
    fn default() -> Self {
        Self {
            batch_size: 8,
            val_split: 0.2,
            learning_rate: 1e-3,
            epochs: 10,
            weight_decay: 0.0,
            optimizer: OptimizerKind::Adam,
            early_stopping: None,
            scaler: None,
            loss_scaling: false,
            seed: default_seed(),
        }
    }
}

fn default_output_dim() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct HeadConfig {
    pub network_type: NetworkType,
    #[validate(range(min = 1))]
    pub input_dim: usize,
    #[serde(default = "default_output_dim")]
    #[validate(range(min = 1))]
    pub output_dim: usize,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub hidden_dim: Option<usize>,
    pub task: TaskKind,
    #[serde(default)]
    pub hidden_activation: Option<ActivationKind>,
    #[serde(default)]
    pub output_activation: Option<ActivationKind>,
    #[serde(default)]
    #[validate(range(min = 0.0, exclusive_max = 1.0))]
    pub hidden_dropout: f64,
    #[serde(default)]
    #[validate(nested)]
    pub training_parameters: TrainingParameters,
}

impl HeadConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HeadConfig = serde_json::from_str(json)?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    /// Field ranges plus the cross-field rules serde cannot express.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| PlmfitError::Validation(e.to_string()))?;
        if self.network_type == NetworkType::Mlp && self.hidden_dim.is_none() {
            return Err(PlmfitError::configuration(
                "an mlp head requires `hidden_dim`",
            ));
        }
        Ok(())
    }
}

/// `{ "wild_type": "<sequence>" }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildType {
    pub wild_type: String,
}

impl WildType {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// `(position, wild-type residue, variant residue)` for each difference.
    pub fn mutations(&self, variant: &str) -> Result<Vec<(usize, char, char)>> {
        if variant.chars().count() != self.wild_type.chars().count() {
            return Err(PlmfitError::dataset(
                "variant and wild type differ in length",
            ));
        }
        Ok(self
            .wild_type
            .chars()
            .zip(variant.chars())
            .enumerate()
            .filter(|(_, (wt, v))| wt != v)
            .map(|(i, (wt, v))| (i, wt, v))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"{
        "network_type": "linear",
        "input_dim": 32,
        "output_dim": 1,
        "task": "classification",
        "output_activation": "sigmoid",
        "training_parameters": {
            "batch_size": 4, "val_split": 0.25, "learning_rate": 0.01, "epochs": 3
        }
    }"#;

    #[test]
    fn test_parse_linear_head() -> anyhow::Result<()> {
        let cfg = HeadConfig::from_json_str(LINEAR)?;
        assert_eq!(cfg.network_type, NetworkType::Linear);
        assert_eq!(cfg.task, TaskKind::Classification);
        assert_eq!(cfg.output_activation, Some(ActivationKind::Sigmoid));
        assert_eq!(cfg.training_parameters.optimizer, OptimizerKind::Adam);
        assert_eq!(cfg.training_parameters.seed, 42);
        Ok(())
    }

    #[test]
    fn test_mlp_requires_hidden_dim() {
        let json = LINEAR.replace("\"linear\"", "\"mlp\"");
        assert!(matches!(
            HeadConfig::from_json_str(&json),
            Err(PlmfitError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_range_training_parameters() {
        let json = LINEAR.replace("\"val_split\": 0.25", "\"val_split\": 1.5");
        assert!(matches!(
            HeadConfig::from_json_str(&json),
            Err(PlmfitError::Validation(_))
        ));
        let json = LINEAR.replace("\"batch_size\": 4", "\"batch_size\": 0");
        assert!(HeadConfig::from_json_str(&json).is_err());
    }

    #[test]
    fn test_wild_type_mutations() -> anyhow::Result<()> {
        let wt = WildType {
            wild_type: "MKTAY".to_string(),
        };
        assert_eq!(wt.mutations("MKTAW")?, vec![(4, 'Y', 'W')]);
        assert!(wt.mutations("MKT").is_err());
        Ok(())
    }
}
