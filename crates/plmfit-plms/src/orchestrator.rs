//! One fine-tuning experiment: dataset, partition, strategy, head, training,
//! test evaluation and the written report.
use crate::adapter::PlmAdapter;
use crate::encoding::{categorical_encode, one_hot_encode};
use crate::extract::ExtractionRequest;
use crate::finetune::{
    EmbeddingPredictor, EvaluationReport, FineTuner, FineTuningStrategy, FittedScaler, Partition,
    Predictor, TrainingSummary,
};
use crate::heads::Head;
use crate::models::ModelFamily;
use bon::Builder;
use candle_core::{Device, Tensor};
use plmfit_core::{LayerSpec, PlmfitError, Reduction, Result, SequenceDataset, TaskKind};
use plmfit_io::{
    dataset_path, load_dataset, DatasetColumns, EmbeddingKey, EmbeddingStore, HeadConfig,
    TrainingParameters,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use strum::{Display, EnumString};
use tracing::{info, instrument};

/// Where feature-extraction experiments get their input matrix from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum EmbeddingSource {
    /// Backbone embeddings, read from the store or extracted once.
    #[default]
    Backbone,
    /// One-hot token features; no backbone involved.
    OneHot,
}

#[derive(Debug, Clone, Builder)]
pub struct ExperimentConfig {
    /// Holds `{data_type}/{data_type}_data_full.csv` and the embedding store.
    pub data_root: PathBuf,
    pub data_type: String,
    pub model_name: String,
    pub family: ModelFamily,
    pub head: HeadConfig,
    pub strategy: FineTuningStrategy,
    pub output_dir: PathBuf,
    #[builder(default)]
    pub columns: DatasetColumns,
    #[builder(default = LayerSpec::Last)]
    pub layer: LayerSpec,
    #[builder(default = Reduction::Mean)]
    pub reduction: Reduction,
    #[builder(default)]
    pub embeddings: EmbeddingSource,
    /// Batch size of the extraction pass.
    #[builder(default = 8)]
    pub extraction_batch_size: usize,
    pub max_len: Option<usize>,
    /// Reference sequence used to derive missing mutation positions.
    pub wild_type: Option<String>,
    /// Min-max rescale regression scores to [0, 1] before training.
    #[builder(default)]
    pub normalize_scores: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentOutcome {
    pub summary: TrainingSummary,
    pub report: EvaluationReport,
    pub report_path: PathBuf,
}

/// Train/test rows from the split column, with `val_split` of the train rows
/// held out for validation after a seeded shuffle.
pub fn partition(
    dataset: &SequenceDataset,
    task: TaskKind,
    params: &TrainingParameters,
) -> Result<Partition> {
    let (mut train, test) = dataset.split_indices()?;
    let targets = dataset.labels(task)?;
    let n_val = (train.len() as f64 * params.val_split).round() as usize;
    if train.is_empty() || n_val >= train.len() {
        return Err(PlmfitError::configuration(format!(
            "cannot hold out {n_val} validation rows from {} training rows",
            train.len()
        )));
    }
    let mut rng = StdRng::seed_from_u64(params.seed);
    train.shuffle(&mut rng);
    let mut validation = train.split_off(train.len() - n_val);
    train.sort_unstable();
    validation.sort_unstable();
    info!(
        "{} train, {} validation, {} test rows",
        train.len(),
        validation.len(),
        test.len()
    );
    Ok(Partition {
        train,
        validation,
        test,
        targets,
    })
}

/// Regression labels rescaled to [0, 1] over the whole dataset.
pub fn normalized_targets(dataset: &SequenceDataset, task: TaskKind) -> Result<Vec<f32>> {
    if task != TaskKind::Regression {
        return Err(PlmfitError::configuration(format!(
            "score normalisation applies to regression, not {task}"
        )));
    }
    let scores = dataset.normalized_scores().ok_or_else(|| {
        PlmfitError::dataset(format!("`{}` has rows without a score", dataset.name))
    })?;
    Ok(scores.into_iter().map(|s| s as f32).collect())
}

pub struct Experiment {
    config: ExperimentConfig,
}

impl Experiment {
    pub fn new(config: ExperimentConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn load_dataset(&self) -> Result<SequenceDataset> {
        let path = dataset_path(&self.config.data_root, &self.config.data_type);
        let mut dataset = load_dataset(&path, &self.config.columns)?;
        if let Some(wt) = &self.config.wild_type {
            let filled = dataset.fill_mutation_positions(wt);
            if filled > 0 {
                info!("derived mutation positions for {filled} sequences from the wild type");
            }
        }
        Ok(dataset)
    }

    /// `{output_dir}/{data}_{model}_{strategy}_{layer}_{reduction}_{suffix}`
    pub fn artifact_path(&self, suffix: &str) -> PathBuf {
        let cfg = &self.config;
        cfg.output_dir.join(format!(
            "{}_{}_{}_{}_{}_{suffix}",
            cfg.data_type, cfg.model_name, cfg.strategy, cfg.layer, cfg.reduction
        ))
    }

    pub fn report_path(&self) -> PathBuf {
        self.artifact_path("metrics.json")
    }

    /// Run the whole experiment. `adapter` may be `None` only for
    /// feature-extraction on one-hot features or on already stored embeddings.
    #[instrument(skip_all, fields(data = %self.config.data_type, strategy = %self.config.strategy))]
    pub fn run(&self, adapter: Option<PlmAdapter>, device: &Device) -> Result<ExperimentOutcome> {
        let cfg = &self.config;
        cfg.head.check()?;
        let dataset = self.load_dataset()?;
        let params = &cfg.head.training_parameters;
        let mut partition = partition(&dataset, cfg.head.task, params)?;
        if cfg.normalize_scores {
            partition.targets = normalized_targets(&dataset, cfg.head.task)?;
        }
        let head = Head::from_config(&cfg.head, device)?;

        let (summary, report) = match &cfg.strategy {
            FineTuningStrategy::FeatureExtraction => {
                let features = self.features(&dataset, adapter, device)?;
                let features = match params.scaler {
                    Some(kind) => {
                        FittedScaler::fit(kind, &features, &partition.train)?.transform(&features)?
                    }
                    None => features,
                };
                let (_, dim) = features.dims2()?;
                let (summary, report, _) = drive(
                    EmbeddingPredictor::new(dim),
                    &features,
                    cfg.strategy.clone(),
                    head,
                    &partition,
                    params,
                )?;
                (summary, report)
            }
            _ => {
                let mut adapter = adapter.ok_or_else(|| {
                    PlmfitError::configuration(format!("`{}` needs a loaded model", cfg.strategy))
                })?;
                adapter.set_max_len(cfg.max_len);
                adapter.set_pooling(cfg.layer, cfg.reduction);
                let inputs = adapter.dataset_inputs(&dataset)?;
                if cfg.reduction == Reduction::MutationMean && inputs.mutation_positions.is_none() {
                    return Err(PlmfitError::MissingContext(cfg.reduction.to_string()));
                }
                let (summary, report, adapter) =
                    drive(adapter, &inputs, cfg.strategy.clone(), head, &partition, params)?;
                let weights = self.artifact_path("model.safetensors");
                adapter.save_weights(&weights)?;
                info!("fine-tuned weights written to {}", weights.display());
                (summary, report)
            }
        };

        let report_path = self.report_path();
        report.save(&report_path)?;
        write_json(&self.artifact_path("training.json"), &summary)?;
        info!("report written to {}", report_path.display());
        Ok(ExperimentOutcome {
            summary,
            report,
            report_path,
        })
    }

    /// Feature matrix for feature-extraction experiments.
    fn features(
        &self,
        dataset: &SequenceDataset,
        adapter: Option<PlmAdapter>,
        device: &Device,
    ) -> Result<Tensor> {
        let cfg = &self.config;
        match cfg.embeddings {
            EmbeddingSource::OneHot => {
                let tokenizer = cfg.family.tokenizer()?;
                let max_len = cfg.max_len.unwrap_or_else(|| dataset.max_len());
                let tokens = categorical_encode(
                    &dataset.sequences(),
                    &tokenizer,
                    max_len,
                    cfg.family.adds_bos(),
                    cfg.family.adds_eos(),
                )?;
                one_hot_encode(&tokens, tokenizer.len(), device)
            }
            EmbeddingSource::Backbone => {
                let store = EmbeddingStore::new(&cfg.data_root);
                let key = EmbeddingKey::new(
                    &dataset.name,
                    &cfg.model_name,
                    cfg.layer,
                    cfg.reduction,
                );
                if store.contains(&key) {
                    info!("using stored embeddings {}", store.path(&key).display());
                    return store.load(&key, device);
                }
                let mut adapter = adapter.ok_or_else(|| {
                    PlmfitError::EmbeddingNotFound(store.path(&key).display().to_string())
                })?;
                adapter.set_max_len(cfg.max_len);
                let request = ExtractionRequest::builder()
                    .batch_size(cfg.extraction_batch_size)
                    .layers(vec![cfg.layer])
                    .reductions(vec![cfg.reduction])
                    .build();
                let mut out = adapter.extract_embeddings(dataset, &request, Some(&store))?;
                let (_, embeddings) = out
                    .pop()
                    .ok_or_else(|| PlmfitError::configuration("extraction produced no embeddings"))?;
                Ok(embeddings)
            }
        }
    }
}

fn drive<P: Predictor>(
    model: P,
    input: &P::Input,
    strategy: FineTuningStrategy,
    head: Head,
    partition: &Partition,
    params: &TrainingParameters,
) -> Result<(TrainingSummary, EvaluationReport, P)> {
    let mut tuner = FineTuner::new(model);
    tuner.select_parameters(strategy)?;
    tuner.attach_head(head)?;
    let summary = tuner.train(input, partition, params)?.clone();
    let report = tuner.evaluate(input, partition, params.batch_size)?;
    Ok((summary, report, tuner.into_model()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use plmfit_core::ProteinSequence;

    fn dataset() -> SequenceDataset {
        let records = (0..10)
            .map(|i| ProteinSequence {
                split: Some(if i < 8 {
                    plmfit_core::Split::Train
                } else {
                    plmfit_core::Split::Test
                }),
                score: Some(i as f64),
                ..ProteinSequence::new("MKT")
            })
            .collect();
        SequenceDataset::new("toy", records)
    }

    #[test]
    fn test_partition_is_disjoint_and_seeded() -> anyhow::Result<()> {
        let params = TrainingParameters {
            val_split: 0.25,
            ..Default::default()
        };
        let a = partition(&dataset(), TaskKind::Regression, &params)?;
        assert_eq!(a.validation.len(), 2);
        assert_eq!(a.train.len(), 6);
        assert_eq!(a.test, vec![8, 9]);
        assert!(a.validation.iter().all(|v| !a.train.contains(v)));
        let b = partition(&dataset(), TaskKind::Regression, &params)?;
        assert_eq!(a.validation, b.validation);
        Ok(())
    }

    #[test]
    fn test_normalized_targets_span_unit_interval() -> anyhow::Result<()> {
        let targets = normalized_targets(&dataset(), TaskKind::Regression)?;
        assert_eq!(targets.len(), 10);
        assert_eq!(targets[0], 0.0);
        assert_eq!(targets[9], 1.0);
        assert!(targets.windows(2).all(|w| w[0] < w[1]));
        assert!(normalized_targets(&dataset(), TaskKind::Classification).is_err());
        Ok(())
    }

    #[test]
    fn test_partition_needs_labels() {
        let params = TrainingParameters::default();
        let err = partition(&dataset(), TaskKind::Classification, &params);
        assert!(matches!(err, Err(PlmfitError::Dataset(_))));
    }
}
