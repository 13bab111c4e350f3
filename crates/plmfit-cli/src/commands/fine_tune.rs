use crate::cli::FineTuneArgs;
use anyhow::{Context, Result};
use plmfit_io::{DatasetColumns, EmbeddingKey, EmbeddingStore, HeadConfig};
use plmfit_plms::{EmbeddingSource, Experiment, ExperimentConfig, FineTuningStrategy, ModelFamily};
use tracing::info;

pub fn execute(args: FineTuneArgs) -> Result<()> {
    let device = plmfit_plms::device(args.model.cpu)?;
    let head = HeadConfig::from_file(&args.head_config)
        .with_context(|| format!("reading {}", args.head_config.display()))?;
    let strategy = args.strategy();
    let feature_extraction = strategy == FineTuningStrategy::FeatureExtraction;
    let one_hot = feature_extraction && args.embeddings == EmbeddingSource::OneHot;

    let model_name = if one_hot {
        "onehot".to_string()
    } else {
        args.model
            .name()
            .context("pass --model or --model-dir (or --embeddings one-hot)")?
    };
    let columns = match &args.split_column {
        Some(column) => DatasetColumns::default().with_split_column(column),
        None => DatasetColumns::default(),
    };

    let config = ExperimentConfig::builder()
        .data_root(args.data.data_root.clone())
        .data_type(args.data.data_type.clone())
        .model_name(model_name.clone())
        .family(args.model.family().unwrap_or(ModelFamily::Esm2))
        .head(head)
        .strategy(strategy)
        .output_dir(args.output_dir.clone())
        .columns(columns)
        .layer(args.layer)
        .reduction(args.reduction)
        .embeddings(args.embeddings)
        .extraction_batch_size(args.batch_size)
        .maybe_max_len(args.data.max_len)
        .maybe_wild_type(args.data.wild_type()?)
        .normalize_scores(args.normalize_scores)
        .build();

    let stored = EmbeddingStore::new(&args.data.data_root).contains(&EmbeddingKey::new(
        &args.data.data_type,
        &model_name,
        args.layer,
        args.reduction,
    ));
    let adapter = if one_hot || (feature_extraction && stored) {
        None
    } else {
        Some(args.model.load(&device)?)
    };

    let outcome = Experiment::new(config).run(adapter, &device)?;
    info!("{}", outcome.report.metrics);
    info!("report: {}", outcome.report_path.display());
    Ok(())
}
