use super::commands;
use clap::{Args, Parser, Subcommand};
use plmfit_core::{LayerSpec, Reduction};
use plmfit_plms::{EmbeddingSource, FineTuningStrategy, ModelFamily, PretrainedModels};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "plmfit", author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the backbone comes from.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Pretrained checkpoint name, see `plmfit models`.
    #[arg(long, conflicts_with = "model_dir")]
    pub model: Option<PretrainedModels>,
    /// Local checkpoint directory holding `config.json` and `model*.safetensors`.
    #[arg(long, requires = "family")]
    pub model_dir: Option<PathBuf>,
    /// Model family of `--model-dir` (esm2, progen2, ankh).
    #[arg(long)]
    pub family: Option<ModelFamily>,
    /// Run on the CPU even when an accelerator is available.
    #[arg(long)]
    pub cpu: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DataArgs {
    /// Directory holding `{data_type}/{data_type}_data_full.csv`.
    #[arg(long, default_value = "data")]
    pub data_root: PathBuf,
    #[arg(long)]
    pub data_type: String,
    /// Wild-type JSON used to derive mutation positions.
    #[arg(long)]
    pub wild_type: Option<PathBuf>,
    /// Residue limit per sequence; defaults to the longest sequence.
    #[arg(long)]
    pub max_len: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ExtractArgs {
    #[command(flatten)]
    pub model: ModelArgs,
    #[command(flatten)]
    pub data: DataArgs,
    /// Read sequences from a FASTA file instead of the dataset CSV.
    /// Embeddings are still stored under `{data_root}/{data_type}`.
    #[arg(long)]
    pub fasta: Option<PathBuf>,
    /// first, middle, last, quarter1, quarter3 or an index.
    #[arg(long, value_delimiter = ',', default_value = "last")]
    pub layers: Vec<LayerSpec>,
    /// mean, sum, bos, eos, mut_mean or a token position.
    #[arg(long, value_delimiter = ',', default_value = "mean")]
    pub reductions: Vec<Reduction>,
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
    /// Recompute embeddings already in the store.
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FineTuneArgs {
    #[command(flatten)]
    pub model: ModelArgs,
    #[command(flatten)]
    pub data: DataArgs,
    /// Head configuration JSON.
    #[arg(long)]
    pub head_config: PathBuf,
    /// full-retrain, feature-extraction, lora or bottleneck-adapter.
    #[arg(long, default_value = "feature-extraction")]
    pub strategy: FineTuningStrategy,
    /// Split column of the dataset.
    #[arg(long)]
    pub split_column: Option<String>,
    #[arg(long, default_value = "last")]
    pub layer: LayerSpec,
    #[arg(long, default_value = "mean")]
    pub reduction: Reduction,
    /// Min-max rescale regression scores to [0, 1].
    #[arg(long)]
    pub normalize_scores: bool,
    /// Input of feature-extraction runs: backbone or one-hot.
    #[arg(long, default_value = "backbone")]
    pub embeddings: EmbeddingSource,
    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,
    /// Batch size of the embedding extraction pass.
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
    #[arg(long)]
    pub lora_rank: Option<usize>,
    #[arg(long)]
    pub lora_alpha: Option<f64>,
    #[arg(long)]
    pub bottleneck_dim: Option<usize>,
}

impl FineTuneArgs {
    pub fn strategy(&self) -> FineTuningStrategy {
        let mut strategy = self.strategy.clone();
        match &mut strategy {
            FineTuningStrategy::LowRankAdaptation(lora) => {
                if let Some(rank) = self.lora_rank {
                    lora.rank = rank;
                }
                if let Some(alpha) = self.lora_alpha {
                    lora.alpha = alpha;
                }
            }
            FineTuningStrategy::BottleneckAdapter(adapter) => {
                if let Some(dim) = self.bottleneck_dim {
                    adapter.bottleneck_dim = dim;
                }
            }
            _ => {}
        }
        strategy
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Extract and store embeddings for every requested layer and reduction.
    ExtractEmbeddings(ExtractArgs),
    /// Fine-tune a head (and optionally the backbone) and evaluate on the test split.
    FineTune(FineTuneArgs),
    /// List the known pretrained checkpoints.
    Models,
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        match self.command {
            Commands::ExtractEmbeddings(args) => commands::extract::execute(args),
            Commands::FineTune(args) => commands::fine_tune::execute(args),
            Commands::Models => commands::models::execute(),
        }
    }
}
