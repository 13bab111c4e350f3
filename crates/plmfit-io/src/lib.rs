//! plmfit-io
//!
//! File-facing collaborators of the fine-tuning pipeline:
//!
//! - tabular datasets (`{root}/{data_type}/{data_type}_data_full.csv`)
//! - the on-disk embedding store
//! - head configuration and wild-type documents
//! - FASTA files
pub mod config;
pub mod dataset;
pub mod embeddings;
pub mod fasta;

pub use config::{
    ActivationKind, FeatureScaler, HeadConfig, NetworkType, OptimizerKind, TrainingParameters,
    WildType,
};
pub use dataset::{dataset_path, load_dataset, DatasetColumns};
pub use embeddings::{EmbeddingKey, EmbeddingStore};
pub use fasta::{fasta_dataset, parse_fasta, read_fasta, FastaRecord};
