use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlmfitError>;

#[derive(Error, Debug)]
pub enum PlmfitError {
    /// Tokenizer or vocabulary does not match the family convention.
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("unsupported reduction: {0}")]
    UnsupportedReduction(String),
    #[error("reduction `{0}` requires mutation positions for every sequence")]
    MissingContext(String),
    #[error("layer index {index} is out of range for a stack of {len} hidden states")]
    LayerIndex { index: usize, len: usize },
    #[error("head expects {head_input} input features but the backbone produces {embedding_dim}")]
    BackboneMismatch {
        head_input: usize,
        embedding_dim: usize,
    },
    /// Invalid fine-tuning state transition or invalid setup.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("no stored embeddings at {0}")]
    EmbeddingNotFound(String),
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error("invalid configuration document: {0}")]
    Validation(String),
    #[error("loss became non-finite at epoch {epoch}")]
    NonFiniteLoss { epoch: usize },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PlmfitError {
    pub fn encoding(msg: impl std::fmt::Display) -> Self {
        Self::Encoding(msg.to_string())
    }

    pub fn configuration(msg: impl std::fmt::Display) -> Self {
        Self::Configuration(msg.to_string())
    }

    pub fn dataset(msg: impl std::fmt::Display) -> Self {
        Self::Dataset(msg.to_string())
    }
}
