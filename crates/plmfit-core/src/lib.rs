//! plmfit-core
//!
//! Shared data model for the plmfit crates:
//!
//! - [`ProteinSequence`] / [`SequenceDataset`]: immutable records loaded from a dataset.
//! - [`LayerSpec`] / [`HiddenStates`]: symbolic layer requests resolved against a hidden-state stack.
//! - [`Reduction`]: policies collapsing the token axis of a layer into one vector per sequence.
//! - [`PlmfitError`]: the error taxonomy used throughout the workspace.
pub mod error;
pub mod layers;
pub mod reduction;
pub mod sequence;

pub use error::{PlmfitError, Result};
pub use layers::{HiddenStates, LayerSpec};
pub use reduction::{reduce, Reduction, ReductionContext};
pub use sequence::{ProteinSequence, SequenceDataset, Split, TaskKind};
