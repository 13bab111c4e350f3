//! Layers shared by the backbone families.
//!
//! Normalisation and rotary embeddings are written with primitive tensor ops
//! so gradients flow through them during full retraining.
pub mod norm;
pub mod peft;
pub mod rotary;

pub use norm::{LayerNorm, RmsNorm};
pub use peft::{
    AdaptableLinear, BottleneckAdapter, BottleneckConfig, Injection, LinearRole, LoraConfig,
};
pub use rotary::RotaryEmbedding;
