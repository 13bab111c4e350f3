//! plmfit-plms
//!
//! Protein language models and the encode, embed, adapt pipeline around them:
//!
//! - [`tokenizer`] / [`encoding`]: family vocabularies and fixed-width token matrices.
//! - [`models`]: ESM-2, ProGen2 and Ankh backbones in candle.
//! - [`adapter::PlmAdapter`]: one backbone behind a uniform embedding / forward / fine-tune contract.
//! - [`extract`]: batched multi-layer, multi-reduction embedding extraction.
//! - [`heads`], [`finetune`]: downstream heads, strategies, training and metrics.
//! - [`orchestrator`]: a full experiment from dataset to evaluation report.
//!
//! ```shell
//! cargo run -p plmfit-cli -- models
//! cargo run -p plmfit-cli --features metal -- extract-embeddings --help
//! ```
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Result};
use tracing::info;

pub mod adapter;
pub mod encoding;
pub mod extract;
pub mod finetune;
pub mod heads;
pub mod models;
pub mod nn;
pub mod orchestrator;
pub mod pretrained;
pub mod tokenizer;

pub use adapter::{ParameterCounts, PlmAdapter, TokenInputs};
pub use encoding::{categorical_encode, one_hot_encode, TokenMatrix};
pub use extract::{batch_ranges, ExtractionRequest, HiddenStateSource};
pub use finetune::{FineTuner, FineTuningStrategy, Predictor};
pub use heads::Head;
pub use models::{Backbone, BackboneConfig, ModelFamily};
pub use orchestrator::{EmbeddingSource, Experiment, ExperimentConfig};
pub use pretrained::PretrainedModels;
pub use tokenizer::ProteinTokenizer;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}
