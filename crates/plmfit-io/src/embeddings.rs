//! On-disk embedding store.
//!
//! One safetensors file per (dataset, model, layer, reduction) key, laid out as
//! `{root}/{dataset}/embeddings/{dataset}_{model}_embs_layer{layer}_{reduction}.safetensors`.
use candle_core::{Device, Tensor};
use plmfit_core::{LayerSpec, PlmfitError, Reduction, Result};
use std::path::{Path, PathBuf};
use tracing::info;

const TENSOR_NAME: &str = "embeddings";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmbeddingKey {
    pub dataset: String,
    pub model: String,
    pub layer: LayerSpec,
    pub reduction: Reduction,
}

impl EmbeddingKey {
    pub fn new(
        dataset: impl Into<String>,
        model: impl Into<String>,
        layer: LayerSpec,
        reduction: Reduction,
    ) -> Self {
        Self {
            dataset: dataset.into(),
            model: model.into(),
            layer,
            reduction,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_embs_layer{}_{}.safetensors",
            self.dataset, self.model, self.layer, self.reduction
        )
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    root: PathBuf,
}

impl EmbeddingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, key: &EmbeddingKey) -> PathBuf {
        self.root
            .join(&key.dataset)
            .join("embeddings")
            .join(key.file_name())
    }

    pub fn contains(&self, key: &EmbeddingKey) -> bool {
        self.path(key).is_file()
    }

    /// Write an embedding matrix. Rewriting a key replaces the file.
    pub fn save(&self, key: &EmbeddingKey, embeddings: &Tensor) -> Result<PathBuf> {
        let path = self.path(key);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        embeddings.save_safetensors(TENSOR_NAME, &path)?;
        info!(
            "saved embeddings {:?} to {}",
            embeddings.dims(),
            path.display()
        );
        Ok(path)
    }

    pub fn load(&self, key: &EmbeddingKey, device: &Device) -> Result<Tensor> {
        let path = self.path(key);
        if !path.is_file() {
            return Err(PlmfitError::EmbeddingNotFound(path.display().to_string()));
        }
        let mut tensors = candle_core::safetensors::load(&path, device)?;
        tensors.remove(TENSOR_NAME).ok_or_else(|| {
            PlmfitError::EmbeddingNotFound(format!("{} (no `{TENSOR_NAME}` tensor)", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_encodes_key() {
        let key = EmbeddingKey::new("gb1", "progen2-small", LayerSpec::Middle, Reduction::Mean);
        assert_eq!(
            key.file_name(),
            "gb1_progen2-small_embs_layermiddle_mean.safetensors"
        );
        let key = EmbeddingKey::new("aav", "esm2", LayerSpec::Index(3), Reduction::Position(0));
        assert_eq!(key.file_name(), "aav_esm2_embs_layer3_pos0.safetensors");
    }

    #[test]
    fn test_round_trip_is_bit_identical() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = EmbeddingStore::new(dir.path());
        let key = EmbeddingKey::new("toy", "esm2", LayerSpec::Last, Reduction::Sum);
        let data = Tensor::randn(0f32, 1f32, (5, 8), &Device::Cpu)?;
        store.save(&key, &data)?;
        assert!(store.contains(&key));
        let back = store.load(&key, &Device::Cpu)?;
        assert_eq!(back.to_vec2::<f32>()?, data.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_missing_key() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = EmbeddingStore::new(dir.path());
        let key = EmbeddingKey::new("toy", "esm2", LayerSpec::First, Reduction::Bos);
        let err = store.load(&key, &Device::Cpu);
        assert!(matches!(err, Err(PlmfitError::EmbeddingNotFound(_))));
        Ok(())
    }
}
