pub mod extract;
pub mod fine_tune;
pub mod models;

use crate::cli::{DataArgs, ModelArgs};
use anyhow::{bail, Context, Result};
use candle_core::Device;
use plmfit_core::SequenceDataset;
use plmfit_io::{dataset_path, load_dataset, DatasetColumns, WildType};
use plmfit_plms::{ModelFamily, PlmAdapter};
use tracing::info;

impl ModelArgs {
    /// Registry name, or the directory name of a local checkpoint.
    pub fn name(&self) -> Option<String> {
        if let Some(model) = self.model {
            return Some(model.to_string());
        }
        self.model_dir
            .as_ref()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn family(&self) -> Option<ModelFamily> {
        self.model.map(|m| m.family()).or(self.family)
    }

    pub fn load(&self, device: &Device) -> Result<PlmAdapter> {
        let adapter = match (&self.model, &self.model_dir, self.family) {
            (Some(model), _, _) => model.load(device)?,
            (None, Some(dir), Some(family)) => {
                let name = self.name().context("checkpoint directory has no name")?;
                PlmAdapter::from_local_dir(name, family, dir, device)?
            }
            _ => bail!("pass --model, or --model-dir with --family"),
        };
        info!(
            "{} ({}): {} layers, {} hidden",
            adapter.name(),
            adapter.family(),
            adapter.num_layers(),
            adapter.embedding_dimension()
        );
        Ok(adapter)
    }
}

impl DataArgs {
    pub fn wild_type(&self) -> Result<Option<String>> {
        self.wild_type
            .as_ref()
            .map(|path| {
                WildType::from_file(path)
                    .map(|wt| wt.wild_type)
                    .with_context(|| format!("reading {}", path.display()))
            })
            .transpose()
    }

    pub fn load_dataset(&self, columns: &DatasetColumns) -> Result<SequenceDataset> {
        let path = dataset_path(&self.data_root, &self.data_type);
        let mut dataset =
            load_dataset(&path, columns).with_context(|| format!("loading {}", path.display()))?;
        if let Some(wt) = self.wild_type()? {
            dataset.fill_mutation_positions(&wt);
        }
        Ok(dataset)
    }
}
