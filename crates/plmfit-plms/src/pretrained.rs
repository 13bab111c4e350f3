//! Named pretrained checkpoints on the Hugging Face hub.
//!
//! ```no_run
//! use plmfit_plms::PretrainedModels;
//! let device = plmfit_plms::device(true)?;
//! let adapter = PretrainedModels::Esm2T6_8M.load(&device)?;
//! # Ok::<(), plmfit_core::PlmfitError>(())
//! ```
use crate::adapter::PlmAdapter;
use crate::models::{AnkhConfig, BackboneConfig, Esm2Config, ModelFamily, ProGenConfig};
use candle_core::Device;
use hf_hub::api::sync::{Api, ApiError, ApiRepo};
use hf_hub::{Repo, RepoType};
use plmfit_core::{PlmfitError, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use strum::{Display, EnumIter, EnumString};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum PretrainedModels {
    #[strum(serialize = "esm2_t6_8M_UR50D")]
    Esm2T6_8M,
    #[strum(serialize = "esm2_t12_35M_UR50D")]
    Esm2T12_35M,
    #[strum(serialize = "esm2_t30_150M_UR50D")]
    Esm2T30_150M,
    #[strum(serialize = "esm2_t33_650M_UR50D")]
    Esm2T33_650M,
    #[strum(serialize = "esm2_t36_3B_UR50D")]
    Esm2T36_3B,
    #[strum(serialize = "esm2_t48_15B_UR50D")]
    Esm2T48_15B,
    #[strum(serialize = "progen2-small")]
    ProGen2Small,
    #[strum(serialize = "progen2-medium")]
    ProGen2Medium,
    #[strum(serialize = "progen2-base")]
    ProGen2Base,
    #[strum(serialize = "progen2-large")]
    ProGen2Large,
    #[strum(serialize = "progen2-xlarge")]
    ProGen2XLarge,
    #[strum(serialize = "ankh-base")]
    AnkhBase,
    #[strum(serialize = "ankh-large")]
    AnkhLarge,
}

fn hub_error(err: ApiError) -> PlmfitError {
    PlmfitError::Io(std::io::Error::other(err))
}

impl PretrainedModels {
    /// `(repository, revision)`
    pub fn get_model_files(&self) -> (&'static str, &'static str) {
        let repo = match self {
            PretrainedModels::Esm2T6_8M => "facebook/esm2_t6_8M_UR50D",
            PretrainedModels::Esm2T12_35M => "facebook/esm2_t12_35M_UR50D",
            PretrainedModels::Esm2T30_150M => "facebook/esm2_t30_150M_UR50D",
            PretrainedModels::Esm2T33_650M => "facebook/esm2_t33_650M_UR50D",
            PretrainedModels::Esm2T36_3B => "facebook/esm2_t36_3B_UR50D",
            PretrainedModels::Esm2T48_15B => "facebook/esm2_t48_15B_UR50D",
            PretrainedModels::ProGen2Small => "hugohrban/progen2-small",
            PretrainedModels::ProGen2Medium => "hugohrban/progen2-medium",
            PretrainedModels::ProGen2Base => "hugohrban/progen2-base",
            PretrainedModels::ProGen2Large => "hugohrban/progen2-large",
            PretrainedModels::ProGen2XLarge => "hugohrban/progen2-xlarge",
            PretrainedModels::AnkhBase => "ElnaggarLab/ankh-base",
            PretrainedModels::AnkhLarge => "ElnaggarLab/ankh-large",
        };
        (repo, "main")
    }

    pub fn family(&self) -> ModelFamily {
        match self {
            PretrainedModels::Esm2T6_8M
            | PretrainedModels::Esm2T12_35M
            | PretrainedModels::Esm2T30_150M
            | PretrainedModels::Esm2T33_650M
            | PretrainedModels::Esm2T36_3B
            | PretrainedModels::Esm2T48_15B => ModelFamily::Esm2,
            PretrainedModels::ProGen2Small
            | PretrainedModels::ProGen2Medium
            | PretrainedModels::ProGen2Base
            | PretrainedModels::ProGen2Large
            | PretrainedModels::ProGen2XLarge => ModelFamily::ProGen2,
            PretrainedModels::AnkhBase | PretrainedModels::AnkhLarge => ModelFamily::Ankh,
        }
    }

    /// Architecture of the published checkpoint, used when `config.json`
    /// cannot be read.
    pub fn preset(&self) -> BackboneConfig {
        match self {
            PretrainedModels::Esm2T6_8M => BackboneConfig::Esm2(Esm2Config::esm2_t6_8m()),
            PretrainedModels::Esm2T12_35M => BackboneConfig::Esm2(Esm2Config::esm2_t12_35m()),
            PretrainedModels::Esm2T30_150M => BackboneConfig::Esm2(Esm2Config::esm2_t30_150m()),
            PretrainedModels::Esm2T33_650M => BackboneConfig::Esm2(Esm2Config::esm2_t33_650m()),
            PretrainedModels::Esm2T36_3B => BackboneConfig::Esm2(Esm2Config::esm2_t36_3b()),
            PretrainedModels::Esm2T48_15B => BackboneConfig::Esm2(Esm2Config::esm2_t48_15b()),
            PretrainedModels::ProGen2Small => BackboneConfig::ProGen2(ProGenConfig::progen2_small()),
            PretrainedModels::ProGen2Medium => {
                BackboneConfig::ProGen2(ProGenConfig::progen2_medium())
            }
            PretrainedModels::ProGen2Base => BackboneConfig::ProGen2(ProGenConfig::progen2_base()),
            PretrainedModels::ProGen2Large => BackboneConfig::ProGen2(ProGenConfig::progen2_large()),
            PretrainedModels::ProGen2XLarge => {
                BackboneConfig::ProGen2(ProGenConfig::progen2_xlarge())
            }
            PretrainedModels::AnkhBase => BackboneConfig::Ankh(AnkhConfig::ankh_base()),
            PretrainedModels::AnkhLarge => BackboneConfig::Ankh(AnkhConfig::ankh_large()),
        }
    }

    /// Download (or reuse the hub cache) and build the adapter.
    pub fn load(&self, device: &Device) -> Result<PlmAdapter> {
        let (model_id, revision) = self.get_model_files();
        info!("loading {self} from {model_id}@{revision}");
        let repo = Repo::with_revision(model_id.to_string(), RepoType::Model, revision.to_string());
        let api = Api::new().map_err(hub_error)?.repo(repo);

        let config = match api.get("config.json") {
            Ok(path) => BackboneConfig::from_json(self.family(), &std::fs::read_to_string(path)?)?,
            Err(err) => {
                info!("no config.json ({err}), using the built-in preset");
                self.preset()
            }
        };
        let weights = safetensors_files(&api)?;
        PlmAdapter::from_safetensors(
            self.to_string(),
            config,
            self.family().tokenizer()?,
            &weights,
            device,
        )
    }
}

/// `model.safetensors`, or every shard named in `model.safetensors.index.json`.
fn safetensors_files(api: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(path) = api.get("model.safetensors") {
        return Ok(vec![path]);
    }
    let index = api
        .get("model.safetensors.index.json")
        .map_err(hub_error)?;
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index)?)?;
    let shards: BTreeSet<&str> = index
        .get("weight_map")
        .and_then(|m| m.as_object())
        .ok_or_else(|| PlmfitError::configuration("safetensors index has no weight_map"))?
        .values()
        .filter_map(|v| v.as_str())
        .collect();
    shards
        .into_iter()
        .map(|shard| api.get(shard).map_err(hub_error))
        .collect()
}
