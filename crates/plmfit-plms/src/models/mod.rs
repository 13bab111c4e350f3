//! Backbone families.
//!
//! Each family supplies a tokenizer convention and a candle implementation of
//! its architecture behind the [`Backbone`] trait. Every backbone returns
//! `num_layers + 1` hidden states: the input embedding, then one entry per
//! block, with the family's final norm applied to the last entry.
pub mod ankh;
pub mod esm2;
pub mod progen2;

use crate::nn::Injection;
use crate::tokenizer::{ProteinTokenizer, SpecialTokens};
use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;
use plmfit_core::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

pub use ankh::{AnkhConfig, AnkhEncoder};
pub use esm2::{Esm2, Esm2Config};
pub use progen2::{ProGen2, ProGenConfig};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    /// Masked encoder.
    Esm2,
    /// Causal decoder.
    ProGen2,
    /// Encoder of an encoder-decoder; only the encoder produces embeddings.
    Ankh,
}

impl ModelFamily {
    pub fn special_tokens(&self) -> SpecialTokens {
        match self {
            ModelFamily::Esm2 => SpecialTokens {
                pad: "<pad>",
                bos: Some("<cls>"),
                eos: Some("<eos>"),
                unk: "<unk>",
            },
            ModelFamily::ProGen2 => SpecialTokens {
                pad: "<|pad|>",
                bos: Some("<|bos|>"),
                eos: Some("<|eos|>"),
                unk: "X",
            },
            ModelFamily::Ankh => SpecialTokens {
                pad: "<pad>",
                bos: None,
                eos: Some("</s>"),
                unk: "<unk>",
            },
        }
    }

    pub fn adds_bos(&self) -> bool {
        self.special_tokens().bos.is_some()
    }

    pub fn adds_eos(&self) -> bool {
        self.special_tokens().eos.is_some()
    }

    /// Token index of residue 0.
    pub fn residue_offset(&self) -> usize {
        self.adds_bos() as usize
    }

    pub fn tokenizer_bytes(&self) -> &'static [u8] {
        match self {
            ModelFamily::Esm2 => include_bytes!("../tokenizers/esm2.json"),
            ModelFamily::ProGen2 => include_bytes!("../tokenizers/progen2.json"),
            ModelFamily::Ankh => include_bytes!("../tokenizers/ankh.json"),
        }
    }

    /// The family's built-in vocabulary.
    pub fn tokenizer(&self) -> Result<ProteinTokenizer> {
        ProteinTokenizer::from_bytes(self.tokenizer_bytes(), &self.special_tokens())
    }
}

pub trait Backbone {
    fn family(&self) -> ModelFamily;
    fn hidden_size(&self) -> usize;
    fn num_layers(&self) -> usize;
    fn vocab_size(&self) -> usize;
    /// `tokens` is `[batch, seq]` u32. Returns `num_layers + 1` tensors of
    /// shape `[batch, seq, hidden]`.
    fn forward_t(&self, tokens: &Tensor, train: bool) -> candle_core::Result<Vec<Tensor>>;
}

/// Architecture hyper-parameters of one backbone, tagged by family.
#[derive(Debug, Clone, PartialEq)]
pub enum BackboneConfig {
    Esm2(Esm2Config),
    ProGen2(ProGenConfig),
    Ankh(AnkhConfig),
}

impl BackboneConfig {
    pub fn family(&self) -> ModelFamily {
        match self {
            BackboneConfig::Esm2(_) => ModelFamily::Esm2,
            BackboneConfig::ProGen2(_) => ModelFamily::ProGen2,
            BackboneConfig::Ankh(_) => ModelFamily::Ankh,
        }
    }

    /// Parse a checkpoint's `config.json`.
    pub fn from_json(family: ModelFamily, json: &str) -> Result<Self> {
        Ok(match family {
            ModelFamily::Esm2 => BackboneConfig::Esm2(serde_json::from_str(json)?),
            ModelFamily::ProGen2 => BackboneConfig::ProGen2(serde_json::from_str(json)?),
            ModelFamily::Ankh => BackboneConfig::Ankh(serde_json::from_str(json)?),
        })
    }

    pub fn hidden_size(&self) -> usize {
        match self {
            BackboneConfig::Esm2(c) => c.hidden_size,
            BackboneConfig::ProGen2(c) => c.n_embd,
            BackboneConfig::Ankh(c) => c.d_model,
        }
    }

    pub fn build(&self, vb: VarBuilder, injection: &Injection) -> candle_core::Result<Box<dyn Backbone>> {
        Ok(match self {
            BackboneConfig::Esm2(c) => Box::new(Esm2::load(vb, c, injection)?),
            BackboneConfig::ProGen2(c) => Box::new(ProGen2::load(vb, c, injection)?),
            BackboneConfig::Ankh(c) => Box::new(AnkhEncoder::load(vb, c, injection)?),
        })
    }
}

const MASKED: f32 = -1e9;

/// `[batch, 1, 1, seq]` additive bias hiding pad keys.
pub(crate) fn padding_bias(tokens: &Tensor, pad_id: u32, dtype: DType) -> candle_core::Result<Tensor> {
    let (b, t) = tokens.dims2()?;
    let is_pad = tokens.eq(pad_id)?.to_dtype(dtype)?;
    (is_pad * MASKED as f64)?.reshape((b, 1, 1, t))
}

/// `[1, 1, seq, seq]` additive bias hiding future keys.
pub(crate) fn causal_bias(seq: usize, dtype: DType, device: &candle_core::Device) -> candle_core::Result<Tensor> {
    let mask: Vec<f32> = (0..seq)
        .flat_map(|i| (0..seq).map(move |j| if j > i { MASKED } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (1, 1, seq, seq), device)?.to_dtype(dtype)
}

/// Split `[batch, seq, heads * head_dim]` into `[batch, heads, seq, head_dim]`.
pub(crate) fn split_heads(xs: &Tensor, heads: usize) -> candle_core::Result<Tensor> {
    let (b, t, hidden) = xs.dims3()?;
    xs.reshape((b, t, heads, hidden / heads))?
        .transpose(1, 2)?
        .contiguous()
}

/// Inverse of [`split_heads`].
pub(crate) fn merge_heads(xs: &Tensor) -> candle_core::Result<Tensor> {
    let (b, h, t, d) = xs.dims4()?;
    xs.transpose(1, 2)?.contiguous()?.reshape((b, t, h * d))
}

/// `softmax(q k^T + bias) v` over `[batch, heads, seq, head_dim]` inputs.
pub(crate) fn attend(q: &Tensor, k: &Tensor, v: &Tensor, bias: &Tensor) -> candle_core::Result<Tensor> {
    let scores = q.matmul(&k.t()?.contiguous()?)?.broadcast_add(bias)?;
    let probs = candle_nn::ops::softmax(&scores, candle_core::D::Minus1)?;
    probs.matmul(&v.contiguous()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_family_conventions() {
        assert!(ModelFamily::Esm2.adds_bos() && ModelFamily::Esm2.adds_eos());
        assert!(!ModelFamily::Ankh.adds_bos() && ModelFamily::Ankh.adds_eos());
        assert_eq!(ModelFamily::ProGen2.residue_offset(), 1);
        assert_eq!(ModelFamily::Ankh.residue_offset(), 0);
        assert_eq!("progen2".parse::<ModelFamily>().ok(), Some(ModelFamily::ProGen2));
    }

    #[test]
    fn test_masks() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let tokens = Tensor::new(&[[5u32, 6, 0]], &dev)?;
        let pad = padding_bias(&tokens, 0, DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(pad, vec![0.0, 0.0, MASKED]);
        let causal = causal_bias(2, DType::F32, &dev)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(causal, vec![0.0, MASKED, 0.0, 0.0]);
        Ok(())
    }
}
