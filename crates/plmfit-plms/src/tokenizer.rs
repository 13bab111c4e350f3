//! A protein tokenizer wrapping a word-level `tokenizers::Tokenizer`.
//!
//! Residues are tokenized one character at a time. Special tokens are never
//! produced by the tokenizer itself; their ids are looked up once at
//! construction and inserted by the sequence encoder.
use plmfit_core::{PlmfitError, Result};
use std::collections::HashSet;
use std::path::Path;
use tokenizers::Tokenizer;

/// Names of the special tokens a family's vocabulary must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    pub pad: &'static str,
    pub bos: Option<&'static str>,
    pub eos: Option<&'static str>,
    pub unk: &'static str,
}

pub struct ProteinTokenizer {
    tokenizer: Tokenizer,
    pad_token_id: u32,
    bos_token_id: Option<u32>,
    eos_token_id: Option<u32>,
    unk_token_id: u32,
    special_token_ids: HashSet<u32>,
}

impl ProteinTokenizer {
    pub fn new(tokenizer: Tokenizer, specials: &SpecialTokens) -> Result<Self> {
        let lookup = |role: &str, token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                PlmfitError::encoding(format!("vocabulary has no {role} token `{token}`"))
            })
        };
        let pad_token_id = lookup("pad", specials.pad)?;
        let unk_token_id = lookup("unk", specials.unk)?;
        let bos_token_id = specials.bos.map(|t| lookup("bos", t)).transpose()?;
        let eos_token_id = specials.eos.map(|t| lookup("eos", t)).transpose()?;

        let mut special_token_ids = HashSet::from([pad_token_id]);
        special_token_ids.extend(bos_token_id);
        special_token_ids.extend(eos_token_id);

        Ok(Self {
            tokenizer,
            pad_token_id,
            bos_token_id,
            eos_token_id,
            unk_token_id,
            special_token_ids,
        })
    }

    pub fn from_bytes(bytes: &[u8], specials: &SpecialTokens) -> Result<Self> {
        let tokenizer = Tokenizer::from_bytes(bytes)
            .map_err(|e| PlmfitError::encoding(format!("failed to load tokenizer: {e}")))?;
        Self::new(tokenizer, specials)
    }

    pub fn from_file<P: AsRef<Path>>(path: P, specials: &SpecialTokens) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| PlmfitError::encoding(format!("failed to load tokenizer: {e}")))?;
        Self::new(tokenizer, specials)
    }

    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn unk_token_id(&self) -> u32 {
        self.unk_token_id
    }

    /// Fails with an encoding error when the vocabulary has no bos token.
    pub fn bos_token_id(&self) -> Result<u32> {
        self.bos_token_id
            .ok_or_else(|| PlmfitError::encoding("vocabulary has no bos token"))
    }

    /// Fails with an encoding error when the vocabulary has no eos token.
    pub fn eos_token_id(&self) -> Result<u32> {
        self.eos_token_id
            .ok_or_else(|| PlmfitError::encoding("vocabulary has no eos token"))
    }

    pub fn token_to_id(&self, token: &str) -> u32 {
        self.tokenizer
            .token_to_id(token)
            .unwrap_or(self.unk_token_id)
    }

    pub fn id_to_token(&self, id: u32) -> Option<String> {
        self.tokenizer.id_to_token(id)
    }

    /// Residue ids of `sequence`, without special tokens.
    pub fn encode_residues(&self, sequence: &str) -> Result<Vec<u32>> {
        let text = sequence
            .chars()
            .map(String::from)
            .collect::<Vec<_>>()
            .join(" ");
        let encoding = self
            .tokenizer
            .encode(text.as_str(), false)
            .map_err(|e| PlmfitError::encoding(format!("failed to encode `{sequence}`: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let ids: Vec<u32> = token_ids
            .iter()
            .filter(|id| !skip_special_tokens || !self.special_token_ids.contains(*id))
            .copied()
            .collect();
        let text = self
            .tokenizer
            .decode(&ids, false)
            .map_err(|e| PlmfitError::encoding(format!("failed to decode: {e}")))?;
        Ok(text.replace(' ', ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelFamily;

    #[test]
    fn test_esm2_vocabulary() -> anyhow::Result<()> {
        let tok = ModelFamily::Esm2.tokenizer()?;
        assert_eq!(tok.len(), 33);
        assert_eq!(tok.pad_token_id(), 1);
        assert_eq!(tok.bos_token_id()?, 0);
        assert_eq!(tok.eos_token_id()?, 2);
        assert_eq!(tok.encode_residues("LAG")?, vec![4, 5, 6]);
        Ok(())
    }

    #[test]
    fn test_unknown_residue_maps_to_unk() -> anyhow::Result<()> {
        let tok = ModelFamily::Ankh.tokenizer()?;
        assert_eq!(tok.encode_residues("L*")?, vec![3, tok.unk_token_id()]);
        Ok(())
    }

    #[test]
    fn test_decode_roundtrip() -> anyhow::Result<()> {
        let tok = ModelFamily::ProGen2.tokenizer()?;
        let mut ids = vec![tok.bos_token_id()?];
        ids.extend(tok.encode_residues("METVAL")?);
        ids.push(tok.eos_token_id()?);
        assert_eq!(tok.decode(&ids, true)?, "METVAL");
        Ok(())
    }

    #[test]
    fn test_missing_special_token() {
        let specials = SpecialTokens {
            pad: "<pad>",
            bos: Some("<bos>"),
            eos: Some("</s>"),
            unk: "<unk>",
        };
        let bytes = include_bytes!("tokenizers/ankh.json");
        let err = ProteinTokenizer::from_bytes(bytes, &specials);
        assert!(matches!(err, Err(PlmfitError::Encoding(_))));
    }
}
