//! Sequence encoder: raw residue strings to fixed-width token matrices.
//!
//! Every row has exactly `max_len + add_bos + add_eos` columns. A row is filled
//! with the pad id, then overwritten left to right with
//! `[bos]? + residues[..max_len] + [eos]?`. Residues beyond `max_len` are
//! dropped before the specials are placed, so no row can exceed the limit.
use crate::tokenizer::ProteinTokenizer;
use candle_core::{DType, Device, Tensor};
use plmfit_core::Result;
use tracing::{debug, info, warn};

/// Row-major `u32` token ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMatrix {
    ids: Vec<u32>,
    rows: usize,
    cols: usize,
    pad_id: u32,
}

impl TokenMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn row(&self, idx: usize) -> &[u32] {
        &self.ids[idx * self.cols..(idx + 1) * self.cols]
    }

    /// Rows `[start, start + len)`.
    pub fn slice_rows(&self, start: usize, len: usize) -> TokenMatrix {
        let len = len.min(self.rows.saturating_sub(start));
        TokenMatrix {
            ids: self.ids[start * self.cols..(start + len) * self.cols].to_vec(),
            rows: len,
            cols: self.cols,
            pad_id: self.pad_id,
        }
    }

    /// Gather rows in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> TokenMatrix {
        let ids = indices
            .iter()
            .flat_map(|&i| self.row(i).iter().copied())
            .collect();
        TokenMatrix {
            ids,
            rows: indices.len(),
            cols: self.cols,
            pad_id: self.pad_id,
        }
    }

    /// `[rows, cols]` u32 tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.ids, (self.rows, self.cols), device)?)
    }
}

pub fn categorical_encode<S: AsRef<str>>(
    sequences: &[S],
    tokenizer: &ProteinTokenizer,
    max_len: usize,
    add_bos: bool,
    add_eos: bool,
) -> Result<TokenMatrix> {
    let bos = add_bos.then(|| tokenizer.bos_token_id()).transpose()?;
    let eos = add_eos.then(|| tokenizer.eos_token_id()).transpose()?;
    let pad_id = tokenizer.pad_token_id();

    let rows = sequences.len();
    let cols = max_len + add_bos as usize + add_eos as usize;
    info!(
        "encoding {} sequences into {} columns (~{:.2} MB)",
        rows,
        cols,
        (rows * cols * 4) as f64 / 1e6
    );

    let mut ids = vec![pad_id; rows * cols];
    let mut truncated = 0usize;
    for (i, seq) in sequences.iter().enumerate() {
        let residues = tokenizer.encode_residues(seq.as_ref())?;
        if residues.len() > max_len {
            truncated += 1;
        }
        let row = &mut ids[i * cols..(i + 1) * cols];
        let mut cursor = 0;
        if let Some(bos) = bos {
            row[cursor] = bos;
            cursor += 1;
        }
        let core = &residues[..residues.len().min(max_len)];
        row[cursor..cursor + core.len()].copy_from_slice(core);
        cursor += core.len();
        if let Some(eos) = eos {
            row[cursor] = eos;
        }
        if i == 0 {
            debug!("first sequence tokens: {:?}", row);
        }
    }
    if truncated > 0 {
        warn!("{truncated} sequences were truncated to {max_len} residues");
    }

    Ok(TokenMatrix {
        ids,
        rows,
        cols,
        pad_id,
    })
}

/// `[rows, cols * vocab_size]` one-hot features, a backbone-free baseline.
pub fn one_hot_encode(tokens: &TokenMatrix, vocab_size: usize, device: &Device) -> Result<Tensor> {
    let indices = tokens.to_tensor(device)?.to_dtype(DType::I64)?;
    let one_hot = candle_nn::encoding::one_hot(indices, vocab_size, 1f32, 0f32)?;
    Ok(one_hot.reshape((tokens.rows(), tokens.cols() * vocab_size))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelFamily;

    #[test]
    fn test_column_count_and_bos() -> anyhow::Result<()> {
        let tok = ModelFamily::Esm2.tokenizer()?;
        let seqs = ["LAG", "LAGVS", ""];
        for (add_bos, add_eos) in [(false, false), (true, false), (false, true), (true, true)] {
            let m = categorical_encode(&seqs, &tok, 5, add_bos, add_eos)?;
            assert_eq!(m.rows(), 3);
            assert_eq!(m.cols(), 5 + add_bos as usize + add_eos as usize);
            if add_bos {
                assert!((0..3).all(|r| m.row(r)[0] == tok.bos_token_id().unwrap()));
            }
        }
        Ok(())
    }

    #[test]
    fn test_row_layout_with_padding() -> anyhow::Result<()> {
        let tok = ModelFamily::Esm2.tokenizer()?;
        let m = categorical_encode(&["LA"], &tok, 4, true, true)?;
        // <cls> L A <eos> <pad> <pad>
        assert_eq!(m.row(0), &[0, 4, 5, 2, 1, 1]);
        Ok(())
    }

    #[test]
    fn test_truncation_never_exceeds_max_len() -> anyhow::Result<()> {
        let tok = ModelFamily::ProGen2.tokenizer()?;
        let max_len = 4;
        let long = "ACDEFGHIK"; // max_len + 5
        let m = categorical_encode(&[long], &tok, max_len, true, true)?;
        assert_eq!(m.cols(), max_len + 2);
        let core = &m.row(0)[1..1 + max_len];
        assert_eq!(core, tok.encode_residues("ACDE")?.as_slice());
        assert_eq!(m.row(0)[max_len + 1], tok.eos_token_id()?);
        Ok(())
    }

    #[test]
    fn test_missing_bos_is_an_encoding_error() -> anyhow::Result<()> {
        let tok = ModelFamily::Ankh.tokenizer()?;
        let err = categorical_encode(&["LAG"], &tok, 3, true, false);
        assert!(matches!(err, Err(plmfit_core::PlmfitError::Encoding(_))));
        Ok(())
    }

    #[test]
    fn test_deterministic() -> anyhow::Result<()> {
        let tok = ModelFamily::Esm2.tokenizer()?;
        let a = categorical_encode(&["MKTAY", "MK"], &tok, 6, true, true)?;
        let b = categorical_encode(&["MKTAY", "MK"], &tok, 6, true, true)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_row_selection_and_one_hot() -> anyhow::Result<()> {
        let tok = ModelFamily::Ankh.tokenizer()?;
        let m = categorical_encode(&["LA", "GV", "SE"], &tok, 2, false, true)?;
        assert_eq!(m.slice_rows(2, 5).rows(), 1);
        let picked = m.select_rows(&[2, 0]);
        assert_eq!(picked.row(1), m.row(0));

        let one_hot = one_hot_encode(&m, tok.len(), &Device::Cpu)?;
        assert_eq!(one_hot.dims(), &[3, 3 * tok.len()]);
        assert_eq!(one_hot.sum_all()?.to_scalar::<f32>()?, 9.0);
        Ok(())
    }
}
