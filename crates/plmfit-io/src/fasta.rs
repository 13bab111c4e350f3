use memchr::memchr_iter;
use plmfit_core::{PlmfitError, ProteinSequence, Result, SequenceDataset};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastaRecord {
    pub id: String,
    pub sequence: String,
}

/// Parse FASTA text. Sequence lines are concatenated; record order is kept.
pub fn parse_fasta(text: &[u8]) -> Result<Vec<FastaRecord>> {
    let mut records: Vec<FastaRecord> = Vec::new();
    let mut start = 0;
    let ends = memchr_iter(b'\n', text).chain(std::iter::once(text.len()));
    for end in ends {
        let line = std::str::from_utf8(&text[start..end])
            .map_err(|e| PlmfitError::dataset(format!("invalid FASTA text: {e}")))?
            .trim();
        start = end + 1;
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let id = header.split_whitespace().next().unwrap_or("").to_string();
            records.push(FastaRecord {
                id,
                sequence: String::new(),
            });
        } else {
            let current = records.last_mut().ok_or_else(|| {
                PlmfitError::dataset("FASTA sequence data before the first header")
            })?;
            current.sequence.push_str(line);
        }
    }
    Ok(records)
}

pub fn read_fasta(path: impl AsRef<Path>) -> Result<Vec<FastaRecord>> {
    parse_fasta(&std::fs::read(path)?)
}

/// Unlabelled dataset in FASTA order, usable for embedding extraction.
pub fn fasta_dataset(name: &str, records: Vec<FastaRecord>) -> Result<SequenceDataset> {
    if let Some(empty) = records.iter().find(|r| r.sequence.is_empty()) {
        return Err(PlmfitError::dataset(format!(
            "FASTA record `{}` has no sequence",
            empty.id
        )));
    }
    Ok(SequenceDataset::new(
        name,
        records
            .into_iter()
            .map(|r| ProteinSequence::new(r.sequence))
            .collect(),
    ))
}
