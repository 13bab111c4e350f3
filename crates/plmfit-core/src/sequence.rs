use crate::error::{PlmfitError, Result};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Which side of the train/test partition a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Test,
}

/// Downstream task. Selects the label column and the loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Regression,
    Classification,
}

impl TaskKind {
    /// Dataset column holding the label for this task.
    pub fn label_column(&self) -> &'static str {
        match self {
            TaskKind::Regression => "score",
            TaskKind::Classification => "binary_score",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinSequence {
    pub aa_seq: String,
    pub len: usize,
    pub split: Option<Split>,
    pub score: Option<f64>,
    pub binary_score: Option<f64>,
    /// 0-based residue indices; special tokens are not counted.
    pub mutation_positions: Option<Vec<usize>>,
}

impl ProteinSequence {
    pub fn new(aa_seq: impl Into<String>) -> Self {
        let aa_seq = aa_seq.into();
        let len = aa_seq.chars().count();
        Self {
            aa_seq,
            len,
            split: None,
            score: None,
            binary_score: None,
            mutation_positions: None,
        }
    }

    pub fn label(&self, task: TaskKind) -> Option<f64> {
        match task {
            TaskKind::Regression => self.score,
            TaskKind::Classification => self.binary_score,
        }
    }
}

/// Ordered collection of sequences sharing a dataset name.
///
/// Records keep their file order; every downstream matrix (tokens, embeddings,
/// predictions) is indexed by the same row order.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDataset {
    pub name: String,
    records: Vec<ProteinSequence>,
}

impl SequenceDataset {
    pub fn new(name: impl Into<String>, records: Vec<ProteinSequence>) -> Self {
        Self {
            name: name.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProteinSequence] {
        &self.records
    }

    pub fn sequences(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.aa_seq.as_str()).collect()
    }

    /// Longest residue count in the dataset.
    pub fn max_len(&self) -> usize {
        self.records.iter().map(|r| r.len).max().unwrap_or(0)
    }

    /// Row indices of the train and test partitions, in dataset order.
    pub fn split_indices(&self) -> Result<(Vec<usize>, Vec<usize>)> {
        let mut train = Vec::new();
        let mut test = Vec::new();
        for (idx, record) in self.records.iter().enumerate() {
            match record.split {
                Some(Split::Train) => train.push(idx),
                Some(Split::Test) => test.push(idx),
                None => {
                    return Err(PlmfitError::dataset(format!(
                        "row {idx} of `{}` has no split label",
                        self.name
                    )))
                }
            }
        }
        Ok((train, test))
    }

    pub fn labels(&self, task: TaskKind) -> Result<Vec<f32>> {
        self.records
            .iter()
            .enumerate()
            .map(|(idx, r)| {
                r.label(task).map(|v| v as f32).ok_or_else(|| {
                    PlmfitError::dataset(format!(
                        "row {idx} of `{}` has no `{}` value",
                        self.name,
                        task.label_column()
                    ))
                })
            })
            .collect()
    }

    /// Mutation positions for every record, or `None` when any record lacks them.
    pub fn mutation_positions(&self) -> Option<Vec<Vec<usize>>> {
        self.records
            .iter()
            .map(|r| r.mutation_positions.clone())
            .collect()
    }

    /// Derive mutation positions for records that have none by comparing
    /// against the wild type. Records whose length differs from the wild type
    /// are left untouched.
    pub fn fill_mutation_positions(&mut self, wild_type: &str) -> usize {
        let wt: Vec<char> = wild_type.chars().collect();
        let mut filled = 0;
        for record in self.records.iter_mut() {
            if record.mutation_positions.is_some() || record.len != wt.len() {
                continue;
            }
            let positions = record
                .aa_seq
                .chars()
                .zip(wt.iter())
                .enumerate()
                .filter(|(_, (a, b))| a != *b)
                .map(|(idx, _)| idx)
                .collect();
            record.mutation_positions = Some(positions);
            filled += 1;
        }
        filled
    }

    /// Scores rescaled to [0, 1]. A constant column maps to zeros.
    pub fn normalized_scores(&self) -> Option<Vec<f64>> {
        let scores: Vec<f64> = self.records.iter().map(|r| r.score).collect::<Option<_>>()?;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let range = max - min;
        Some(
            scores
                .iter()
                .map(|s| if range > 0.0 { (s - min) / range } else { 0.0 })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seq: &str, split: Split, score: f64) -> ProteinSequence {
        ProteinSequence {
            split: Some(split),
            score: Some(score),
            binary_score: Some(if score > 0.5 { 1.0 } else { 0.0 }),
            ..ProteinSequence::new(seq)
        }
    }

    #[test]
    fn test_split_indices_preserve_order() -> anyhow::Result<()> {
        let ds = SequenceDataset::new(
            "toy",
            vec![
                record("MKT", Split::Train, 0.1),
                record("MKA", Split::Test, 0.9),
                record("MAT", Split::Train, 0.4),
            ],
        );
        let (train, test) = ds.split_indices()?;
        assert_eq!(train, vec![0, 2]);
        assert_eq!(test, vec![1]);
        assert_eq!(ds.labels(TaskKind::Classification)?, vec![0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_missing_split_is_an_error() {
        let ds = SequenceDataset::new("toy", vec![ProteinSequence::new("MKT")]);
        assert!(matches!(ds.split_indices(), Err(PlmfitError::Dataset(_))));
    }

    #[test]
    fn test_fill_mutation_positions() {
        let mut ds = SequenceDataset::new(
            "toy",
            vec![
                ProteinSequence::new("MKTAY"),
                ProteinSequence::new("AKTAW"),
                ProteinSequence::new("MKT"),
            ],
        );
        assert_eq!(ds.fill_mutation_positions("MKTAY"), 2);
        assert_eq!(ds.records()[0].mutation_positions, Some(vec![]));
        assert_eq!(ds.records()[1].mutation_positions, Some(vec![0, 4]));
        assert_eq!(ds.records()[2].mutation_positions, None);
        assert!(ds.mutation_positions().is_none());
    }

    #[test]
    fn test_normalized_scores() {
        let ds = SequenceDataset::new(
            "toy",
            vec![
                record("A", Split::Train, 2.0),
                record("C", Split::Train, 4.0),
                record("D", Split::Test, 3.0),
            ],
        );
        assert_eq!(ds.normalized_scores(), Some(vec![0.0, 1.0, 0.5]));
    }
}
