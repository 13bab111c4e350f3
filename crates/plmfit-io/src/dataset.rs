//! Load row-per-sequence CSV datasets.
use plmfit_core::{PlmfitError, ProteinSequence, Result, SequenceDataset, Split};
use polars::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Column names of a dataset file.
#[derive(Debug, Clone)]
pub struct DatasetColumns {
    pub sequence: String,
    pub length: String,
    pub split: String,
    pub score: String,
    pub binary_score: String,
    pub mutations: String,
}

impl Default for DatasetColumns {
    fn default() -> Self {
        Self {
            sequence: "aa_seq".to_string(),
            length: "len".to_string(),
            split: "set".to_string(),
            score: "score".to_string(),
            binary_score: "binary_score".to_string(),
            mutations: "mut_mask".to_string(),
        }
    }
}

impl DatasetColumns {
    pub fn with_split_column(mut self, name: impl Into<String>) -> Self {
        self.split = name.into();
        self
    }
}

/// `{root}/{data_type}/{data_type}_data_full.csv`
pub fn dataset_path(root: impl AsRef<Path>, data_type: &str) -> PathBuf {
    root.as_ref()
        .join(data_type)
        .join(format!("{data_type}_data_full.csv"))
}

fn polars_err(e: PolarsError) -> PlmfitError {
    PlmfitError::dataset(e)
}

fn optional_column<'a>(df: &'a DataFrame, name: &str) -> Option<&'a Series> {
    df.column(name).ok().map(|c| c.as_materialized_series())
}

fn float_column(series: Option<&Series>, rows: usize) -> Result<Vec<Option<f64>>> {
    match series {
        Some(s) => {
            let cast = s.cast(&DataType::Float64).map_err(polars_err)?;
            Ok(cast.f64().map_err(polars_err)?.into_iter().collect())
        }
        None => Ok(vec![None; rows]),
    }
}

/// Parse `"3;17"` (or comma / whitespace separated) into residue indices.
fn parse_positions(raw: &str) -> Result<Vec<usize>> {
    raw.split(|c: char| c == ';' || c == ',' || c.is_whitespace())
        .filter(|tok| !tok.is_empty())
        .map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| PlmfitError::dataset(format!("bad mutation position `{tok}`")))
        })
        .collect()
}

/// Read a dataset file. The dataset name is taken from the file stem with a
/// trailing `_data_full` removed.
pub fn load_dataset(path: impl AsRef<Path>, columns: &DatasetColumns) -> Result<SequenceDataset> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().trim_end_matches("_data_full").to_string())
        .unwrap_or_default();

    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))
        .map_err(polars_err)?
        .finish()
        .map_err(polars_err)?;
    let rows = df.height();
    debug!("read {} rows with columns {:?}", rows, df.get_column_names());

    let seqs = df
        .column(&columns.sequence)
        .map_err(polars_err)?
        .as_materialized_series()
        .cast(&DataType::String)
        .map_err(polars_err)?;
    let seqs = seqs.str().map_err(polars_err)?;

    let lengths: Vec<Option<i64>> = match optional_column(&df, &columns.length) {
        Some(s) => s
            .cast(&DataType::Int64)
            .map_err(polars_err)?
            .i64()
            .map_err(polars_err)?
            .into_iter()
            .collect(),
        None => vec![None; rows],
    };

    let splits: Vec<Option<Split>> = match optional_column(&df, &columns.split) {
        Some(s) => s
            .cast(&DataType::String)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?
            .into_iter()
            .map(|v| {
                v.map(|label| {
                    label.trim().parse::<Split>().map_err(|_| {
                        PlmfitError::dataset(format!(
                            "unknown value `{label}` in split column `{}`",
                            columns.split
                        ))
                    })
                })
                .transpose()
            })
            .collect::<Result<_>>()?,
        None => vec![None; rows],
    };

    let scores = float_column(optional_column(&df, &columns.score), rows)?;
    let binary = float_column(optional_column(&df, &columns.binary_score), rows)?;

    let mutations: Vec<Option<Vec<usize>>> = match optional_column(&df, &columns.mutations) {
        Some(s) => s
            .cast(&DataType::String)
            .map_err(polars_err)?
            .str()
            .map_err(polars_err)?
            .into_iter()
            // an empty cell means no mutations (the wild type)
            .map(|v| parse_positions(v.unwrap_or("")).map(Some))
            .collect::<Result<_>>()?,
        None => vec![None; rows],
    };

    let mut records = Vec::with_capacity(rows);
    for (idx, seq) in seqs.into_iter().enumerate() {
        let seq = seq.ok_or_else(|| PlmfitError::dataset(format!("row {idx} has no sequence")))?;
        let mut record = ProteinSequence::new(seq);
        if let Some(len) = lengths[idx] {
            record.len = usize::try_from(len).map_err(|_| {
                PlmfitError::dataset(format!(
                    "row {idx} has negative `{}` value {len}",
                    columns.length
                ))
            })?;
        }
        record.split = splits[idx];
        record.score = scores[idx];
        record.binary_score = binary[idx];
        record.mutation_positions = mutations[idx].clone();
        records.push(record);
    }

    info!("loaded dataset `{}` with {} sequences", name, records.len());
    Ok(SequenceDataset::new(name, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_path_convention() {
        let p = dataset_path("data", "gb1");
        assert_eq!(p, PathBuf::from("data/gb1/gb1_data_full.csv"));
    }

    #[test]
    fn test_parse_positions() -> anyhow::Result<()> {
        assert_eq!(parse_positions("3;17")?, vec![3, 17]);
        assert_eq!(parse_positions("4, 5")?, vec![4, 5]);
        assert!(parse_positions("")?.is_empty());
        assert!(parse_positions("x").is_err());
        Ok(())
    }
}
