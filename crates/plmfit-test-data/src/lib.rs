//! plmfit-test-data
//!
//! Small fixture files embedded in the crate for use in tests.
//!
//! The files are represented as `TestFile` objects which package the raw bytes
//! and write them to temporary files for programs to operate on.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};

#[derive(Debug)]
/// Test File
///
/// Example usage:
///
/// ```ignore
/// // returns (filepath, _tempfile_handle).
/// // _handle ensures the tempfile remains in scope
/// use plmfit_test_data::TestFile;
/// let (csv, _temp) = TestFile::toy_dataset().create_temp()?;
/// ```
pub struct TestFile {
    filebinary: &'static [u8],
    suffix: &'static str,
}

impl TestFile {
    /// 24 variants of `MKTAYIAKQR` with `set`, `score`, `binary_score` and `mut_mask` columns.
    pub fn toy_dataset() -> Self {
        Self {
            filebinary: include_bytes!("../data/datasets/toy_data_full.csv"),
            suffix: "csv",
        }
    }
    /// The first five toy variants, sequence lines wrapped at six residues.
    pub fn toy_fasta() -> Self {
        Self {
            filebinary: include_bytes!("../data/datasets/toy.fasta"),
            suffix: "fasta",
        }
    }
    pub fn toy_wild_type() -> Self {
        Self {
            filebinary: include_bytes!("../data/datasets/wild_type.json"),
            suffix: "json",
        }
    }
    /// Linear regression head over 16 features.
    pub fn linear_head_config() -> Self {
        Self {
            filebinary: include_bytes!("../data/configs/linear_head.json"),
            suffix: "json",
        }
    }
    /// MLP classification head over 16 features.
    pub fn mlp_head_config() -> Self {
        Self {
            filebinary: include_bytes!("../data/configs/mlp_head.json"),
            suffix: "json",
        }
    }

    pub fn bytes(&self) -> &'static [u8] {
        self.filebinary
    }

    pub fn create_temp(&self) -> io::Result<(String, NamedTempFile)> {
        let temp = Builder::new()
            .suffix(&format!(".{}", self.suffix))
            .tempfile()?;

        fs::write(&temp, self.filebinary)?;
        let path = temp.path().to_string_lossy().into_owned();

        Ok((path, temp))
    }

    /// Write the file to `path`, creating parent directories.
    pub fn write_to(&self, path: impl AsRef<Path>) -> io::Result<PathBuf> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, self.filebinary)?;
        Ok(path.to_path_buf())
    }
}
