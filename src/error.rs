use std::path::PathBuf;

use thiserror::Error;

/// Structured failure kinds the HTTP wrapper needs to pattern-match on.
///
/// Every other failure in this crate (bootstrap I/O, checksum mismatches,
/// manifest shape errors) is surfaced as a plain `anyhow::Error` with a
/// unique message prefix per failure mode, per the error-handling design.
#[derive(Debug, Error)]
pub enum CadisError {
    #[error("Dataset is not bootstrapped: dir={dataset_dir} missing={missing_files:?}")]
    DatasetNotBootstrapped {
        dataset_dir: PathBuf,
        missing_files: Vec<String>,
    },

    #[error("Runtime policy invalid: dir={dataset_dir} reason={reason}")]
    RuntimePolicyInvalid { dataset_dir: PathBuf, reason: String },
}

impl CadisError {
    pub fn not_bootstrapped(dataset_dir: impl Into<PathBuf>, missing_files: Vec<String>) -> Self {
        let mut missing_files = missing_files;
        missing_files.sort();
        Self::DatasetNotBootstrapped {
            dataset_dir: dataset_dir.into(),
            missing_files,
        }
    }

    pub fn policy_invalid(dataset_dir: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RuntimePolicyInvalid {
            dataset_dir: dataset_dir.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, anyhow::Error>;
