use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnitIdError {
    #[error("Unit id '{0}' has no '_cycle<N>' suffix")]
    MissingCycle(String),
    #[error("Unit id '{id}' has an invalid cycle number: {reason}")]
    InvalidCycle { id: String, reason: String },
    #[error("Unit id '{0}' has an empty instance id")]
    EmptyInstance(String),
}

/// Failures reading the dataset or the generation record.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Failures of the on-disk result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to prepare result directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to encode result for {path}: {source}")]
    Encode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Directory { .. } => "STORE_DIRECTORY_ERROR",
            StoreError::Read { .. } => "STORE_READ_ERROR",
            StoreError::Write { .. } => "STORE_WRITE_ERROR",
            StoreError::Encode { .. } => "STORE_ENCODE_ERROR",
        }
    }
}
