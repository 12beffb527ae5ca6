//! Per-unit result files and the merged report.
//!
//! Each unit owns `<code_dir>/scan_results/<unit>_output.json`. Writes go through
//! a temporary file in the same directory and are renamed into place, so an
//! interrupted run never leaves a half-written result behind.

use crate::dataset::Dataset;
use crate::error::StoreError;
use crate::unit::UnitId;
use ase_sandbox::ScanResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

pub const RESULTS_DIR: &str = "scan_results";
pub const OUTPUT_SUFFIX: &str = "_output.json";
pub const MERGED_REPORT_FILE: &str = "scan_results.json";

/// One stored result in the merged report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedEntry {
    #[serde(flatten)]
    pub result: ScanResult,
    /// The full unit id, cycle suffix included.
    pub instance_id: String,
}

pub type MergedReport = Vec<MergedEntry>;

#[derive(Debug, Clone)]
pub struct ResultStore {
    code_dir: PathBuf,
    results_dir: PathBuf,
}

impl ResultStore {
    /// Open the store of a batch directory, creating the results directory.
    pub fn open(code_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let code_dir = code_dir.into();
        let results_dir = code_dir.join(RESULTS_DIR);
        fs::create_dir_all(&results_dir).map_err(|source| StoreError::Directory {
            path: results_dir.clone(),
            source,
        })?;
        Ok(Self {
            code_dir,
            results_dir,
        })
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn merged_report_path(&self) -> PathBuf {
        self.code_dir.join(MERGED_REPORT_FILE)
    }

    pub fn result_path(&self, unit: &UnitId) -> PathBuf {
        self.results_dir.join(format!("{}{}", unit, OUTPUT_SUFFIX))
    }

    /// Replace the stored result of `unit`.
    pub fn record(&self, unit: &UnitId, result: &ScanResult) -> Result<(), StoreError> {
        let path = self.result_path(unit);
        write_json_atomic(&self.results_dir, &path, result)?;
        debug!(unit = %unit, path = %path.display(), "result recorded");
        Ok(())
    }

    /// The stored result of `unit`, if it was ever attempted.
    ///
    /// A file that cannot be decoded counts as an invalid result.
    pub fn load(&self, unit: &UnitId) -> Result<Option<ScanResult>, StoreError> {
        let path = self.result_path(unit);
        if !path.exists() {
            return Ok(None);
        }
        read_result(&path).map(Some)
    }

    /// Every stored result, sorted by unit id.
    pub fn entries(&self) -> Result<Vec<(UnitId, ScanResult)>, StoreError> {
        let listing = fs::read_dir(&self.results_dir).map_err(|source| StoreError::Read {
            path: self.results_dir.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for item in listing {
            let item = item.map_err(|source| StoreError::Read {
                path: self.results_dir.clone(),
                source,
            })?;
            let name = item.file_name();
            let Some(raw) = name.to_str().and_then(|n| n.strip_suffix(OUTPUT_SUFFIX)) else {
                continue;
            };
            let unit = match UnitId::parse(raw) {
                Ok(unit) => unit,
                Err(err) => {
                    warn!(file = %item.path().display(), error = %err, "ignoring result file with unrecognised name");
                    continue;
                }
            };
            entries.push((unit, read_result(&item.path())?));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    /// Units whose stored result shows the patched file never arrived intact.
    pub fn invalid_units(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, result)| !result.is_valid())
            .map(|(unit, _)| unit)
            .collect())
    }

    /// Units with a valid stored result.
    pub fn completed_units(&self) -> Result<BTreeSet<UnitId>, StoreError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|(_, result)| result.is_valid())
            .map(|(unit, _)| unit)
            .collect())
    }

    /// Collect stored results of instances in `dataset` into `scan_results.json`.
    ///
    /// Unchanged inputs always produce byte-identical output.
    pub fn merge(&self, dataset: &Dataset) -> Result<MergedReport, StoreError> {
        let mut stale = 0usize;
        let report: MergedReport = self
            .entries()?
            .into_iter()
            .filter(|(unit, _)| {
                let active = dataset.contains(&unit.instance_id);
                if !active {
                    stale += 1;
                }
                active
            })
            .map(|(unit, result)| MergedEntry {
                result,
                instance_id: unit.to_string(),
            })
            .collect();

        let path = self.merged_report_path();
        write_json_atomic(&self.code_dir, &path, &report)?;
        info!(
            path = %path.display(),
            merged = report.len(),
            skipped = stale,
            "scan results merged"
        );
        Ok(report)
    }
}

fn read_result(path: &Path) -> Result<ScanResult, StoreError> {
    let raw = fs::read(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    match serde_json::from_slice(&raw) {
        Ok(result) => Ok(result),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "corrupt result file; treating it as invalid");
            Ok(ScanResult::default())
        }
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(
    dir: &Path,
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let write_error = |source: std::io::Error| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Encode {
        path: path.to_path_buf(),
        source,
    })?;
    body.push(b'\n');

    let mut tmp = NamedTempFile::new_in(dir).map_err(write_error)?;
    tmp.write_all(&body).map_err(write_error)?;
    tmp.as_file().sync_all().map_err(write_error)?;
    tmp.persist(path).map_err(|err| write_error(err.error))?;
    Ok(())
}
