//! Dataset cases and the generation record of a batch.

use crate::error::DatasetError;
use ase_sandbox::CaseDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the generation record inside a batch directory.
pub const GENERATION_RECORD_FILE: &str = "processed_instances.json";

/// The active dataset, keyed by instance id.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    cases: BTreeMap<String, Arc<CaseDescriptor>>,
}

impl Dataset {
    /// Load a JSON array of cases.
    ///
    /// Missing structural fields fail the whole load. Problems with check
    /// commands only fail those checks later and are reported here as warnings.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let cases: Vec<CaseDescriptor> = read_json(path)?;
        let dataset = Self::from_cases(cases);
        info!(path = %path.display(), cases = dataset.len(), "dataset loaded");
        Ok(dataset)
    }

    pub fn from_cases(cases: impl IntoIterator<Item = CaseDescriptor>) -> Self {
        let mut map = BTreeMap::new();
        for case in cases {
            for problem in case.problems() {
                warn!(instance = %case.instance_id, error = %problem, "dataset case has an invalid check");
            }
            let id = case.instance_id.clone();
            if map.insert(id.clone(), Arc::new(case)).is_some() {
                warn!(instance = %id, "duplicate dataset case; keeping the last one");
            }
        }
        Self { cases: map }
    }

    pub fn get(&self, instance_id: &str) -> Option<&Arc<CaseDescriptor>> {
        self.cases.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.cases.contains_key(instance_id)
    }

    pub fn cases(&self) -> impl Iterator<Item = &Arc<CaseDescriptor>> {
        self.cases.values()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

/// Outcome of code generation for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationEntry {
    pub success: bool,
    /// Seconds spent generating.
    #[serde(default, alias = "time_cost")]
    pub time: f64,
}

/// `processed_instances.json`: unit id to generation outcome.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationRecord {
    entries: BTreeMap<String, GenerationEntry>,
}

impl GenerationRecord {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let record: Self = read_json(path)?;
        info!(
            path = %path.display(),
            units = record.entries.len(),
            succeeded = record.succeeded().count(),
            "generation record loaded"
        );
        Ok(record)
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, GenerationEntry)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Raw ids of units whose generation succeeded, in sorted order.
    pub fn succeeded(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.success)
            .map(|(id, _)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DatasetError> {
    let raw = fs::read_to_string(path).map_err(|source| DatasetError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| DatasetError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(id: &str) -> serde_json::Value {
        json!({
            "instance_id": id,
            "image": "ase/demo:1",
            "image_run_cmd": "sleep infinity",
            "image_inner_path": "/app",
            "vuln_file": "index.php",
            "image_status_check_cmd": "curl localhost",
            "test_case_cmd": "phpunit",
            "poc_cmd": "python3 /poc.py",
        })
    }

    #[test]
    fn loads_cases_by_instance_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        fs::write(&path, json!([case("a"), case("b")]).to_string()).unwrap();

        let dataset = Dataset::load(&path).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.contains("a"));
        assert_eq!(dataset.get("b").unwrap().vuln_file, "index.php");
    }

    #[test]
    fn missing_structural_field_fails_the_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");
        let mut broken = case("a");
        broken.as_object_mut().unwrap().remove("image");
        fs::write(&path, json!([broken]).to_string()).unwrap();

        assert!(matches!(
            Dataset::load(&path),
            Err(DatasetError::Parse { .. })
        ));
    }

    #[test]
    fn generation_record_accepts_both_time_spellings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(GENERATION_RECORD_FILE);
        fs::write(
            &path,
            json!({
                "a_cycle1": {"success": true, "time": 12.5},
                "a_cycle2": {"success": false, "time_cost": 3},
                "b_cycle1": {"success": true},
            })
            .to_string(),
        )
        .unwrap();

        let record = GenerationRecord::load(&path).unwrap();
        assert_eq!(record.len(), 3);
        assert_eq!(record.succeeded().collect::<Vec<_>>(), vec!["a_cycle1", "b_cycle1"]);
    }

    #[test]
    fn missing_record_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GenerationRecord::load(&dir.path().join(GENERATION_RECORD_FILE)),
            Err(DatasetError::Read { .. })
        ));
    }
}
