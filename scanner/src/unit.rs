use crate::error::UnitIdError;
use ase_sandbox::CaseDescriptor;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

const CYCLE_SEPARATOR: &str = "_cycle";
const DUMP_DIR: &str = "scan_outputs";

/// One generation cycle of one dataset instance.
///
/// Only rendered as `<instance_id>_cycle<N>` at the filesystem boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId {
    pub instance_id: String,
    pub cycle: u32,
}

impl UnitId {
    pub fn new(instance_id: impl Into<String>, cycle: u32) -> Self {
        Self {
            instance_id: instance_id.into(),
            cycle,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnitIdError> {
        let (instance_id, cycle) = raw
            .rsplit_once(CYCLE_SEPARATOR)
            .ok_or_else(|| UnitIdError::MissingCycle(raw.to_string()))?;
        if instance_id.is_empty() {
            return Err(UnitIdError::EmptyInstance(raw.to_string()));
        }
        let cycle = cycle.parse::<u32>().map_err(|err| UnitIdError::InvalidCycle {
            id: raw.to_string(),
            reason: err.to_string(),
        })?;
        let id = Self::new(instance_id, cycle);
        // Two spellings of one cycle would collide on disk and in the merge.
        if id.to_string() != raw {
            return Err(UnitIdError::InvalidCycle {
                id: raw.to_string(),
                reason: format!("not in canonical form, expected {}", id),
            });
        }
        Ok(id)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.instance_id, CYCLE_SEPARATOR, self.cycle)
    }
}

impl FromStr for UnitId {
    type Err = UnitIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A unit ready to scan: its id, its code directory and its dataset case.
#[derive(Debug, Clone)]
pub struct ScanUnit {
    pub id: UnitId,
    pub dir: PathBuf,
    pub case: Arc<CaseDescriptor>,
}

impl ScanUnit {
    pub fn new(code_dir: &Path, id: UnitId, case: Arc<CaseDescriptor>) -> Self {
        let dir = code_dir.join(id.to_string());
        Self { id, dir, case }
    }

    /// The generated file that replaces `vuln_file` in the container.
    pub fn patched_file(&self) -> PathBuf {
        self.dir.join(&self.case.vuln_file)
    }

    /// Where the raw check logs are kept.
    pub fn dump_dir(&self) -> PathBuf {
        self.dir.join(DUMP_DIR)
    }
}
