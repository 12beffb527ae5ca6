//! Preparing a unit's code directory before it is scanned.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const MASK_LINE: &str = "<MASKED>";
const BACKUP_SUFFIX: &str = "_backup";

/// Remove lines that consist only of the mask placeholder.
///
/// The file is rewritten only when something was removed. Returns the number
/// of removed lines.
pub fn strip_masked_lines(path: &Path) -> Result<usize> {
    let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let mut kept = Vec::with_capacity(raw.len());
    let mut removed = 0usize;
    for line in raw.split_inclusive(|b| *b == b'\n') {
        let masked = std::str::from_utf8(line)
            .map(|text| text.trim() == MASK_LINE)
            .unwrap_or(false);
        if masked {
            removed += 1;
        } else {
            kept.extend_from_slice(line);
        }
    }

    if removed > 0 {
        fs::write(path, &kept).with_context(|| format!("rewriting {}", path.display()))?;
        debug!(file = %path.display(), removed, "masked lines removed");
    }
    Ok(removed)
}

/// Per-instance list of the files a scan actually needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CutRepos {
    files: BTreeMap<String, Vec<String>>,
}

impl CutRepos {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading cut-repos map {}", path.display()))?;
        let map: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing cut-repos map {}", path.display()))?;
        info!(path = %path.display(), instances = map.files.len(), "cut-repos map loaded");
        Ok(map)
    }

    pub fn from_map(files: BTreeMap<String, Vec<String>>) -> Self {
        Self { files }
    }

    pub fn files_for(&self, instance_id: &str) -> Option<&[String]> {
        self.files.get(instance_id).map(Vec::as_slice)
    }
}

/// The pristine copy kept next to a trimmed directory.
pub fn backup_dir(dir: &Path) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Reduce `dir` to the listed relative files.
///
/// The first call copies `dir` to `<dir>_backup`; every call rebuilds `dir`
/// from that backup, so trimming can be repeated.
pub fn trim_repository(dir: &Path, files: &[String]) -> Result<()> {
    let backup = backup_dir(dir);
    if !backup.exists() {
        copy_tree(dir, &backup)
            .with_context(|| format!("backing up {} to {}", dir.display(), backup.display()))?;
    }

    if dir.exists() {
        fs::remove_dir_all(dir).with_context(|| format!("removing {}", dir.display()))?;
    }
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    for file in files {
        let source = backup.join(file);
        let target = dir.join(file);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::copy(&source, &target)
            .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;
    }
    debug!(dir = %dir.display(), files = files.len(), "repository trimmed");
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(true) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(from)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
