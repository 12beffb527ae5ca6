//! Batch scanning with retries and a final merge.

use crate::dataset::{Dataset, GenerationRecord, GENERATION_RECORD_FILE};
use crate::prepare::CutRepos;
use crate::scheduler::{CancelToken, PassSummary, Scheduler};
use crate::store::{MergedReport, ResultStore};
use anyhow::{Context, Result};
use ase_sandbox::ContainerEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub max_workers: usize,
    pub remove_image: bool,
    /// Total passes, the first one included.
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub cut_repos: Option<PathBuf>,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            max_workers: 1,
            remove_image: false,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            cut_repos: None,
        }
    }
}

/// How a batch scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every scannable unit has a valid result.
    Completed { passes: u32 },
    /// An interrupt stopped the scan early.
    Cancelled { completed: u64 },
    /// Invalid results remained after the last allowed pass.
    RetryExhausted { invalid: usize },
}

impl ScanOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            ScanOutcome::Completed { .. } | ScanOutcome::Cancelled { .. } => 0,
            ScanOutcome::RetryExhausted { .. } => 1,
        }
    }
}

/// Result of [`security_scan`]: how scanning ended and what was merged.
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub passes: Vec<PassSummary>,
    pub merged: MergedReport,
}

/// Scan every pending unit of `code_dir`, retry invalid results and merge.
///
/// The merge runs whether or not scanning succeeded.
pub async fn security_scan(
    engine: Arc<dyn ContainerEngine>,
    code_dir: &Path,
    dataset_path: &Path,
    settings: &ScanSettings,
    cancel: CancelToken,
) -> Result<ScanReport> {
    info!(code_dir = %code_dir.display(), "starting security scan of batch");
    let dataset = Arc::new(
        Dataset::load(dataset_path)
            .with_context(|| format!("loading dataset {}", dataset_path.display()))?,
    );
    let store = Arc::new(
        ResultStore::open(code_dir)
            .with_context(|| format!("opening result store in {}", code_dir.display()))?,
    );

    let mut passes = Vec::new();
    let scanned = scan_with_retries(
        engine,
        dataset.clone(),
        store.clone(),
        code_dir,
        settings,
        cancel,
        &mut passes,
    )
    .await;
    if let Err(err) = &scanned {
        error!(code_dir = %code_dir.display(), error = %format!("{:#}", err), "security scan aborted");
    }

    let merged = store
        .merge(&dataset)
        .with_context(|| format!("merging scan results in {}", code_dir.display()))?;
    let outcome = scanned?;
    info!(code_dir = %code_dir.display(), ?outcome, merged = merged.len(), "security scan of batch finished");
    Ok(ScanReport {
        outcome,
        passes,
        merged,
    })
}

async fn scan_with_retries(
    engine: Arc<dyn ContainerEngine>,
    dataset: Arc<Dataset>,
    store: Arc<ResultStore>,
    code_dir: &Path,
    settings: &ScanSettings,
    cancel: CancelToken,
    passes: &mut Vec<PassSummary>,
) -> Result<ScanOutcome> {
    let record_path = code_dir.join(GENERATION_RECORD_FILE);
    let record = GenerationRecord::load(&record_path)
        .with_context(|| format!("loading generation record {}", record_path.display()))?;
    let cut_repos = settings
        .cut_repos
        .as_deref()
        .map(CutRepos::load)
        .transpose()?;

    let scheduler = Scheduler::new(engine, dataset, store, code_dir)
        .max_workers(settings.max_workers)
        .remove_image(settings.remove_image)
        .cut_repos(cut_repos)
        .cancel_token(cancel.clone());

    let attempts = settings.retry_attempts.max(1);
    let mut completed = 0u64;
    for attempt in 1..=attempts {
        let plan = scheduler.plan(&record)?;
        if plan.scannable.is_empty() {
            warn!(code_dir = %code_dir.display(), "no units to scan");
            return Ok(ScanOutcome::Completed { passes: attempt - 1 });
        }
        info!(
            scannable = plan.scannable.len(),
            pending = plan.pending.len(),
            "skipping units that already have a valid result"
        );

        let scannable = plan.scannable_ids();
        if plan.pending.is_empty() {
            info!("all units already scanned");
        } else {
            let summary = scheduler.run_pass(attempt, plan.pending).await;
            completed += summary.completed();
            passes.push(summary);
        }

        let stored = scheduler
            .store()
            .entries()?
            .into_iter()
            .filter(|(unit, _)| scannable.contains(unit))
            .count();
        if stored < scannable.len() {
            warn!(
                stored,
                required = scannable.len(),
                missing = scannable.len() - stored,
                "some units have no scan result"
            );
        } else {
            info!(stored, "every unit has a scan result");
        }

        if cancel.is_cancelled() {
            warn!(completed, "security scan interrupted");
            return Ok(ScanOutcome::Cancelled { completed });
        }

        let invalid = scheduler
            .store()
            .invalid_units()?
            .intersection(&scannable)
            .count();
        if invalid == 0 {
            return Ok(ScanOutcome::Completed { passes: attempt });
        }
        if attempt == attempts {
            error!(
                invalid,
                attempts,
                "invalid scan results remain after the last retry; rerun with --max-workers 1"
            );
            return Ok(ScanOutcome::RetryExhausted { invalid });
        }

        info!(invalid, backoff = %humantime::format_duration(settings.retry_backoff), "retrying invalid scan results");
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(completed, "security scan interrupted");
                return Ok(ScanOutcome::Cancelled { completed });
            }
            _ = tokio::time::sleep(settings.retry_backoff) => {}
        }
    }

    Ok(ScanOutcome::Completed { passes: attempts })
}

/// Rebuild `scan_results.json` from the stored results.
pub fn merge_results(code_dir: &Path, dataset_path: &Path) -> Result<MergedReport> {
    let dataset = Dataset::load(dataset_path)
        .with_context(|| format!("loading dataset {}", dataset_path.display()))?;
    let store = ResultStore::open(code_dir)
        .with_context(|| format!("opening result store in {}", code_dir.display()))?;
    Ok(store.merge(&dataset)?)
}
