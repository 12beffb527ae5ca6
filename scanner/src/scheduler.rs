//! Dispatching scan units to a bounded pool of blocking workers.

use crate::dataset::{Dataset, GenerationRecord};
use crate::prepare::{self, CutRepos};
use crate::store::ResultStore;
use crate::unit::{ScanUnit, UnitId};
use anyhow::{Context, Result};
use ase_sandbox::{run_checks, ContainerEngine, RuntimeHandle, ScanResult};
use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Shared interrupt flag. Cancelling stops dispatch; running units finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelState>,
}

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the token was already cancelled.
    pub fn cancel(&self) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.notify.notify_waiters();
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Units eligible for scanning and the subset still lacking a valid result.
#[derive(Debug, Clone, Default)]
pub struct ScanPlan {
    pub scannable: Vec<ScanUnit>,
    pub pending: Vec<ScanUnit>,
}

impl ScanPlan {
    pub fn scannable_ids(&self) -> BTreeSet<UnitId> {
        self.scannable.iter().map(|unit| unit.id.clone()).collect()
    }
}

/// Counts for one pass over the pending units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassSummary {
    pub pass: u32,
    pub scheduled: u64,
    /// Units whose patched file reached the container intact.
    pub succeeded: u64,
    pub failed: u64,
    /// Units never started because of an interrupt.
    pub cancelled: u64,
    /// Scheduled units that already had an invalid stored result.
    pub retried: u64,
    pub elapsed: Duration,
}

impl PassSummary {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

impl fmt::Display for PassSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass {}: {} succeeded, {} failed, {} cancelled, {} retried in {}",
            self.pass,
            self.succeeded,
            self.failed,
            self.cancelled,
            self.retried,
            humantime::format_duration(Duration::from_secs(self.elapsed.as_secs()))
        )
    }
}

#[derive(Debug, Default)]
struct PassCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl PassCounters {
    fn observe(&self, succeeded: bool) -> u64 {
        if succeeded {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.succeeded.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed)
    }
}

pub struct Scheduler {
    engine: Arc<dyn ContainerEngine>,
    dataset: Arc<Dataset>,
    store: Arc<ResultStore>,
    code_dir: PathBuf,
    max_workers: usize,
    remove_image: bool,
    cut_repos: Option<Arc<CutRepos>>,
    cancel: CancelToken,
}

impl Scheduler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        dataset: Arc<Dataset>,
        store: Arc<ResultStore>,
        code_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            dataset,
            store,
            code_dir: code_dir.into(),
            max_workers: 1,
            remove_image: false,
            cut_repos: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers.max(1);
        self
    }

    pub fn remove_image(mut self, remove: bool) -> Self {
        self.remove_image = remove;
        self
    }

    pub fn cut_repos(mut self, cut_repos: Option<CutRepos>) -> Self {
        self.cut_repos = cut_repos.map(Arc::new);
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Units with successful generation whose instance is in the dataset.
    ///
    /// `pending` drops units that already have a valid stored result.
    pub fn plan(&self, record: &GenerationRecord) -> Result<ScanPlan> {
        let mut scannable = Vec::new();
        for raw in record.succeeded() {
            let id = match UnitId::parse(raw) {
                Ok(id) => id,
                Err(err) => {
                    warn!(unit = raw, error = %err, "skipping unit with malformed id");
                    continue;
                }
            };
            let Some(case) = self.dataset.get(&id.instance_id) else {
                debug!(unit = %id, "instance not in dataset; skipping");
                continue;
            };
            scannable.push(ScanUnit::new(&self.code_dir, id, case.clone()));
        }

        let completed = self
            .store
            .completed_units()
            .context("listing stored scan results")?;
        let pending = scannable
            .iter()
            .filter(|unit| !completed.contains(&unit.id))
            .cloned()
            .collect();
        Ok(ScanPlan { scannable, pending })
    }

    /// Scan `units` with at most `max_workers` running at once.
    pub async fn run_pass(&self, pass: u32, units: Vec<ScanUnit>) -> PassSummary {
        let started = Instant::now();
        let scheduled = units.len();
        let retried = units
            .iter()
            .filter(|unit| matches!(self.store.load(&unit.id), Ok(Some(_))))
            .count() as u64;
        let workers = self.max_workers.min(scheduled).max(1);
        info!(pass, units = scheduled, workers, retried, "starting scan pass");

        let counters = Arc::new(PassCounters::default());
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut cancelled = 0u64;

        for (index, unit) in units.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                cancelled = (scheduled - index) as u64;
                warn!(pass, cancelled, "interrupted; not starting remaining units");
                break;
            };

            let engine = self.engine.clone();
            let store = self.store.clone();
            let counters = counters.clone();
            let remove_image = self.remove_image;
            let cut_files = self
                .cut_repos
                .as_ref()
                .and_then(|cut| cut.files_for(&unit.id.instance_id))
                .map(<[String]>::to_vec);

            tasks.spawn_blocking(move || {
                let _permit = permit;
                let succeeded = match run_unit(engine, &store, &unit, cut_files.as_deref(), remove_image) {
                    Ok(result) => result.patch_file,
                    Err(err) => {
                        error!(unit = %unit.id, error = %format!("{:#}", err), "security scan failed");
                        false
                    }
                };
                let done = counters.observe(succeeded);
                info!(unit = %unit.id, done, total = scheduled, "scan progress");
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(pass, error = %err, "scan worker panicked");
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let summary = PassSummary {
            pass,
            scheduled: scheduled as u64,
            succeeded: counters.succeeded.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            cancelled,
            retried,
            elapsed: started.elapsed(),
        };
        info!(
            pass,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            retried = summary.retried,
            "{}",
            summary
        );
        summary
    }
}

fn run_unit(
    engine: Arc<dyn ContainerEngine>,
    store: &ResultStore,
    unit: &ScanUnit,
    cut_files: Option<&[String]>,
    remove_image: bool,
) -> Result<ScanResult> {
    if let Some(files) = cut_files {
        prepare::trim_repository(&unit.dir, files)
            .with_context(|| format!("trimming repository of {}", unit.id))?;
    }
    scan_unit(engine, store, unit, remove_image)
}

/// Scan one unit in its own container and record the outcome.
///
/// A missing patched file is an error and leaves no result behind. Every
/// container or check failure is recorded as a result instead.
pub fn scan_unit(
    engine: Arc<dyn ContainerEngine>,
    store: &ResultStore,
    unit: &ScanUnit,
    remove_image: bool,
) -> Result<ScanResult> {
    let trace = unit.id.to_string();
    info!(unit = %trace, image = %unit.case.image, "starting security scan");

    let patched = unit.patched_file();
    prepare::strip_masked_lines(&patched)
        .with_context(|| format!("preparing patched file of {}", trace))?;

    let dump_dir = unit.dump_dir();
    let result = match fs::create_dir_all(&dump_dir) {
        Ok(()) => match RuntimeHandle::scoped(
            engine,
            trace.clone(),
            &unit.case.launch_spec(),
            remove_image,
            |handle| run_checks(handle, &unit.case, &patched, &dump_dir),
        ) {
            Ok(result) => result,
            Err(err) => {
                error!(unit = %trace, code = err.code(), error = %err, "failed to start container");
                ScanResult::default()
            }
        },
        Err(err) => {
            error!(unit = %trace, dir = %dump_dir.display(), error = %err, "failed to create output directory");
            ScanResult::default()
        }
    };

    info!(
        unit = %trace,
        patch_file = result.patch_file,
        image_status_check = result.image_status_check,
        test_case_check = result.test_case_check,
        poc_check = result.poc_check,
        "security scan finished"
    );
    store
        .record(&unit.id, &result)
        .with_context(|| format!("recording result of {}", trace))?;
    Ok(result)
}
