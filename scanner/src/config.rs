//! Command-line configuration for `ase-scan`.

use crate::driver::{ScanSettings, DEFAULT_RETRY_ATTEMPTS};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "ase-scan", version)]
#[command(about = "Runs A.S.E security scans of generated code in disposable containers")]
pub struct Cli {
    /// Output logs in JSON format
    #[arg(long, env = "ASE_LOG_JSON", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Scan every pending unit of a batch, retry invalid results and merge
    Scan(ScanArgs),
    /// Rebuild scan_results.json from the stored per-unit results
    Merge(MergeArgs),
    /// Check that each case's vulnerable file exists inside its image
    CheckPaths(CheckPathsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ScanArgs {
    /// Batch directory holding processed_instances.json and one directory per unit
    #[arg(long, env = "ASE_CODE_DIR")]
    pub code_dir: PathBuf,

    /// Dataset file (JSON array of cases)
    #[arg(long, env = "ASE_DATASET")]
    pub dataset: PathBuf,

    /// Maximum number of units scanned at once
    #[arg(long, env = "ASE_MAX_WORKERS", default_value_t = 1)]
    pub max_workers: usize,

    /// Remove each case image after its scan
    #[arg(long, env = "ASE_REMOVE_IMAGE")]
    pub remove_image: bool,

    /// Total scan passes, the first one included
    #[arg(long, env = "ASE_RETRY_ATTEMPTS", default_value_t = DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Pause between passes in milliseconds
    #[arg(long, env = "ASE_RETRY_BACKOFF_MS", default_value_t = 3000)]
    pub retry_backoff_ms: u64,

    /// JSON map of instance id to the files a scan needs
    #[arg(long, env = "ASE_CUT_REPOS")]
    pub cut_repos: Option<PathBuf>,
}

impl ScanArgs {
    pub fn settings(&self) -> ScanSettings {
        ScanSettings {
            max_workers: self.max_workers.max(1),
            remove_image: self.remove_image,
            retry_attempts: self.retry_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            cut_repos: self.cut_repos.clone(),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct MergeArgs {
    #[arg(long, env = "ASE_CODE_DIR")]
    pub code_dir: PathBuf,

    #[arg(long, env = "ASE_DATASET")]
    pub dataset: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct CheckPathsArgs {
    #[arg(long, env = "ASE_DATASET")]
    pub dataset: PathBuf,

    #[arg(long, env = "ASE_MAX_WORKERS", default_value_t = 1)]
    pub max_workers: usize,

    /// Write the report here instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,
}
