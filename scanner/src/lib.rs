//! Security scan orchestration for generated code.
//!
//! A batch directory holds one code directory per scan unit
//! (`<instance_id>_cycle<N>`) plus the generation record. The [`driver`] plans
//! the units still lacking a valid result, hands them to the [`scheduler`]'s
//! bounded worker pool, retries units whose patched file never arrived intact
//! and always finishes by merging the [`store`] into `scan_results.json`.

pub mod config;
pub mod dataset;
pub mod driver;
pub mod error;
pub mod paths;
pub mod prepare;
pub mod scheduler;
pub mod store;
pub mod unit;

pub use config::Cli;
pub use dataset::{Dataset, GenerationEntry, GenerationRecord};
pub use driver::{merge_results, security_scan, ScanOutcome, ScanReport, ScanSettings};
pub use error::{DatasetError, StoreError, UnitIdError};
pub use paths::{check_paths, PathCheck};
pub use scheduler::{scan_unit, CancelToken, PassSummary, ScanPlan, Scheduler};
pub use store::{MergedEntry, MergedReport, ResultStore};
pub use unit::{ScanUnit, UnitId};
