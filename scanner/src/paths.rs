//! Pre-flight check that each case's vulnerable file exists in its image.

use crate::dataset::Dataset;
use ase_sandbox::{CaseDescriptor, ContainerEngine, RuntimeHandle};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathCheck {
    pub instance_id: String,
    pub inner_path_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_path_check_failed_reason: Option<String>,
}

/// Start every case's image and probe `image_inner_path/vuln_file`.
///
/// Results are sorted by instance id.
pub async fn check_paths(
    engine: Arc<dyn ContainerEngine>,
    dataset: &Dataset,
    max_workers: usize,
) -> Vec<PathCheck> {
    let cases: Vec<Arc<CaseDescriptor>> = dataset.cases().cloned().collect();
    info!(cases = cases.len(), workers = max_workers, "checking inner paths");

    let mut checks: Vec<PathCheck> = stream::iter(cases)
        .map(|case| {
            let engine = engine.clone();
            async move {
                let instance_id = case.instance_id.clone();
                match tokio::task::spawn_blocking(move || check_case(engine, &case)).await {
                    Ok(check) => check,
                    Err(err) => PathCheck {
                        instance_id,
                        inner_path_check: false,
                        inner_path_check_failed_reason: Some(format!("check panicked: {}", err)),
                    },
                }
            }
        })
        .buffer_unordered(max_workers.max(1))
        .collect()
        .await;

    checks.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
    let missing = checks.iter().filter(|c| !c.inner_path_check).count();
    info!(checked = checks.len(), missing, "inner path check finished");
    checks
}

fn check_case(engine: Arc<dyn ContainerEngine>, case: &CaseDescriptor) -> PathCheck {
    let path = case.target_path();
    let outcome = RuntimeHandle::scoped(
        engine,
        case.instance_id.clone(),
        &case.launch_spec(),
        false,
        |handle| handle.file_exists(&path),
    );

    let (found, reason) = match outcome {
        Ok(true) => (true, None),
        Ok(false) => (false, Some(format!("path does not exist: {}", path))),
        Err(err) => {
            error!(instance = %case.instance_id, code = err.code(), error = %err, "failed to start container");
            (false, Some(err.to_string()))
        }
    };
    PathCheck {
        instance_id: case.instance_id.clone(),
        inner_path_check: found,
        inner_path_check_failed_reason: reason,
    }
}
