use crate::case::{CaseDescriptor, CheckKind};
use crate::exec::ExecRequest;
use crate::runtime::RuntimeHandle;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};

/// Verdicts for one scan attempt of one unit.
///
/// `poc_check` is `true` when the proof of concept did NOT reproduce the
/// vulnerability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default)]
    pub patch_file: bool,
    #[serde(default)]
    pub image_status_check: bool,
    #[serde(default)]
    pub test_case_check: bool,
    #[serde(default)]
    pub poc_check: bool,
}

impl ScanResult {
    /// A result only counts once the patched file reached the container intact.
    pub fn is_valid(&self) -> bool {
        self.patch_file
    }
}

/// Run the command stored under `key` and look for `marker` in its output.
///
/// Data problems with the case fail this check only.
pub fn validate_with(
    handle: &RuntimeHandle,
    case: &CaseDescriptor,
    key: &str,
    marker: &str,
    default_timeout_secs: u64,
    sink: &Path,
) -> bool {
    let unit = handle.trace();
    info!(unit, check = key, "running check");

    let command = match case.command(key) {
        Ok(command) => command,
        Err(err) => {
            error!(unit, check = key, error = %err, "case data is invalid");
            return false;
        }
    };
    let timeout = match case.timeout_secs(key, default_timeout_secs) {
        Ok(timeout) => timeout,
        Err(err) => {
            error!(unit, check = key, error = %err, "case data is invalid");
            return false;
        }
    };

    let request = ExecRequest::new(command, timeout).sink(sink);
    let result = match handle.run(&request) {
        Ok(result) => result,
        Err(err) => {
            error!(unit, check = key, error = %err, log = %sink.display(), "failed to execute check");
            return false;
        }
    };

    if result.contains(marker.as_bytes()) {
        info!(unit, check = key, "check passed");
        return true;
    }

    if result.timed_out {
        error!(
            unit,
            check = key,
            timeout_secs = timeout,
            log = %sink.display(),
            "check timed out before printing \"{}\"",
            marker
        );
    } else {
        error!(
            unit,
            check = key,
            exit_code = ?result.exit_code,
            log = %sink.display(),
            "check output does not contain \"{}\"",
            marker
        );
    }
    false
}

/// [`validate_with`] using the marker and default timeout of `kind`.
pub fn validate(
    handle: &RuntimeHandle,
    case: &CaseDescriptor,
    kind: CheckKind,
    sink: &Path,
) -> bool {
    validate_with(
        handle,
        case,
        kind.key(),
        kind.marker(),
        kind.default_timeout_secs(),
        sink,
    )
}

/// Upload the patched file and run the checks in order.
///
/// A failed upload skips every check; a failed status check skips the test case
/// and PoC checks. The test case and PoC checks always both run.
pub fn run_checks(
    handle: &RuntimeHandle,
    case: &CaseDescriptor,
    patched_file: &Path,
    dump_dir: &Path,
) -> ScanResult {
    let unit = handle.trace();
    let mut result = ScanResult {
        patch_file: handle.upload_file(patched_file, &case.target_path()),
        ..ScanResult::default()
    };
    if !result.patch_file {
        error!(unit, "patched file could not be placed in the container; skipping checks");
        return result;
    }

    result.image_status_check = validate(
        handle,
        case,
        CheckKind::ImageStatus,
        &dump_dir.join(CheckKind::ImageStatus.log_name()),
    );
    if !result.image_status_check {
        error!(unit, "image status check failed; skipping test case and PoC checks");
        return result;
    }

    result.test_case_check = validate(
        handle,
        case,
        CheckKind::TestCase,
        &dump_dir.join(CheckKind::TestCase.log_name()),
    );
    result.poc_check = validate(
        handle,
        case,
        CheckKind::Poc,
        &dump_dir.join(CheckKind::Poc.log_name()),
    );
    result
}
