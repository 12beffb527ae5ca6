use ase_sandbox::testing::HostEngine;
use ase_sandbox::{ContainerEngine, ScanResult};
use ase_scanner::{
    security_scan, CancelToken, ResultStore, ScanOutcome, ScanSettings, UnitId,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const VULN_FILE: &str = "src/handler.py";

/// A batch directory, a dataset and a fake container filesystem.
struct Batch {
    root: TempDir,
    instances: Vec<String>,
    extra: BTreeMap<String, Value>,
}

impl Batch {
    fn new(instances: &[&str]) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            instances: instances.iter().map(|s| s.to_string()).collect(),
            extra: BTreeMap::new(),
        }
    }

    fn with_case_field(mut self, key: &str, value: Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }

    fn code_dir(&self) -> PathBuf {
        self.root.path().join("model__batch1")
    }

    fn dataset_path(&self) -> PathBuf {
        self.root.path().join("dataset.json")
    }

    fn inner_path(&self, instance: &str) -> PathBuf {
        self.root.path().join("containers").join(instance)
    }

    fn write_dataset(&self) {
        let cases: Vec<Value> = self
            .instances
            .iter()
            .map(|id| {
                let mut case = json!({
                    "instance_id": id,
                    "image": format!("ase/{}:latest", id),
                    "image_run_cmd": "sleep infinity",
                    "image_inner_path": self.inner_path(id).display().to_string(),
                    "vuln_file": VULN_FILE,
                    "image_status_check_cmd": "echo '[A.S.E] image startup successfully'",
                    "test_case_cmd": "echo '[A.S.E] test case passed'",
                    "poc_cmd": "echo '[A.S.E] vulnerability not found'",
                });
                let object = case.as_object_mut().unwrap();
                for (k, v) in &self.extra {
                    object.insert(k.clone(), v.clone());
                }
                case
            })
            .collect();
        fs::write(self.dataset_path(), Value::Array(cases).to_string()).unwrap();
    }

    /// Write generated code for `units` and the generation record.
    fn write_units(&self, units: &[(&str, bool)]) {
        let code_dir = self.code_dir();
        let mut record = serde_json::Map::new();
        for (unit, success) in units {
            if *success {
                let file = code_dir.join(unit).join(VULN_FILE);
                fs::create_dir_all(file.parent().unwrap()).unwrap();
                fs::write(&file, format!("# fixed by {}\n<MASKED>\nok = True\n", unit)).unwrap();
            }
            record.insert(unit.to_string(), json!({"success": success, "time": 1.5}));
        }
        fs::create_dir_all(&code_dir).unwrap();
        fs::write(
            code_dir.join("processed_instances.json"),
            Value::Object(record).to_string(),
        )
        .unwrap();
    }

    fn store(&self) -> ResultStore {
        ResultStore::open(self.code_dir()).unwrap()
    }
}

fn settings(workers: usize) -> ScanSettings {
    ScanSettings {
        max_workers: workers,
        retry_backoff: Duration::from_millis(10),
        ..ScanSettings::default()
    }
}

async fn run(
    engine: &Arc<HostEngine>,
    batch: &Batch,
    settings: &ScanSettings,
) -> ase_scanner::ScanReport {
    security_scan(
        engine.clone() as Arc<dyn ContainerEngine>,
        &batch.code_dir(),
        &batch.dataset_path(),
        settings,
        CancelToken::new(),
    )
    .await
    .unwrap()
}

fn all_passed() -> ScanResult {
    ScanResult {
        patch_file: true,
        image_status_check: true,
        test_case_check: true,
        poc_check: true,
    }
}

#[tokio::test]
async fn scans_every_unit_and_merges() {
    let batch = Batch::new(&["flask-sqli", "php-xss"]);
    batch.write_dataset();
    batch.write_units(&[("flask-sqli_cycle1", true), ("php-xss_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(2)).await;

    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 1 });
    assert_eq!(engine.launch_count(), 2);
    assert!(engine.running().is_empty());
    assert_eq!(report.merged.len(), 2);
    assert!(report.merged.iter().all(|entry| entry.result == all_passed()));
    assert_eq!(report.merged[0].instance_id, "flask-sqli_cycle1");

    // The uploaded copy has its mask lines stripped.
    let uploaded = fs::read_to_string(batch.inner_path("php-xss").join(VULN_FILE)).unwrap();
    assert_eq!(uploaded, "# fixed by php-xss_cycle1\nok = True\n");

    let logs = batch.code_dir().join("php-xss_cycle1").join("scan_outputs");
    for log in ["image_status_check.log", "test_case.log", "poc.log"] {
        assert!(logs.join(log).exists(), "missing {}", log);
    }
    assert!(batch.code_dir().join("scan_results.json").exists());
}

#[tokio::test]
async fn failed_generation_never_gets_a_container() {
    let batch = Batch::new(&["a", "b"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", false), ("b_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(2)).await;

    assert_eq!(engine.launch_count(), 1);
    assert_eq!(batch.store().load(&UnitId::new("a", 1)).unwrap(), None);
    assert_eq!(report.merged.len(), 1);
}

#[tokio::test]
async fn units_outside_the_dataset_are_skipped() {
    let batch = Batch::new(&["kept"]);
    batch.write_dataset();
    batch.write_units(&[("kept_cycle1", true), ("retired_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    run(&engine, &batch, &settings(1)).await;

    assert_eq!(engine.launch_count(), 1);
    assert_eq!(batch.store().load(&UnitId::new("retired", 1)).unwrap(), None);
}

#[tokio::test]
async fn rerun_scans_only_units_without_a_valid_result() {
    let batch = Batch::new(&["a", "b", "c", "d"]);
    batch.write_dataset();
    batch.write_units(&[
        ("a_cycle1", true),
        ("b_cycle1", true),
        ("c_cycle1", true),
        ("d_cycle1", true),
    ]);
    let store = batch.store();
    store.record(&UnitId::new("a", 1), &all_passed()).unwrap();
    store.record(&UnitId::new("b", 1), &all_passed()).unwrap();
    store.record(&UnitId::new("c", 1), &ScanResult::default()).unwrap();
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(2)).await;

    assert_eq!(engine.launch_count(), 2);
    assert_eq!(report.passes.len(), 1);
    assert_eq!(report.passes[0].scheduled, 2);
    assert_eq!(report.passes[0].retried, 1);
    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 1 });
}

#[tokio::test]
async fn transfer_failures_converge_on_retry() {
    let batch = Batch::new(&["a", "b"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true), ("b_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()).with_copy_failures(2));

    let report = run(&engine, &batch, &settings(1)).await;

    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 2 });
    assert_eq!(report.passes.len(), 2);
    assert_eq!(report.passes[0].failed, 2);
    assert_eq!(report.passes[1].succeeded, 2);
    assert_eq!(report.passes[1].retried, 2);
    assert_eq!(engine.launch_count(), 4);
    assert!(report.merged.iter().all(|entry| entry.result.patch_file));
}

#[tokio::test]
async fn retry_exhaustion_still_merges() {
    let batch = Batch::new(&["a", "b"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true), ("b_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()).with_copy_failures(100));

    let report = run(&engine, &batch, &settings(2)).await;

    assert_eq!(report.outcome, ScanOutcome::RetryExhausted { invalid: 2 });
    assert_eq!(report.outcome.exit_code(), 1);
    assert_eq!(report.passes.len(), 3);
    assert_eq!(engine.launch_count(), 6);
    assert_eq!(report.merged.len(), 2);
    assert!(report
        .merged
        .iter()
        .all(|entry| entry.result == ScanResult::default()));
    assert!(batch.code_dir().join("scan_results.json").exists());
}

#[tokio::test]
async fn launch_failures_are_recorded_as_invalid() {
    let batch = Batch::new(&["a"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()).with_failing_launch());
    let settings = ScanSettings {
        retry_attempts: 1,
        ..settings(1)
    };

    let report = run(&engine, &batch, &settings).await;

    assert_eq!(report.outcome, ScanOutcome::RetryExhausted { invalid: 1 });
    assert_eq!(
        batch.store().load(&UnitId::new("a", 1)).unwrap(),
        Some(ScanResult::default())
    );
}

#[tokio::test]
async fn failed_status_check_leaves_later_checks_false() {
    let batch = Batch::new(&["a"])
        .with_case_field("image_status_check_cmd", json!("echo 'port 8080 refused'"))
        .with_case_field("test_case_cmd", json!("echo test-case-ran"))
        .with_case_field("poc_cmd", json!("echo poc-ran"));
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(1)).await;

    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 1 });
    assert_eq!(
        report.merged[0].result,
        ScanResult {
            patch_file: true,
            ..ScanResult::default()
        }
    );
    assert!(!engine.executed().iter().any(|cmd| cmd.contains("poc-ran")));
}

#[tokio::test]
async fn missing_patched_file_fails_the_unit_without_a_result() {
    let batch = Batch::new(&["a", "b"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true), ("b_cycle1", true)]);
    fs::remove_file(batch.code_dir().join("a_cycle1").join(VULN_FILE)).unwrap();
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(2)).await;

    assert_eq!(report.passes[0].failed, 1);
    assert_eq!(report.passes[0].succeeded, 1);
    assert_eq!(engine.launch_count(), 1);
    assert_eq!(batch.store().load(&UnitId::new("a", 1)).unwrap(), None);
    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 1 });
}

#[tokio::test]
async fn interrupt_before_dispatch_starts_nothing() {
    let batch = Batch::new(&["a", "b"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true), ("b_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));
    let cancel = CancelToken::new();
    cancel.cancel();

    let report = security_scan(
        engine.clone() as Arc<dyn ContainerEngine>,
        &batch.code_dir(),
        &batch.dataset_path(),
        &settings(2),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, ScanOutcome::Cancelled { completed: 0 });
    assert_eq!(report.passes[0].cancelled, 2);
    assert_eq!(engine.launch_count(), 0);
    assert!(report.merged.is_empty());
    assert!(batch.code_dir().join("scan_results.json").exists());
}

#[tokio::test]
async fn interrupt_lets_running_units_finish() {
    let batch = Batch::new(&["a", "b", "c"])
        .with_case_field("image_status_check_cmd", json!("sh -c 'sleep 1; echo \"[A.S.E] image startup successfully\"'"));
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", true), ("b_cycle1", true), ("c_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));
    let cancel = CancelToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let report = security_scan(
        engine.clone() as Arc<dyn ContainerEngine>,
        &batch.code_dir(),
        &batch.dataset_path(),
        &settings(1),
        cancel,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, ScanOutcome::Cancelled { completed: 1 });
    assert_eq!(report.passes[0].cancelled, 2);
    assert_eq!(engine.launch_count(), 1);
    assert_eq!(report.merged.len(), 1);
    assert!(report.merged[0].result.poc_check);
}

#[tokio::test]
async fn cut_repos_trim_the_unit_directory() {
    let batch = Batch::new(&["big"]);
    batch.write_dataset();
    batch.write_units(&[("big_cycle1", true)]);
    let unit_dir = batch.code_dir().join("big_cycle1");
    fs::write(unit_dir.join("huge_fixture.bin"), vec![0u8; 1024]).unwrap();
    let cut_path = batch.root.path().join("cut_repos.json");
    fs::write(&cut_path, json!({"big": [VULN_FILE]}).to_string()).unwrap();
    let engine = Arc::new(HostEngine::new(batch.root.path()));
    let settings = ScanSettings {
        cut_repos: Some(cut_path),
        ..settings(1)
    };

    let report = run(&engine, &batch, &settings).await;

    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 1 });
    assert!(!unit_dir.join("huge_fixture.bin").exists());
    assert!(Path::new(&format!("{}_backup", unit_dir.display()))
        .join("huge_fixture.bin")
        .exists());
}

#[tokio::test]
async fn empty_batch_completes_without_passes() {
    let batch = Batch::new(&["a"]);
    batch.write_dataset();
    batch.write_units(&[("a_cycle1", false)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let report = run(&engine, &batch, &settings(4)).await;

    assert_eq!(report.outcome, ScanOutcome::Completed { passes: 0 });
    assert!(report.passes.is_empty());
    assert_eq!(engine.launch_count(), 0);
}

#[tokio::test]
async fn missing_dataset_is_fatal() {
    let batch = Batch::new(&["a"]);
    batch.write_units(&[("a_cycle1", true)]);
    let engine = Arc::new(HostEngine::new(batch.root.path()));

    let err = security_scan(
        engine as Arc<dyn ContainerEngine>,
        &batch.code_dir(),
        &batch.dataset_path(),
        &settings(1),
        CancelToken::new(),
    )
    .await
    .unwrap_err();
    assert!(format!("{:#}", err).contains("loading dataset"));
}
