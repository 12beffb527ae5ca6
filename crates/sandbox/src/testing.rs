//! Host-process engine for exercising runtime handles without a container daemon.
//!
//! Commands run directly on the host and "containers" are plain identifiers,
//! so this must only be used with trusted commands.

use crate::engine::{ContainerEngine, LaunchSpec};
use crate::error::RuntimeError;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct HostEngine {
    scratch: String,
    launches: AtomicUsize,
    next_id: AtomicUsize,
    copy_failures: AtomicUsize,
    fail_launch: bool,
    running: Mutex<BTreeSet<String>>,
    executed: Mutex<Vec<String>>,
    removed_images: Mutex<Vec<String>>,
}

impl HostEngine {
    /// `scratch` receives the runner's pid files.
    pub fn new(scratch: impl AsRef<Path>) -> Self {
        Self {
            scratch: scratch.as_ref().display().to_string(),
            launches: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            copy_failures: AtomicUsize::new(0),
            fail_launch: false,
            running: Mutex::new(BTreeSet::new()),
            executed: Mutex::new(Vec::new()),
            removed_images: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `count` copies, as a flaky transfer would.
    pub fn with_copy_failures(self, count: usize) -> Self {
        self.copy_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Refuse every launch, as an unreachable daemon would.
    pub fn with_failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Containers launched but not yet stopped.
    pub fn running(&self) -> Vec<String> {
        lock(&self.running).iter().cloned().collect()
    }

    /// Every argv executed, joined with spaces, in order.
    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        lock(&self.removed_images).clone()
    }
}

impl ContainerEngine for HostEngine {
    fn name(&self) -> &str {
        "host"
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_launch {
            return Err(RuntimeError::Launch {
                image: spec.image.clone(),
                message: "host engine configured to refuse launches".to_string(),
            });
        }
        let id = format!("host-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        lock(&self.running).insert(id.clone());
        Ok(id)
    }

    fn exec_command(
        &self,
        _container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> Command {
        lock(&self.executed).push(argv.join(" "));
        // An empty argv maps to a program name that can never be spawned.
        let mut command = match argv.split_first() {
            Some((program, args)) => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            None => Command::new(""),
        };
        command.envs(env);
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }
        command
    }

    fn copy_in(&self, _container: &str, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let fail = self
            .copy_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let transfer_error = |message: String| RuntimeError::Transfer {
            local: local.to_path_buf(),
            remote: remote.to_string(),
            message,
        };
        if fail {
            return Err(transfer_error("simulated transfer failure".to_string()));
        }

        let target = PathBuf::from(remote);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| transfer_error(err.to_string()))?;
        }
        fs::copy(local, &target).map_err(|err| transfer_error(err.to_string()))?;
        Ok(())
    }

    fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        if lock(&self.running).remove(container) {
            Ok(())
        } else {
            Err(RuntimeError::Engine {
                operation: "stop".to_string(),
                message: format!("no such container: {}", container),
            })
        }
    }

    fn wait_removed(&self, _container: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        lock(&self.removed_images).push(image.to_string());
        Ok(())
    }

    fn scratch_dir(&self) -> &str {
        &self.scratch
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
