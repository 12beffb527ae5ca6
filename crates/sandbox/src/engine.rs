use crate::error::RuntimeError;
use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;
use wait_timeout::ChildExt;

// Generous because `run` may have to pull the image first.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(900);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
const COPY_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_GRACE_SECS: u64 = 10;
const REMOVAL_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REMOVAL_DEADLINE: Duration = Duration::from_secs(60);

/// What to start: an image, its start command and whether it runs privileged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub command: String,
    pub privileged: bool,
}

/// Seam between runtime handles and the container engine.
///
/// Implementations are shared across workers; every call names the container
/// it acts on, so an engine never holds per-scan state.
pub trait ContainerEngine: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Create and start a container, returning its identifier once it runs.
    fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError>;

    /// Build (but do not spawn) the process that runs `argv` inside `container`.
    fn exec_command(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> Command;

    fn copy_in(&self, container: &str, local: &Path, remote: &str) -> Result<(), RuntimeError>;

    fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    /// Block until the engine no longer knows the container.
    fn wait_removed(&self, container: &str) -> Result<(), RuntimeError>;

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Writable directory inside containers for runner bookkeeping files.
    fn scratch_dir(&self) -> &str {
        "/tmp"
    }
}

/// Engine backed by the `docker` command line (or a compatible binary such as podman).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn launch_command(&self, spec: &LaunchSpec) -> Result<Command, RuntimeError> {
        let args =
            shell_words::split(&spec.command).map_err(|err| RuntimeError::InvalidCommand {
                command: spec.command.clone(),
                reason: err.to_string(),
            })?;

        let mut command = Command::new(&self.binary);
        command.arg("run").arg("--detach").arg("--rm");
        if spec.privileged {
            command.arg("--privileged");
        }
        command.arg(&spec.image);
        command.args(args);
        Ok(command)
    }

    fn is_running(&self, container: &str) -> Result<bool, RuntimeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("container")
            .arg("inspect")
            .arg("--format")
            .arg("{{.State.Running}}")
            .arg(container);
        let output = invoke(command, &self.binary, "inspect", CONTROL_TIMEOUT)?;
        Ok(output.success && output.stdout.trim() == "true")
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerEngine for DockerCli {
    fn name(&self) -> &str {
        &self.binary
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let command = self.launch_command(spec)?;
        let output = invoke(command, &self.binary, "run", LAUNCH_TIMEOUT)?;
        if !output.success {
            return Err(RuntimeError::Launch {
                image: spec.image.clone(),
                message: output.stderr.trim().to_string(),
            });
        }

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Launch {
                image: spec.image.clone(),
                message: "runtime did not report a container id".to_string(),
            });
        }

        if !self.is_running(&id)? {
            return Err(RuntimeError::Launch {
                image: spec.image.clone(),
                message: format!("container {} is not running after start", id),
            });
        }

        Ok(id)
    }

    fn exec_command(
        &self,
        container: &str,
        argv: &[String],
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec");
        for (key, value) in env {
            command.arg("--env").arg(format!("{}={}", key, value));
        }
        if let Some(dir) = workdir {
            command.arg("--workdir").arg(dir);
        }
        command.arg(container);
        command.args(argv);
        command
    }

    fn copy_in(&self, container: &str, local: &Path, remote: &str) -> Result<(), RuntimeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("cp")
            .arg(local)
            .arg(format!("{}:{}", container, remote));
        let output = invoke(command, &self.binary, "cp", COPY_TIMEOUT)?;
        if output.success {
            Ok(())
        } else {
            Err(RuntimeError::Transfer {
                local: local.to_path_buf(),
                remote: remote.to_string(),
                message: output.stderr.trim().to_string(),
            })
        }
    }

    fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("stop")
            .arg("--time")
            .arg(STOP_GRACE_SECS.to_string())
            .arg(container);
        invoke(command, &self.binary, "stop", CONTROL_TIMEOUT)?.into_result("stop")
    }

    fn wait_removed(&self, container: &str) -> Result<(), RuntimeError> {
        let start = Instant::now();
        loop {
            let mut command = Command::new(&self.binary);
            command
                .arg("container")
                .arg("inspect")
                .arg("--format")
                .arg("{{.Id}}")
                .arg(container);
            if !invoke(command, &self.binary, "inspect", CONTROL_TIMEOUT)?.success {
                return Ok(());
            }
            if start.elapsed() >= REMOVAL_DEADLINE {
                return Err(RuntimeError::Timeout {
                    operation: "wait for removal".to_string(),
                    seconds: REMOVAL_DEADLINE.as_secs(),
                });
            }
            thread::sleep(REMOVAL_POLL_INTERVAL);
        }
    }

    fn remove_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut command = Command::new(&self.binary);
        command.arg("rmi").arg(image);
        invoke(command, &self.binary, "rmi", CONTROL_TIMEOUT)?.into_result("rmi")
    }
}

/// Pick the engine from `ASE_CONTAINER_RUNTIME`, defaulting to `docker`.
pub fn detect_engine() -> Arc<dyn ContainerEngine> {
    match env::var("ASE_CONTAINER_RUNTIME") {
        Ok(val) if !val.trim().is_empty() => Arc::new(DockerCli::new(val.trim())),
        _ => Arc::new(DockerCli::default()),
    }
}

#[derive(Debug, Clone, Default)]
struct CapturedOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

impl CapturedOutput {
    fn into_result(self, operation: &str) -> Result<(), RuntimeError> {
        if self.success {
            Ok(())
        } else {
            Err(RuntimeError::Engine {
                operation: operation.to_string(),
                message: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run a short engine management command with an upper bound on its duration.
fn invoke(
    mut command: Command,
    runtime: &str,
    operation: &str,
    timeout: Duration,
) -> Result<CapturedOutput, RuntimeError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!(runtime, operation, "invoking container runtime");

    let mut child = command.spawn().map_err(|source| RuntimeError::Spawn {
        runtime: runtime.to_string(),
        source,
    })?;
    let stdout = child.stdout.take().map(read_to_end);
    let stderr = child.stderr.take().map(read_to_end);

    let status = match child.wait_timeout(timeout) {
        Ok(Some(status)) => status,
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RuntimeError::Timeout {
                operation: operation.to_string(),
                seconds: timeout.as_secs(),
            });
        }
        Err(err) => {
            return Err(RuntimeError::Engine {
                operation: operation.to_string(),
                message: err.to_string(),
            })
        }
    };

    let collect = |handle: Option<thread::JoinHandle<Vec<u8>>>| {
        handle
            .and_then(|h| h.join().ok())
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default()
    };

    Ok(CapturedOutput {
        success: status.success(),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn read_to_end<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}
