//! Bounded command execution inside a running container.
//!
//! The command is wrapped so that its in-container pid lands in a scratch file
//! before it execs. Both output streams are drained by reader threads into a
//! channel; the calling thread consumes the channel against a deadline, so the
//! timeout watch and the drain loop never block each other. On expiry the remote
//! process gets `SIGTERM` through a second exec; the container keeps running.

use crate::engine::ContainerEngine;
use crate::error::ExecError;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8 * 1024;
const POLL_SLICE: Duration = Duration::from_millis(100);
const DRAIN_GRACE: Duration = Duration::from_millis(300);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(1);

/// One command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub timeout_secs: u64,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
    pub sink: Option<PathBuf>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            timeout_secs,
            env: BTreeMap::new(),
            workdir: None,
            sink: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Mirror every output chunk into `path`, flushed as it arrives.
    pub fn sink(mut self, path: impl Into<PathBuf>) -> Self {
        self.sink = Some(path.into());
        self
    }
}

/// Outcome of one bounded execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Interleaved stdout and stderr bytes in arrival order.
    pub output: Vec<u8>,
    /// Exit code when the process finished before the deadline.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ExecResult {
    pub fn contains(&self, marker: &[u8]) -> bool {
        if marker.is_empty() {
            return true;
        }
        self.output
            .windows(marker.len())
            .any(|window| window == marker)
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }

    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

enum StreamEvent {
    Chunk(Vec<u8>),
    Closed,
}

/// Run `request` inside `container` and wait at most `request.timeout_secs`.
///
/// Errors are reserved for failures to start the command at all; a timeout or a
/// non-zero exit is reported through [`ExecResult`].
pub fn run(
    engine: &dyn ContainerEngine,
    container: &str,
    request: &ExecRequest,
) -> Result<ExecResult, ExecError> {
    let timeout = Duration::from_secs(request.timeout_secs);
    if timeout.is_zero() || Instant::now().checked_add(timeout).is_none() {
        return Err(ExecError::InvalidTimeout {
            value: request.timeout_secs,
        });
    }

    let argv = shell_words::split(&request.command).map_err(|err| ExecError::InvalidCommand {
        command: request.command.clone(),
        reason: err.to_string(),
    })?;
    if argv.is_empty() {
        return Err(ExecError::InvalidCommand {
            command: request.command.clone(),
            reason: "command is empty".to_string(),
        });
    }

    let mut sink = match &request.sink {
        Some(path) => Some(File::create(path).map_err(|source| ExecError::Sink {
            path: path.clone(),
            source,
        })?),
        None => None,
    };

    let pid_file = format!(
        "{}/.ase-exec-{}.pid",
        engine.scratch_dir().trim_end_matches('/'),
        Uuid::new_v4().simple()
    );
    let wrapped = wrap_with_pid_file(&pid_file, argv);

    debug!(container, command = %request.command, timeout_secs = request.timeout_secs, "executing command");
    let mut command = engine.exec_command(
        container,
        &wrapped,
        &request.env,
        request.workdir.as_deref(),
    );
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let start = Instant::now();
    let deadline = start
        .checked_add(timeout)
        .ok_or(ExecError::InvalidTimeout {
            value: request.timeout_secs,
        })?;
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        container: container.to_string(),
        source,
    })?;

    let (tx, rx) = mpsc::channel();
    let mut open_streams = 0;
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
        open_streams += 1;
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx.clone());
        open_streams += 1;
    }
    drop(tx);

    let mut output = Vec::new();
    let mut exit_code = None;
    let mut exited = false;

    loop {
        if open_streams == 0 {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        match rx.recv_timeout(POLL_SLICE.min(deadline - now)) {
            Ok(StreamEvent::Chunk(chunk)) => append(&mut output, &mut sink, request, &chunk),
            Ok(StreamEvent::Closed) => open_streams -= 1,
            Err(RecvTimeoutError::Timeout) => {
                // The process may be gone while a descendant still holds the pipes.
                if let Ok(Some(status)) = child.try_wait() {
                    exit_code = status.code();
                    exited = true;
                    drain_until(&rx, Instant::now() + DRAIN_GRACE, &mut output, &mut sink, request);
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !exited {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match child.wait_timeout(remaining) {
            Ok(Some(status)) => {
                exit_code = status.code();
                exited = true;
            }
            Ok(None) => {}
            Err(err) => warn!(container, error = %err, "failed to wait for command"),
        }
    }

    let timed_out = !exited;
    if timed_out {
        info!(container, command = %request.command, timeout_secs = request.timeout_secs, "command timed out; terminating");
        terminate_remote(engine, container, &pid_file);
        reap(&mut child);
        drain_until(&rx, Instant::now() + DRAIN_GRACE, &mut output, &mut sink, request);
    }

    Ok(ExecResult {
        output,
        exit_code: if timed_out { None } else { exit_code },
        timed_out,
        elapsed: start.elapsed(),
    })
}

fn wrap_with_pid_file(pid_file: &str, argv: Vec<String>) -> Vec<String> {
    let mut wrapped = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo $$ > {}; exec \"$@\"", shell_words::quote(pid_file)),
        "ase-exec".to_string(),
    ];
    wrapped.extend(argv);
    wrapped
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, tx: Sender<StreamEvent>) {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(StreamEvent::Chunk(buf[..n].to_vec())).is_err() {
                        return;
                    }
                }
            }
        }
        let _ = tx.send(StreamEvent::Closed);
    });
}

fn append(output: &mut Vec<u8>, sink: &mut Option<File>, request: &ExecRequest, chunk: &[u8]) {
    output.extend_from_slice(chunk);
    if let Some(file) = sink.as_mut() {
        if let Err(err) = file.write_all(chunk).and_then(|_| file.flush()) {
            warn!(
                path = %sink_display(request),
                error = %err,
                "failed to write command output; continuing in memory only"
            );
            *sink = None;
        }
    }
}

fn drain_until(
    rx: &Receiver<StreamEvent>,
    until: Instant,
    output: &mut Vec<u8>,
    sink: &mut Option<File>,
    request: &ExecRequest,
) {
    loop {
        let now = Instant::now();
        if now >= until {
            return;
        }
        match rx.recv_timeout(until - now) {
            Ok(StreamEvent::Chunk(chunk)) => append(output, sink, request, &chunk),
            Ok(StreamEvent::Closed) => {}
            Err(_) => return,
        }
    }
}

fn terminate_remote(engine: &dyn ContainerEngine, container: &str, pid_file: &str) {
    let quoted = shell_words::quote(pid_file);
    let script = format!(
        "kill -TERM \"$(cat {0})\" 2>/dev/null; rm -f {0}",
        quoted
    );
    let argv = vec!["sh".to_string(), "-c".to_string(), script];
    let mut command = engine.exec_command(container, &argv, &BTreeMap::new(), None);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match command.spawn() {
        Ok(mut killer) => match killer.wait_timeout(TERMINATE_TIMEOUT) {
            Ok(Some(_)) => {}
            _ => {
                warn!(container, "termination request did not complete in time");
                reap(&mut killer);
            }
        },
        Err(err) => warn!(container, error = %err, "failed to send termination request"),
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn sink_display(request: &ExecRequest) -> String {
    request
        .sink
        .as_deref()
        .map(Path::display)
        .map(|d| d.to_string())
        .unwrap_or_default()
}
