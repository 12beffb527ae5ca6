use crate::engine::{ContainerEngine, LaunchSpec};
use crate::error::{ExecError, RuntimeError};
use crate::exec::{self, ExecRequest, ExecResult};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

const DIGEST_TIMEOUT_SECS: u64 = 10;
const PROBE_TIMEOUT_SECS: u64 = 10;

/// Exclusive owner of one running container.
///
/// The container is stopped when the handle is released, or when it is dropped
/// on any other exit path (early return, panic unwinding).
#[derive(Debug)]
pub struct RuntimeHandle {
    engine: Arc<dyn ContainerEngine>,
    trace: String,
    id: String,
    image: String,
    created_at: DateTime<Utc>,
    released: bool,
}

impl RuntimeHandle {
    /// Start a container and block until it is running.
    pub fn acquire(
        engine: Arc<dyn ContainerEngine>,
        trace: impl Into<String>,
        spec: &LaunchSpec,
    ) -> Result<Self, RuntimeError> {
        let trace = trace.into();
        let id = engine.launch(spec)?;
        info!(unit = %trace, image = %spec.image, container = %id, "container started");
        Ok(Self {
            engine,
            trace,
            id,
            image: spec.image.clone(),
            created_at: Utc::now(),
            released: false,
        })
    }

    /// Acquire a container, run `body` with it, then release it.
    pub fn scoped<T>(
        engine: Arc<dyn ContainerEngine>,
        trace: impl Into<String>,
        spec: &LaunchSpec,
        remove_image: bool,
        body: impl FnOnce(&RuntimeHandle) -> T,
    ) -> Result<T, RuntimeError> {
        let handle = Self::acquire(engine, trace, spec)?;
        let value = body(&handle);
        handle.release(remove_image);
        Ok(value)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn trace(&self) -> &str {
        &self.trace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run a bounded command inside this container.
    pub fn run(&self, request: &ExecRequest) -> Result<ExecResult, ExecError> {
        exec::run(self.engine.as_ref(), &self.id, request)
    }

    /// Copy `local` to `remote` and confirm the bytes arrived intact.
    ///
    /// Any failure is logged and reported as `false`.
    pub fn upload_file(&self, local: &Path, remote: &str) -> bool {
        info!(unit = %self.trace, local = %local.display(), remote, "uploading file");

        let digest = match fs::read(local) {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
            Err(err) => {
                error!(unit = %self.trace, local = %local.display(), error = %err, "failed to read local file");
                return false;
            }
        };

        if let Err(err) = self.engine.copy_in(&self.id, local, remote) {
            error!(unit = %self.trace, remote, error = %err, "failed to copy file into container");
            return false;
        }

        let request = ExecRequest::new(
            format!("sha256sum {}", shell_words::quote(remote)),
            DIGEST_TIMEOUT_SECS,
        );
        let result = match self.run(&request) {
            Ok(result) => result,
            Err(err) => {
                error!(unit = %self.trace, remote, error = %err, "failed to read file digest in container");
                return false;
            }
        };

        if result.timed_out {
            error!(unit = %self.trace, remote, "reading file digest in container timed out");
            return false;
        }

        if !result.contains(digest.as_bytes()) {
            error!(
                unit = %self.trace,
                remote,
                expected = %digest,
                reported = %result.output_lossy().trim(),
                "uploaded file digest mismatch"
            );
            return false;
        }

        true
    }

    /// Best-effort check that a regular file exists inside the container.
    pub fn file_exists(&self, path: &str) -> bool {
        let request = ExecRequest::new(
            format!("test -f {}", shell_words::quote(path)),
            PROBE_TIMEOUT_SECS,
        );
        match self.run(&request) {
            Ok(result) if result.succeeded() => true,
            Ok(result) => {
                error!(unit = %self.trace, path, output = %result.output_lossy().trim(), "file not found in container");
                false
            }
            Err(err) => {
                error!(unit = %self.trace, path, error = %err, "file probe failed");
                false
            }
        }
    }

    /// Stop the container, wait for the engine to remove it and optionally drop the image.
    pub fn release(mut self, remove_image: bool) {
        self.teardown(remove_image);
    }

    fn teardown(&mut self, remove_image: bool) {
        if self.released {
            return;
        }
        self.released = true;

        info!(unit = %self.trace, container = %self.id, "stopping container");
        if let Err(err) = self.engine.stop(&self.id) {
            warn!(unit = %self.trace, container = %self.id, error = %err, "failed to stop container; stop it manually");
        }
        if let Err(err) = self.engine.wait_removed(&self.id) {
            warn!(unit = %self.trace, container = %self.id, error = %err, "failed to confirm container removal");
        }
        if remove_image {
            info!(unit = %self.trace, image = %self.image, "removing image");
            if let Err(err) = self.engine.remove_image(&self.image) {
                warn!(unit = %self.trace, image = %self.image, error = %err, "failed to remove image; remove it manually");
            }
        }
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if !self.released {
            warn!(unit = %self.trace, container = %self.id, "runtime handle dropped without release");
            self.teardown(false);
        }
    }
}
