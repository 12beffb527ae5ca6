use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the container engine.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Invalid start command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },
    #[error("Failed to invoke container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("Failed to launch image {image}: {message}")]
    Launch { image: String, message: String },
    #[error("Container runtime call '{operation}' failed: {message}")]
    Engine { operation: String, message: String },
    #[error("Container runtime call '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },
    #[error("Failed to copy {local} into {remote}: {message}")]
    Transfer {
        local: PathBuf,
        remote: String,
        message: String,
    },
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::InvalidCommand { .. } => "RUNTIME_INVALID_COMMAND",
            RuntimeError::Spawn { .. } => "RUNTIME_SPAWN_ERROR",
            RuntimeError::Launch { .. } => "RUNTIME_LAUNCH_ERROR",
            RuntimeError::Engine { .. } => "RUNTIME_ENGINE_ERROR",
            RuntimeError::Timeout { .. } => "RUNTIME_TIMEOUT",
            RuntimeError::Transfer { .. } => "RUNTIME_TRANSFER_ERROR",
        }
    }
}

/// Failures of a bounded command execution that are not timeouts.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Timeout must be a positive, representable number of seconds (got {value})")]
    InvalidTimeout { value: u64 },
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },
    #[error("Failed to start command in container {container}: {source}")]
    Spawn {
        container: String,
        source: std::io::Error,
    },
    #[error("Failed to open output file {path}: {source}")]
    Sink {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Problems with a dataset case record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaseError {
    #[error("Command field '{key}' is missing")]
    MissingCommand { key: String },
    #[error("Command field '{key}' is invalid: {reason}")]
    InvalidCommand { key: String, reason: String },
    #[error("Timeout field '{key}' is invalid: {reason}")]
    InvalidTimeout { key: String, reason: String },
}
