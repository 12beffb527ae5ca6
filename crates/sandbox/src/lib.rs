//! Sandboxed execution primitives for security scans.
//!
//! A [`RuntimeHandle`] owns one disposable container for the lifetime of a scan.
//! Commands run inside it through the bounded runner in [`exec`], which streams
//! output to memory and to an optional sink file while enforcing a wall-clock
//! timeout. The [`validator`] module interprets command output against the
//! markers declared by a [`CaseDescriptor`] and sequences the checks for one
//! scan unit.

pub mod case;
pub mod engine;
pub mod error;
pub mod exec;
pub mod runtime;
pub mod testing;
pub mod validator;

pub use case::{CaseDescriptor, CheckKind};
pub use engine::{detect_engine, ContainerEngine, DockerCli, LaunchSpec};
pub use error::{CaseError, ExecError, RuntimeError};
pub use exec::{ExecRequest, ExecResult};
pub use runtime::RuntimeHandle;
pub use validator::{run_checks, validate, ScanResult};
