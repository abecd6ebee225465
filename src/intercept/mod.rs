//! Synchronous gates between the untrusted tree and quota-relevant
//! operations.
//!
//! Every gate is installed into the child before exec and enforced by the
//! kernel inside the untrusted process's own execution context: the gated
//! call itself fails, before any forbidden state becomes observable. Writes
//! are gated by `RLIMIT_FSIZE` ([`rlimit::RlimitGate`]), process creation by
//! the run cgroup's `pids.max` ([`cgroup::CgroupGate`]). Memory is the one
//! dimension without a practical per-allocation gate; the cgroup exposes its
//! accounting files for the supervisor's sampling monitor instead, with the
//! cgroup hard limit as backstop.

pub mod cgroup;
pub mod rlimit;

use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("cgroup setup failed: {0}")]
    Cgroup(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A quota gate applied to the supervised command before exec.
///
/// Gates that hold kernel state release it in their [`Drop`] impl.
pub trait Interceptor {
    fn apply_to(&self, command: &mut Command) -> Result<(), InterceptError>;
}
