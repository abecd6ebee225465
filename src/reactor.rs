//! Acting on violation verdicts.
//!
//! The accountant decides, the reactor acts: unconditional termination of the
//! offending tree plus a single, monotonic record of what was violated. Once
//! a violation is recorded the run's classification is fixed; anything the
//! tree still manages to output before teardown is informative only.

use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::intercept::cgroup::CgroupGate;
use crate::quota::QuotaKind;
use crate::utils::Logable;

/// Holds at most one violation; the first recorded kind wins.
#[derive(Clone, Default)]
pub struct ViolationCell(Arc<Mutex<Option<QuotaKind>>>);

impl ViolationCell {
    /// Returns true if this call recorded the violation, false if one was
    /// already present.
    pub fn record(&self, kind: QuotaKind) -> bool {
        let mut slot = self.0.lock().unwrap();
        if slot.is_none() {
            *slot = Some(kind);
            true
        } else {
            false
        }
    }

    pub fn get(&self) -> Option<QuotaKind> {
        *self.0.lock().unwrap()
    }
}

#[derive(Clone)]
pub struct Reactor {
    gate: Arc<CgroupGate>,
    violation: ViolationCell,
}

impl Reactor {
    pub fn new(gate: Arc<CgroupGate>) -> Self {
        Self {
            gate,
            violation: ViolationCell::default(),
        }
    }

    pub fn violation(&self) -> Option<QuotaKind> {
        self.violation.get()
    }

    /// Terminate the whole tree and record the violation.
    pub fn react(&self, kind: QuotaKind) {
        if !self.violation.record(kind) {
            return;
        }
        info!("{kind} quota violated, killing supervised tree");
        self.kill_tree();
    }

    /// Record a violation whose offending operation already failed inside
    /// the caller, leaving nothing to kill (a denied creation request).
    pub fn record_only(&self, kind: QuotaKind) {
        if self.violation.record(kind) {
            info!("{kind} quota violated, offending operation was denied");
        }
    }

    /// SIGKILL every member of the tree. The cgroup is frozen first so the
    /// sweep cannot race fresh forks.
    pub fn kill_tree(&self) {
        self.gate.freeze().log();
        for pid in self.gate.procs() {
            debug!("killing pid {pid}");
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
        }
        self.gate.thaw().log();
    }
}
