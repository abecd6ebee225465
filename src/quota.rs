//! Resource accounting for one supervised run.
//!
//! The [`Accountant`] owns the live counters for every quota dimension and
//! answers a single question: would this operation break a quota? It never
//! terminates anything itself; acting on a `Deny` belongs to the reactor.
//!
//! Check and commit are a single critical section per dimension: the file
//! table sits behind a mutex, the process slot counter is a compare-and-swap
//! loop. Two racing operations can therefore never both pass a check against
//! a stale counter and jointly overshoot a limit.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_derive::Serialize;

use crate::utils::{Memory, Time};

/// One quota dimension of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QuotaKind {
    FileSize,
    Memory,
    ProcessCount,
    CpuTime,
    WallTime,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaKind::FileSize => write!(f, "file size"),
            QuotaKind::Memory => write!(f, "memory"),
            QuotaKind::ProcessCount => write!(f, "process count"),
            QuotaKind::CpuTime => write!(f, "cpu time"),
            QuotaKind::WallTime => write!(f, "wall time"),
        }
    }
}

/// Whether a memory footprint landing exactly on the limit is allowed.
///
/// The file-size and process-count dimensions are always inclusive at the
/// limit; memory keeps this as an explicit policy flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryBoundary {
    /// Usage equal to the limit is allowed (default).
    Inclusive,
    /// Usage equal to the limit is already a violation.
    Exclusive,
}

/// Per-run limits, immutable for the duration of the run.
///
/// `None` means the dimension is unlimited. All limits are inclusive:
/// exactly-at-limit operation is indistinguishable from unlimited operation.
#[derive(Debug, Clone)]
pub struct Quotas {
    /// Max size of any single file written by the tree, in bytes.
    pub fsize: Option<Memory>,
    /// Max resident memory of the whole tree, in bytes.
    pub memory: Option<Memory>,
    /// Max simultaneously live processes, root included.
    pub processes: Option<u64>,
    /// Max cpu time of the whole tree.
    pub cpu_time: Option<Time>,
    /// Max wall-clock time of the run.
    pub wall_time: Option<Time>,
    pub memory_boundary: MemoryBoundary,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            fsize: None,
            memory: None,
            processes: None,
            cpu_time: None,
            wall_time: None,
            memory_boundary: MemoryBoundary::Inclusive,
        }
    }
}

/// Verdict of a single quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_deny(self) -> bool {
        self == Decision::Deny
    }
}

/// Bytes accounted against the file-size quota for one output file.
#[derive(Debug, Clone, Serialize)]
pub struct FileUsage {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Live counters for one supervised run.
pub struct Accountant {
    quotas: Quotas,
    files: Mutex<HashMap<PathBuf, u64>>,
    live_processes: AtomicU64,
    peak_processes: AtomicU64,
    denied_forks: AtomicU64,
    peak_memory: AtomicU64,
}

impl Accountant {
    pub fn new(quotas: Quotas) -> Self {
        Self {
            quotas,
            files: Mutex::new(HashMap::new()),
            live_processes: AtomicU64::new(0),
            peak_processes: AtomicU64::new(0),
            denied_forks: AtomicU64::new(0),
            peak_memory: AtomicU64::new(0),
        }
    }

}

// FileSize dimension
impl Accountant {
    /// Account a pending write of `len` bytes to `path`.
    ///
    /// `Deny` iff the file's running total plus `len` would strictly exceed
    /// the limit; a denied write commits nothing. Byte-exact: a write landing
    /// the total exactly on the limit is allowed.
    pub fn charge_write(&self, path: &Path, len: u64) -> Decision {
        let mut files = self.files.lock().unwrap();
        let total = files.entry(path.to_path_buf()).or_insert(0);
        if let Some(limit) = self.quotas.fsize {
            if *total + len > limit.into_bytes() {
                return Decision::Deny;
            }
        }
        *total += len;
        Decision::Allow
    }

    pub fn file_usage(&self) -> Vec<FileUsage> {
        let files = self.files.lock().unwrap();
        let mut usage: Vec<FileUsage> = files
            .iter()
            .map(|(path, bytes)| FileUsage {
                path: path.clone(),
                bytes: *bytes,
            })
            .collect();
        usage.sort_by(|a, b| a.path.cmp(&b.path));
        usage
    }
}

// ProcessCount dimension
impl Accountant {
    /// Account a pending process creation.
    ///
    /// The check and the increment are one atomic step: of two racing
    /// requests for the last slot, exactly one succeeds. `Deny` means no
    /// process was created and nothing needs to be killed.
    pub fn try_acquire_process(&self) -> Decision {
        loop {
            let live = self.live_processes.load(Ordering::SeqCst);
            if let Some(limit) = self.quotas.processes {
                if live + 1 > limit {
                    self.denied_forks.fetch_add(1, Ordering::SeqCst);
                    return Decision::Deny;
                }
            }
            if self
                .live_processes
                .compare_exchange(live, live + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.peak_processes.fetch_max(live + 1, Ordering::SeqCst);
                return Decision::Allow;
            }
        }
    }

    /// Release a slot. Saturating: a kernel sample may already have set the
    /// live count to zero by the time an exit is processed.
    pub fn release_process(&self) {
        let mut live = self.live_processes.load(Ordering::SeqCst);
        while live > 0 {
            match self.live_processes.compare_exchange(
                live,
                live - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(current) => live = current,
            }
        }
    }

    /// Record an externally observed live-process count (cgroup sample).
    pub fn observe_live(&self, count: u64) {
        self.live_processes.store(count, Ordering::SeqCst);
        self.peak_processes.fetch_max(count, Ordering::SeqCst);
    }

    /// Record the kernel's cumulative denied-creation counter.
    pub fn record_fork_denials(&self, count: u64) {
        self.denied_forks.fetch_max(count, Ordering::SeqCst);
    }

    pub fn live_processes(&self) -> u64 {
        self.live_processes.load(Ordering::SeqCst)
    }

    pub fn peak_processes(&self) -> u64 {
        self.peak_processes.load(Ordering::SeqCst)
    }

    pub fn denied_forks(&self) -> u64 {
        self.denied_forks.load(Ordering::SeqCst)
    }
}

// Memory dimension
impl Accountant {
    /// Classify an observed footprint of the tree.
    ///
    /// The comparison uses the kernel-reported figure as-is, with no padding,
    /// so exact-at-limit usage is never misclassified under the inclusive
    /// policy.
    pub fn check_memory(&self, observed: Memory) -> Decision {
        self.peak_memory
            .fetch_max(observed.into_bytes(), Ordering::SeqCst);
        let limit = match self.quotas.memory {
            Some(limit) => limit,
            None => return Decision::Allow,
        };
        let over = match self.quotas.memory_boundary {
            MemoryBoundary::Inclusive => observed > limit,
            MemoryBoundary::Exclusive => observed >= limit,
        };
        if over {
            Decision::Deny
        } else {
            Decision::Allow
        }
    }

    pub fn peak_memory(&self) -> Memory {
        Memory::from_bytes(self.peak_memory.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn with_fsize(kilobytes: u64) -> Accountant {
        Accountant::new(Quotas {
            fsize: Some(Memory::from_kilobytes(kilobytes)),
            ..Quotas::default()
        })
    }

    #[test]
    fn write_exactly_at_limit_is_allowed() {
        let acc = with_fsize(256);
        let file = Path::new("file1.txt");
        for _ in 0..256 {
            assert_eq!(acc.charge_write(file, 1024), Decision::Allow);
        }
        assert_eq!(acc.file_usage()[0].bytes, 256 * 1024);
    }

    #[test]
    fn write_crossing_limit_is_denied_at_that_call() {
        let acc = with_fsize(256);
        let file = Path::new("file3.txt");
        assert_eq!(acc.charge_write(file, 256 * 1024), Decision::Allow);
        assert_eq!(acc.charge_write(file, 1), Decision::Deny);
        // the denied byte must not have been committed
        assert_eq!(acc.file_usage()[0].bytes, 256 * 1024);
        // and the file is not poisoned for zero-length operations
        assert_eq!(acc.charge_write(file, 0), Decision::Allow);
    }

    #[test]
    fn files_are_accounted_separately() {
        let acc = with_fsize(256);
        assert_eq!(
            acc.charge_write(Path::new("file1.txt"), 256 * 1024),
            Decision::Allow
        );
        assert_eq!(
            acc.charge_write(Path::new("file2.txt"), 256 * 1024),
            Decision::Allow
        );
        assert_eq!(
            acc.charge_write(Path::new("file2.txt"), 1),
            Decision::Deny
        );
    }

    #[test]
    fn unlimited_files_never_deny() {
        let acc = Accountant::new(Quotas::default());
        assert_eq!(
            acc.charge_write(Path::new("big"), u64::MAX / 2),
            Decision::Allow
        );
    }

    #[test]
    fn process_slots_are_creation_exact() {
        let acc = Accountant::new(Quotas {
            processes: Some(50),
            ..Quotas::default()
        });
        for _ in 0..50 {
            assert_eq!(acc.try_acquire_process(), Decision::Allow);
        }
        assert_eq!(acc.try_acquire_process(), Decision::Deny);
        assert_eq!(acc.live_processes(), 50);
        assert_eq!(acc.peak_processes(), 50);
        assert_eq!(acc.denied_forks(), 1);

        acc.release_process();
        assert_eq!(acc.try_acquire_process(), Decision::Allow);
    }

    #[test]
    fn racing_requests_cannot_share_the_last_slot() {
        let acc = Arc::new(Accountant::new(Quotas {
            processes: Some(8),
            ..Quotas::default()
        }));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let acc = Arc::clone(&acc);
                std::thread::spawn(move || acc.try_acquire_process() == Decision::Allow)
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 8);
        assert_eq!(acc.live_processes(), 8);
        assert_eq!(acc.denied_forks(), 24);
    }

    #[test]
    fn memory_boundary_policy_is_applied_consistently() {
        let limit = Memory::from_megabytes(32);
        let inclusive = Accountant::new(Quotas {
            memory: Some(limit),
            ..Quotas::default()
        });
        assert_eq!(inclusive.check_memory(limit), Decision::Allow);
        assert_eq!(
            inclusive.check_memory(Memory::from_bytes(limit.into_bytes() + 1)),
            Decision::Deny
        );

        let exclusive = Accountant::new(Quotas {
            memory: Some(limit),
            memory_boundary: MemoryBoundary::Exclusive,
            ..Quotas::default()
        });
        assert_eq!(
            exclusive.check_memory(Memory::from_bytes(limit.into_bytes() - 1)),
            Decision::Allow
        );
        assert_eq!(exclusive.check_memory(limit), Decision::Deny);
    }

    #[test]
    fn memory_checks_track_the_peak() {
        let acc = Accountant::new(Quotas::default());
        acc.check_memory(Memory::from_megabytes(28));
        acc.check_memory(Memory::from_megabytes(12));
        assert_eq!(acc.peak_memory(), Memory::from_megabytes(28));
    }
}
