//! The terminal record of a supervised run.
//!
//! One verdict per run, toward the invoking caller: the terminal state, the
//! violated quota kind if any, and the resource usage summary. Serializes
//! both as JSON and as a line-oriented `key: value` meta report file.

use std::io;
use std::path::Path;

use serde_derive::Serialize;

use crate::quota::{FileUsage, QuotaKind};
use crate::supervisor::RunState;
use crate::utils::{Memory, Time};

#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// Cpu time of the whole tree.
    pub time: Time,
    pub wall_time: Time,
    /// Peak footprint: cgroup accounting when available, otherwise max rss.
    pub peak_memory: Memory,
    pub max_rss: Memory,
    pub peak_processes: u64,
    pub denied_forks: u64,
    pub files: Vec<FileUsage>,
    pub csw_voluntary: u64,
    pub csw_forced: u64,
    /// True when the sandbox itself terminated the tree.
    pub killed: bool,
    pub message: String,
}

impl Verdict {
    pub fn setup_failed(message: String) -> Self {
        Self {
            state: RunState::SetupFailed,
            exit_code: None,
            exit_signal: None,
            time: Time::from_milliseconds(0),
            wall_time: Time::from_milliseconds(0),
            peak_memory: Memory::from_bytes(0),
            max_rss: Memory::from_bytes(0),
            peak_processes: 0,
            denied_forks: 0,
            files: Vec::new(),
            csw_voluntary: 0,
            csw_forced: 0,
            killed: false,
            message,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(
            self.state,
            RunState::Completed {
                exit_code: Some(0),
                ..
            }
        )
    }

    /// Two-letter status of the meta file. `None` means a clean run, for
    /// which no status line is written.
    pub fn meta_status(&self) -> Option<&'static str> {
        match &self.state {
            RunState::SetupFailed => Some("XX"),
            RunState::TimedOut => Some("TO"),
            RunState::ViolatedQuota(_) => {
                if self.exit_signal.is_some() || self.killed {
                    Some("SG")
                } else {
                    Some("RE")
                }
            }
            RunState::Completed { .. } => {
                if self.exit_signal.is_some() {
                    Some("SG")
                } else if self.exit_code.unwrap_or(0) != 0 {
                    Some("RE")
                } else {
                    None
                }
            }
            RunState::Pending | RunState::Running => Some("XX"),
        }
    }

    /// Render the `key: value` meta report.
    pub fn meta(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("time: {:.3}", self.time.into_seconds_f64()));
        lines.push(format!(
            "time-wall: {:.3}",
            self.wall_time.into_seconds_f64()
        ));
        lines.push(format!("max-rss: {}", self.max_rss.into_kilobytes()));
        lines.push(format!("cg-mem: {}", self.peak_memory.into_kilobytes()));
        lines.push(format!("csw-voluntary: {}", self.csw_voluntary));
        lines.push(format!("csw-forced: {}", self.csw_forced));
        if let Some(code) = self.exit_code {
            lines.push(format!("exitcode: {code}"));
        }
        if let Some(signal) = self.exit_signal {
            lines.push(format!("exitsig: {signal}"));
        }
        if self.killed {
            lines.push("killed: 1".to_owned());
        }
        if self.state == RunState::ViolatedQuota(QuotaKind::Memory) {
            lines.push("cg-oom-killed: 1".to_owned());
        }
        if let Some(status) = self.meta_status() {
            lines.push(format!("status: {status}"));
        }
        if !self.message.is_empty() {
            lines.push(format!("message: {}", self.message));
        }
        lines.join("\n") + "\n"
    }

    pub fn write_meta(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.meta())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(exit_code: i32) -> Verdict {
        Verdict {
            state: RunState::Completed {
                exit_code: Some(exit_code),
                exit_signal: None,
            },
            exit_code: Some(exit_code),
            exit_signal: None,
            time: Time::from_milliseconds(1234),
            wall_time: Time::from_milliseconds(2000),
            peak_memory: Memory::from_kilobytes(2048),
            max_rss: Memory::from_kilobytes(1024),
            peak_processes: 1,
            denied_forks: 0,
            files: Vec::new(),
            csw_voluntary: 10,
            csw_forced: 2,
            killed: false,
            message: String::new(),
        }
    }

    #[test]
    fn clean_run_has_no_status_line() {
        let verdict = completed(0);
        assert!(verdict.is_ok());
        assert_eq!(verdict.meta_status(), None);
        let meta = verdict.meta();
        assert!(meta.contains("time: 1.234\n"));
        assert!(meta.contains("time-wall: 2.000\n"));
        assert!(meta.contains("max-rss: 1024\n"));
        assert!(meta.contains("cg-mem: 2048\n"));
        assert!(meta.contains("exitcode: 0\n"));
        assert!(!meta.contains("status:"));
        assert!(!meta.contains("killed:"));
    }

    #[test]
    fn nonzero_exit_reports_re() {
        let verdict = completed(1);
        assert!(!verdict.is_ok());
        assert_eq!(verdict.meta_status(), Some("RE"));
    }

    #[test]
    fn signal_death_reports_sg() {
        let mut verdict = completed(0);
        verdict.state = RunState::Completed {
            exit_code: None,
            exit_signal: Some(libc::SIGSEGV),
        };
        verdict.exit_code = None;
        verdict.exit_signal = Some(libc::SIGSEGV);
        assert_eq!(verdict.meta_status(), Some("SG"));
        assert!(verdict.meta().contains("exitsig: 11\n"));
    }

    #[test]
    fn memory_violation_marks_oom_kill() {
        let mut verdict = completed(0);
        verdict.state = RunState::ViolatedQuota(QuotaKind::Memory);
        verdict.killed = true;
        verdict.message = "memory quota exceeded".to_owned();
        let meta = verdict.meta();
        assert!(meta.contains("status: SG\n"));
        assert!(meta.contains("killed: 1\n"));
        assert!(meta.contains("cg-oom-killed: 1\n"));
        assert!(meta.contains("message: memory quota exceeded\n"));
    }

    #[test]
    fn timeout_and_setup_failure_statuses() {
        let mut verdict = completed(0);
        verdict.state = RunState::TimedOut;
        verdict.killed = true;
        assert_eq!(verdict.meta_status(), Some("TO"));

        let setup = Verdict::setup_failed("no such program".to_owned());
        assert_eq!(setup.meta_status(), Some("XX"));
        assert!(setup.meta().contains("message: no such program\n"));
    }

    #[test]
    fn meta_lines_are_singly_delimited() {
        // meta consumers split each line on ':', so values must not add more
        let verdict = completed(0);
        for line in verdict.meta().lines() {
            assert_eq!(line.matches(':').count(), 1, "line {line:?}");
        }
    }

    #[test]
    fn verdict_serializes_to_json() {
        let verdict = completed(0);
        let json = serde_json::to_string(&verdict).unwrap();
        assert!(json.contains("\"Completed\""));
        assert!(json.contains("\"peak_processes\":1"));
    }
}
