//! Lifecycle of one supervised run.
//!
//! The supervisor forks the root of the untrusted tree with every gate
//! installed, drives the wait loop from a single controller task while the
//! tree runs concurrently, and owns the run's state machine:
//! `Pending -> Running -> {Completed, ViolatedQuota, TimedOut, SetupFailed}`.
//! Terminal states are final; nothing observed after one is reached can
//! change the classification.

pub mod monitor;
pub mod wait;

use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_derive::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::boxdir;
use crate::intercept::cgroup::CgroupGate;
use crate::intercept::rlimit::RlimitGate;
use crate::intercept::{InterceptError, Interceptor};
use crate::quota::{Accountant, QuotaKind, Quotas};
use crate::reactor::Reactor;
use crate::utils::{Logable, Time};
use crate::verdict::Verdict;

use self::monitor::Monitor;
use self::wait::{ExitStatus, Rusage, WaitError};

/// State of a supervised run. Transitions are monotonic: once terminal,
/// always terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RunState {
    Pending,
    Running,
    Completed {
        exit_code: Option<i32>,
        exit_signal: Option<i32>,
    },
    ViolatedQuota(QuotaKind),
    TimedOut,
    SetupFailed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }

    /// Returns false (and stays put) if the current state is already
    /// terminal.
    pub fn advance(&mut self, next: RunState) -> bool {
        if self.is_terminal() {
            false
        } else {
            *self = next;
            true
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to install interception: {0}")]
    Intercept(#[from] InterceptError),
    #[error("failed to become subreaper: {0}")]
    Subreaper(#[source] std::io::Error),
    #[error("process quota of {0} leaves no slot for the root process")]
    NoRootSlot(u64),
    #[error("failed to open io redirection: {0}")]
    Redirect(#[source] std::io::Error),
    #[error("failed to spawn supervised process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("wait failed: {0}")]
    Wait(#[from] WaitError),
}

/// Runs one untrusted process tree under quotas and classifies the outcome.
pub struct Supervisor {
    quotas: Quotas,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    work_dir: PathBuf,
    stdin: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    cgroup_root: String,
    sample_interval: Duration,
}

impl Supervisor {
    pub fn new(program: impl Into<String>, quotas: Quotas) -> Self {
        Self {
            quotas,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: PathBuf::from("."),
            stdin: None,
            stdout: None,
            stderr: None,
            cgroup_root: "/sys/fs/cgroup/isolator".to_owned(),
            sample_interval: Duration::from_millis(10),
        }
    }
}

// builder
impl Supervisor {
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn stdin(mut self, stdin: impl Into<PathBuf>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn stdout(mut self, stdout: impl Into<PathBuf>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    pub fn stderr(mut self, stderr: impl Into<PathBuf>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    pub fn cgroup_root(mut self, cgroup_root: impl Into<String>) -> Self {
        self.cgroup_root = cgroup_root.into();
        self
    }

    pub fn sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

impl Supervisor {
    /// Run to completion. Every run yields exactly one terminal verdict;
    /// setup failures become a `SetupFailed` verdict rather than an error.
    pub async fn run(self) -> Verdict {
        let accountant = Arc::new(Accountant::new(self.quotas.clone()));
        match self.supervise(Arc::clone(&accountant)).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("setup failed: {e}");
                Verdict::setup_failed(e.to_string())
            }
        }
    }

    async fn supervise(self, accountant: Arc<Accountant>) -> Result<Verdict, SetupError> {
        let mut state = RunState::Pending;

        // Orphaned descendants must reparent to us, or the final reap
        // could not account for every process in the tree.
        if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } < 0 {
            return Err(SetupError::Subreaper(std::io::Error::last_os_error()));
        }

        // The root process occupies the first quota slot itself.
        if accountant.try_acquire_process().is_deny() {
            return Err(SetupError::NoRootSlot(
                self.quotas.processes.unwrap_or_default(),
            ));
        }

        let gate = Arc::new(CgroupGate::new(&self.quotas, &self.cgroup_root)?);
        let reactor = Reactor::new(Arc::clone(&gate));

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.env.iter().cloned())
            .current_dir(&self.work_dir);
        self.redirect_io(&mut command)?;
        RlimitGate::new(&self.quotas).apply_to(&mut command)?;
        gate.apply_to(&mut command)?;

        let started = Instant::now();
        let child = command.spawn().map_err(SetupError::Spawn)?;
        let pid = child.id() as i32;
        drop(child);
        state.advance(RunState::Running);
        info!("supervising pid {pid}: {} {:?}", self.program, self.args);

        let (stop_monitor, stopped) = oneshot::channel();
        let monitor = Monitor::new(
            Arc::clone(&gate),
            Arc::clone(&accountant),
            reactor.clone(),
            self.sample_interval,
        );
        let monitor_task = tokio::spawn(monitor.run(stopped));

        // The wait future must survive a timeout: its wait4 is the one and
        // only reap of the root.
        let wait_root = ExitStatus::wait(pid);
        tokio::pin!(wait_root);
        let mut timed_out = false;
        let root_status = match self.quotas.wall_time {
            Some(limit) => {
                let budget = Duration::from_millis(limit.into_milliseconds());
                tokio::select! {
                    status = &mut wait_root => status?,
                    _ = tokio::time::sleep(budget) => {
                        timed_out = true;
                        reactor.kill_tree();
                        wait_root.await?
                    }
                }
            }
            None => wait_root.await?,
        };
        let wall_time = Time::from_milliseconds(started.elapsed().as_millis() as u64);
        accountant.release_process();

        let _ = stop_monitor.send(());
        monitor_task.await.log();

        // The root is gone; everything still alive in the tree is a leak.
        // Kill and reap until no tracked descendant is left.
        reactor.kill_tree();
        while let Ok(status) = ExitStatus::wait_any().await {
            debug!(
                "reaped straggler: exit {:?} signal {:?}",
                status.exit_code(),
                status.signal_code()
            );
        }

        match boxdir::audit_files(&self.work_dir, &accountant) {
            Ok(true) => reactor.record_only(QuotaKind::FileSize),
            Ok(false) => {}
            Err(e) => warn!("output file audit failed: {e}"),
        }

        let tree_usage = Rusage::for_children();
        let time = tree_usage
            .as_ref()
            .map(|r| r.cputime() + r.usertime())
            .unwrap_or_else(|| root_status.cputime());
        let max_rss = tree_usage
            .as_ref()
            .map(|r| r.memory())
            .unwrap_or_else(|| root_status.memory())
            .max(root_status.memory());

        let killed = timed_out || reactor.violation() == Some(QuotaKind::Memory);
        let terminal = classify(reactor.violation(), timed_out, &root_status);
        state.advance(terminal);
        info!("run finished: {state:?}");

        Ok(Verdict {
            message: match &state {
                RunState::ViolatedQuota(kind) => format!("{kind} quota exceeded"),
                RunState::TimedOut => "time limit exceeded".to_owned(),
                _ => String::new(),
            },
            state,
            exit_code: root_status.exit_code(),
            exit_signal: root_status.signal_code(),
            time,
            wall_time,
            peak_memory: accountant.peak_memory().max(max_rss),
            max_rss,
            peak_processes: accountant.peak_processes(),
            denied_forks: accountant.denied_forks(),
            files: accountant.file_usage(),
            csw_voluntary: root_status.csw_voluntary(),
            csw_forced: root_status.csw_forced(),
            killed,
        })
    }

    fn redirect_io(&self, command: &mut Command) -> Result<(), SetupError> {
        match &self.stdin {
            Some(path) => {
                let file = File::open(path).map_err(SetupError::Redirect)?;
                command.stdin(Stdio::from(file));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }
        if let Some(path) = &self.stdout {
            let file = File::create(path).map_err(SetupError::Redirect)?;
            command.stdout(Stdio::from(file));
        }
        if let Some(path) = &self.stderr {
            let file = File::create(path).map_err(SetupError::Redirect)?;
            command.stderr(Stdio::from(file));
        }
        Ok(())
    }
}

/// Pick the terminal state. A recorded violation always wins over whatever
/// the root's own exit looks like; a self-inflicted signal with no quota
/// behind it completes the run rather than violating it.
fn classify(
    violation: Option<QuotaKind>,
    timed_out: bool,
    root_status: &ExitStatus,
) -> RunState {
    if let Some(kind) = violation {
        return match kind {
            QuotaKind::WallTime | QuotaKind::CpuTime => RunState::TimedOut,
            kind => RunState::ViolatedQuota(kind),
        };
    }
    if timed_out {
        return RunState::TimedOut;
    }
    if let Some(kind) = root_status.quota_signal() {
        return match kind {
            QuotaKind::CpuTime => RunState::TimedOut,
            kind => RunState::ViolatedQuota(kind),
        };
    }
    RunState::Completed {
        exit_code: root_status.exit_code(),
        exit_signal: root_status.signal_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw((code & 0xff) << 8)
    }

    fn signaled(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal & 0x7f)
    }

    #[test]
    fn states_advance_until_terminal() {
        let mut state = RunState::Pending;
        assert!(!state.is_terminal());
        assert!(state.advance(RunState::Running));
        assert!(state.advance(RunState::TimedOut));
        assert!(state.is_terminal());
        assert!(!state.advance(RunState::Completed {
            exit_code: Some(0),
            exit_signal: None,
        }));
        assert_eq!(state, RunState::TimedOut);
    }

    #[test]
    fn violations_outrank_the_root_exit() {
        let state = classify(Some(QuotaKind::Memory), false, &exited(0));
        assert_eq!(state, RunState::ViolatedQuota(QuotaKind::Memory));

        let state = classify(Some(QuotaKind::ProcessCount), false, &exited(1));
        assert_eq!(state, RunState::ViolatedQuota(QuotaKind::ProcessCount));
    }

    #[test]
    fn time_violations_become_timed_out() {
        assert_eq!(
            classify(Some(QuotaKind::WallTime), false, &signaled(libc::SIGKILL)),
            RunState::TimedOut
        );
        assert_eq!(
            classify(None, true, &signaled(libc::SIGKILL)),
            RunState::TimedOut
        );
        assert_eq!(
            classify(None, false, &signaled(libc::SIGXCPU)),
            RunState::TimedOut
        );
    }

    #[test]
    fn fsize_gate_signal_classifies_as_violation() {
        assert_eq!(
            classify(None, false, &signaled(libc::SIGXFSZ)),
            RunState::ViolatedQuota(QuotaKind::FileSize)
        );
    }

    #[test]
    fn self_inflicted_faults_complete_the_run() {
        assert_eq!(
            classify(None, false, &signaled(libc::SIGSEGV)),
            RunState::Completed {
                exit_code: None,
                exit_signal: Some(libc::SIGSEGV),
            }
        );
        assert_eq!(
            classify(None, false, &exited(3)),
            RunState::Completed {
                exit_code: Some(3),
                exit_signal: None,
            }
        );
    }
}
