use thiserror::Error;
use tokio::task::JoinError;

use crate::quota::QuotaKind;
use crate::utils::{Memory, Time};

/// Exit status and resource usage of a reaped process.
///
/// Wraps the raw `wait4` status word and classifies quota-relevant signals.
#[cfg(target_family = "unix")]
#[derive(Debug)]
pub struct ExitStatus {
    rusage: Rusage,
    code: i32,
}

#[derive(Error, Debug)]
pub enum WaitError {
    #[error("tokio::task::spawn_blocking error: `{0}`")]
    JoinError(#[from] JoinError),
    #[error("libc::wait4 failed to reap child")]
    Wait4Failed,
}

#[cfg(target_family = "unix")]
impl ExitStatus {
    pub async fn wait(pid: i32) -> Result<Self, WaitError> {
        let (code, status, rusage) = tokio::task::spawn_blocking(move || unsafe {
            let mut status: i32 = 0;
            let mut rusage = std::mem::MaybeUninit::uninit();
            let code = libc::wait4(pid, &mut status, 0, rusage.as_mut_ptr());
            (code, status, rusage)
        })
        .await?;

        if code < 0 {
            Err(WaitError::Wait4Failed)
        } else {
            let rusage = unsafe { rusage.assume_init() };
            Ok(Self {
                rusage: Rusage::from(rusage),
                code: status,
            })
        }
    }

    /// Reap whichever tracked descendant exits next.
    pub async fn wait_any() -> Result<Self, WaitError> {
        Self::wait(-1).await
    }

    #[cfg(test)]
    pub(crate) fn from_raw(code: i32) -> Self {
        Self {
            rusage: Rusage(unsafe { std::mem::zeroed() }),
            code,
        }
    }
}

#[cfg(target_family = "unix")]
impl ExitStatus {
    pub fn is_signal(&self) -> bool {
        libc::WIFSIGNALED(self.code)
    }

    pub fn signal_code(&self) -> Option<i32> {
        if self.is_signal() {
            Some(libc::WTERMSIG(self.code))
        } else {
            None
        }
    }

    pub fn is_exited(&self) -> bool {
        libc::WIFEXITED(self.code)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.is_exited() {
            true => Some(libc::WEXITSTATUS(self.code)),
            false => None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.is_exited() && self.exit_code() == Some(0)
    }

    /// The quota a fatal signal enforces, if any.
    ///
    /// `SIGXFSZ` is the file-size write gate firing at the offending call;
    /// `SIGXCPU` is the cpu-time limit. `SIGKILL` is deliberately not mapped:
    /// it can be the reactor, the oom backstop, or the program itself, and
    /// the supervisor has better evidence for all three.
    pub fn quota_signal(&self) -> Option<QuotaKind> {
        match self.signal_code() {
            Some(libc::SIGXFSZ) => Some(QuotaKind::FileSize),
            Some(libc::SIGXCPU) => Some(QuotaKind::CpuTime),
            _ => None,
        }
    }

    pub fn cputime(&self) -> Time {
        self.rusage.cputime() + self.rusage.usertime()
    }

    pub fn memory(&self) -> Memory {
        self.rusage.memory()
    }

    pub fn csw_voluntary(&self) -> u64 {
        self.rusage.0.ru_nvcsw as u64
    }

    pub fn csw_forced(&self) -> u64 {
        self.rusage.0.ru_nivcsw as u64
    }
}

#[cfg(target_family = "unix")]
#[derive(Debug)]
pub struct Rusage(libc::rusage);

#[cfg(target_family = "unix")]
impl Rusage {
    /// Aggregate usage of every reaped descendant of the current process.
    pub fn for_children() -> Option<Self> {
        let mut rusage = std::mem::MaybeUninit::uninit();
        let code = unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, rusage.as_mut_ptr()) };
        if code < 0 {
            return None;
        }
        Some(Rusage(unsafe { rusage.assume_init() }))
    }

    /// get system cpu time
    pub fn cputime(&self) -> Time {
        Time::from_milliseconds(
            (self.0.ru_stime.tv_sec * 1000 + self.0.ru_stime.tv_usec / 1000) as u64,
        )
    }

    /// get user cpu time
    pub fn usertime(&self) -> Time {
        Time::from_milliseconds(
            (self.0.ru_utime.tv_sec * 1000 + self.0.ru_utime.tv_usec / 1000) as u64,
        )
    }

    /// get max resident set size
    pub fn memory(&self) -> Memory {
        Memory::from_kilobytes(self.0.ru_maxrss as u64)
    }
}

impl From<libc::rusage> for Rusage {
    fn from(a: libc::rusage) -> Self {
        Rusage(a)
    }
}
