use std::os::unix::process::CommandExt;
use std::process::Command;

use rlimit::{setrlimit, Resource, INFINITY};

use crate::quota::Quotas;
use crate::utils::Time;

use super::{InterceptError, Interceptor};

/// `setrlimit` gates, installed via `pre_exec`.
///
/// `RLIMIT_FSIZE` is the write gate: the kernel checks every write against it
/// before a single byte lands, so the write that would push a file past the
/// limit fails with `EFBIG` and raises `SIGXFSZ` at that call. Writes landing
/// a file exactly on the limit go through untouched.
pub struct RlimitGate {
    fsize: Option<u64>,
    cpu_seconds: Option<u64>,
}

impl RlimitGate {
    pub fn new(quotas: &Quotas) -> Self {
        Self {
            fsize: quotas.fsize.map(|m| m.into_bytes()),
            cpu_seconds: quotas.cpu_time.map(cpu_seconds),
        }
    }
}

/// `RLIMIT_CPU` only has second granularity; round up so a fractional limit
/// does not truncate to zero.
fn cpu_seconds(limit: Time) -> u64 {
    (limit.into_milliseconds() + 999) / 1000
}

impl Interceptor for RlimitGate {
    fn apply_to(&self, command: &mut Command) -> Result<(), InterceptError> {
        let fsize = self.fsize;
        let cpu = self.cpu_seconds;
        unsafe {
            command.pre_exec(move || {
                if let Some(limit) = fsize {
                    setrlimit(Resource::FSIZE, limit, limit)?;
                }
                if let Some(limit) = cpu {
                    setrlimit(Resource::CPU, limit, limit)?;
                }
                setrlimit(Resource::STACK, INFINITY, INFINITY)?;
                // No core dump needed
                setrlimit(Resource::CORE, 0, 0)?;
                Ok(())
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Memory;

    #[test]
    fn fsize_knob_is_byte_exact() {
        let gate = RlimitGate::new(&Quotas {
            fsize: Some(Memory::from_kilobytes(256)),
            ..Quotas::default()
        });
        assert_eq!(gate.fsize, Some(256 * 1024));
        assert_eq!(gate.cpu_seconds, None);
    }

    #[test]
    fn fractional_cpu_limits_round_up() {
        assert_eq!(cpu_seconds(Time::from_milliseconds(1)), 1);
        assert_eq!(cpu_seconds(Time::from_milliseconds(1000)), 1);
        assert_eq!(cpu_seconds(Time::from_milliseconds(1001)), 2);
    }
}
