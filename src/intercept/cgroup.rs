mod v2;

use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::{Cgroup, CgroupPid, MaxValue};
use log::{debug, warn};
use uuid::Uuid;

use crate::quota::Quotas;
use crate::utils::Memory;

use super::{InterceptError, Interceptor};

/// Per-run cgroup v2, the creation gate for the process-count quota.
///
/// `pids.max` makes the (limit+1)-th creation attempt fail inside the caller:
/// the fork returns `EAGAIN` and no process ever exists, serialized by the
/// kernel across the whole tree. The memory hard limit is a backstop behind
/// the sampling monitor; the accounting files under [`CgroupGate::path`] feed
/// that monitor.
pub struct CgroupGate {
    cgroup: Cgroup,
    path: PathBuf,
}

impl CgroupGate {
    pub fn new(quotas: &Quotas, cgroup_root: &str) -> Result<Self, InterceptError> {
        if let Err(e) = fs::create_dir_all(cgroup_root) {
            return Err(InterceptError::Cgroup(format!(
                "cannot create {cgroup_root}: {e}"
            )));
        }
        // Controllers must be delegated into our subtree before limits apply.
        if let Err(e) = fs::write(
            PathBuf::from(cgroup_root).join("cgroup.subtree_control"),
            "+memory +pids",
        ) {
            debug!("could not enable controllers under {cgroup_root}: {e}");
        }

        let name = format!("run_{}", Uuid::new_v4());
        debug!("creating cgroup {cgroup_root}/{name}");

        let hier = Box::new(v2::V2::from(cgroup_root));
        let mut builder = CgroupBuilder::new(&name);
        if let Some(memory) = quotas.memory {
            builder = builder
                .memory()
                .memory_hard_limit(memory.into_bytes() as i64)
                .done();
        }
        if let Some(processes) = quotas.processes {
            builder = builder
                .pid()
                .maximum_number_of_processes(MaxValue::Value(processes as i64))
                .done();
        }
        let cgroup = builder.build(hier);

        let path = PathBuf::from(cgroup_root).join(&name);
        Ok(Self { cgroup, path })
    }

    /// Current resident memory of the whole tree, kernel-reported.
    pub fn current_memory(&self) -> Option<Memory> {
        self.read_counter("memory.current").map(Memory::from_bytes)
    }

    /// Current number of live processes in the tree.
    pub fn current_pids(&self) -> Option<u64> {
        self.read_counter("pids.current")
    }

    /// Cumulative count of process creations denied by `pids.max`.
    pub fn denied_forks(&self) -> u64 {
        self.event_counter("pids.events", "max")
    }

    /// Cumulative count of kills by the memory hard-limit backstop.
    pub fn oom_kills(&self) -> u64 {
        self.event_counter("memory.events", "oom_kill")
    }

    /// Pids of every live member of the tree.
    pub fn procs(&self) -> Vec<i32> {
        match fs::read_to_string(self.path.join("cgroup.procs")) {
            Ok(contents) => contents
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Stop every member so a kill sweep cannot race new forks.
    pub fn freeze(&self) -> io::Result<()> {
        fs::write(self.path.join("cgroup.freeze"), "1")
    }

    pub fn thaw(&self) -> io::Result<()> {
        fs::write(self.path.join("cgroup.freeze"), "0")
    }

    fn read_counter(&self, file: &str) -> Option<u64> {
        let contents = fs::read_to_string(self.path.join(file)).ok()?;
        contents.trim().parse().ok()
    }

    fn event_counter(&self, file: &str, key: &str) -> u64 {
        match fs::read_to_string(self.path.join(file)) {
            Ok(contents) => parse_flat_keyed(&contents, key).unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Interceptor for CgroupGate {
    fn apply_to(&self, command: &mut Command) -> Result<(), InterceptError> {
        let cgroup = self.cgroup.clone();
        unsafe {
            command.pre_exec(move || {
                cgroup
                    .add_task(CgroupPid::from(std::process::id() as u64))
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                Ok(())
            });
        }
        Ok(())
    }
}

impl Drop for CgroupGate {
    fn drop(&mut self) {
        debug!("removing cgroup {:?}", self.path);
        if let Err(e) = self.cgroup.delete() {
            warn!("failed to delete cgroup {:?}: {e}", self.path);
        }
    }
}

/// Parse one counter out of a flat-keyed cgroup file such as `pids.events`.
fn parse_flat_keyed(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let (k, v) = line.split_once(' ')?;
        if k == key {
            v.trim().parse().ok()
        } else {
            None
        }
    })
}
