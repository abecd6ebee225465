use std::path::PathBuf;

use cgroups_rs::{
    freezer::FreezerController, memory::MemController, pid::PidController, Cgroup, Hierarchy,
    Subsystem,
};

/// A cgroup v2 hierarchy rooted at an arbitrary delegated subtree.
#[derive(Debug, Clone)]
pub struct V2 {
    root: String,
}

impl From<&str> for V2 {
    fn from(path: &str) -> Self {
        Self {
            root: path.to_string(),
        }
    }
}

impl Hierarchy for V2 {
    fn v2(&self) -> bool {
        true
    }

    fn subsystems(&self) -> Vec<Subsystem> {
        let controllers =
            match std::fs::read_to_string(format!("{}/cgroup.controllers", self.root)) {
                Ok(contents) => contents.trim().to_string(),
                Err(_) => return vec![],
            };

        let mut subs = vec![];
        for controller in controllers.split(' ') {
            match controller {
                "memory" => {
                    subs.push(Subsystem::Mem(MemController::new(self.root(), true)));
                }
                "pids" => {
                    subs.push(Subsystem::Pid(PidController::new(self.root(), true)));
                }
                _ => {}
            }
        }
        // Freezing is core v2 functionality rather than a listed controller,
        // so the freezer subsystem has to be registered unconditionally.
        subs.push(Subsystem::Freezer(FreezerController::new(
            self.root(),
            true,
        )));

        subs
    }

    fn root_control_group(&self) -> Cgroup {
        Cgroup::load(Box::new(self.clone()), "".to_string())
    }

    fn root(&self) -> PathBuf {
        PathBuf::from(self.root.clone())
    }
}
