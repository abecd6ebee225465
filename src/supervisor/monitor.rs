use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;

use crate::intercept::cgroup::CgroupGate;
use crate::quota::{Accountant, QuotaKind};
use crate::reactor::Reactor;

/// The asynchronous sampling path of quota enforcement.
///
/// Memory growth has no practical synchronous gate, so the monitor polls the
/// run cgroup's accounting files at a fixed interval and hands every reading
/// to the accountant. The interval bounds the detection window between an
/// overshoot and the reactor's kill; that window is a documented limitation
/// of the memory dimension, not of the byte-exact and creation-exact ones.
pub struct Monitor {
    gate: Arc<CgroupGate>,
    accountant: Arc<Accountant>,
    reactor: Reactor,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        gate: Arc<CgroupGate>,
        accountant: Arc<Accountant>,
        reactor: Reactor,
        interval: Duration,
    ) -> Self {
        Self {
            gate,
            accountant,
            reactor,
            interval,
        }
    }

    /// Sample until told to stop, then take one final reading so nothing the
    /// tree did in its last interval goes unaccounted.
    pub async fn run(self, mut stop: oneshot::Receiver<()>) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = tick.tick() => self.sample(),
            }
        }
        self.sample();
    }

    fn sample(&self) {
        if let Some(memory) = self.gate.current_memory() {
            debug!("sample: memory {} bytes", memory.into_bytes());
            if self.accountant.check_memory(memory).is_deny() {
                self.reactor.react(QuotaKind::Memory);
            }
        }
        // The hard-limit backstop may fire between samples; its kills count
        // as memory violations all the same.
        if self.gate.oom_kills() > 0 {
            self.reactor.react(QuotaKind::Memory);
        }

        if let Some(live) = self.gate.current_pids() {
            self.accountant.observe_live(live);
        }
        let denied = self.gate.denied_forks();
        if denied > 0 {
            self.accountant.record_fork_denials(denied);
            self.reactor.record_only(QuotaKind::ProcessCount);
        }
    }
}
