use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::machine::MachineHandle;

/// Per-machine loop that notices finished jobs and samples utilization.
pub struct MachinePoller {
    machine: MachineHandle,
    interval: Duration,
}

impl MachinePoller {
    pub fn new(machine: MachineHandle, interval: Duration) -> Self {
        Self { machine, interval }
    }

    /// One cycle. Completion goes first so a finished job no longer counts
    /// against the sample taken right after it.
    pub async fn poll_once(&self) {
        self.machine.poll_completion().await;
        self.machine.refresh_utilization().await;
    }

    /// Poll until `token` is cancelled. An in-flight cycle always finishes.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            self.poll_once().await;
        }

        tracing::debug!(machine = %self.machine.name(), "Polling stopped");
    }
}
