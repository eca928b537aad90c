use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::machine::{DispatchResult, MachineHandle};
use crate::scheduler::job::JobOutcome;
use crate::scheduler::queue::JobQueue;

/// Pairs idle machines with queued jobs and hands finished outcomes on.
///
/// Launches run as separate tasks so one slow machine never holds up the
/// rest of the pass.
pub struct JobAssigner {
    machines: Vec<MachineHandle>,
    queue: Arc<RwLock<JobQueue>>,
    outcomes: mpsc::Sender<JobOutcome>,
    launches: JoinSet<DispatchResult>,
}

impl JobAssigner {
    pub fn new(
        machines: Vec<MachineHandle>,
        queue: Arc<RwLock<JobQueue>>,
        outcomes: mpsc::Sender<JobOutcome>,
    ) -> Self {
        Self {
            machines,
            queue,
            outcomes,
            launches: JoinSet::new(),
        }
    }

    /// Start a launch on every idle, empty machine while jobs remain.
    /// Returns how many launches were started.
    ///
    /// Taking the job and reserving the machine happen under the machine's
    /// lock, so a job is never both queued and attached, and a machine never
    /// gets two jobs.
    pub async fn assign_pass(&mut self) -> usize {
        let mut started = 0;

        for machine in &self.machines {
            {
                let mut state = machine.state().write().await;
                if !state.can_accept_job() {
                    continue;
                }
                let mut queue = self.queue.write().await;
                let Some(job) = queue.take_oldest() else {
                    break;
                };
                tracing::info!(
                    machine = %machine.name(),
                    job_id = %job.id,
                    script = %job.script_name(),
                    "Assigning job"
                );
                if let Err(job) = state.try_reserve(job) {
                    queue.requeue(job);
                    continue;
                }
            }

            let machine = machine.clone();
            let queue = self.queue.clone();
            self.launches
                .spawn(async move { machine.launch(&queue).await });
            started += 1;
        }

        started
    }

    /// Move every waiting outcome off its machine and send it on.
    pub async fn deliver_outcomes(&self) -> usize {
        let mut delivered = 0;
        for machine in &self.machines {
            let outcomes = machine.state().write().await.take_pending_outputs();
            for outcome in outcomes {
                tracing::info!(
                    machine = %machine.name(),
                    job_id = %outcome.job.id,
                    status = %outcome.status,
                    "Delivering job outcome"
                );
                if self.outcomes.send(outcome).await.is_err() {
                    tracing::warn!(machine = %machine.name(), "Outcome receiver dropped, outcome discarded");
                }
                delivered += 1;
            }
        }
        delivered
    }

    /// One scheduling tick: assignment first, then delivery.
    pub async fn tick(&mut self) {
        self.assign_pass().await;
        while let Some(result) = self.launches.try_join_next() {
            Self::note_launch(result);
        }
        self.deliver_outcomes().await;
    }

    /// Tick every `interval` until `token` is cancelled, then wait for
    /// launches still in flight.
    pub async fn run(mut self, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }

        while let Some(result) = self.launches.join_next().await {
            Self::note_launch(result);
        }
        tracing::debug!("Scheduling stopped");
    }

    fn note_launch(result: Result<DispatchResult, JoinError>) {
        match result {
            Ok(DispatchResult::NotReserved) => {
                tracing::warn!("Launch found no reserved job");
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Launch task failed"),
        }
    }
}
