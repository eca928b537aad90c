use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::machine::{MachineHandle, MachinePoller};
use crate::remote::{MachineIdentity, RemoteHost};
use crate::scheduler::{Job, JobAssigner, JobOutcome, JobQueue};
use crate::status::{OutputFormat, StatusReport};

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// The stop signal fired before every job was done.
    pub interrupted: bool,
    /// Jobs still queued or attached to a machine when the run stopped.
    pub unfinished_jobs: usize,
}

/// Owns the machines and the queue and runs every loop over them.
pub struct Controller {
    pub config: Arc<SchedulerConfig>,
    pub machines: Vec<MachineHandle>,
    pub job_queue: Arc<RwLock<JobQueue>>,
    status_output: Option<OutputFormat>,
}

impl Controller {
    pub fn new(config: SchedulerConfig, machines: Vec<MachineHandle>) -> Self {
        Self {
            config: Arc::new(config),
            machines,
            job_queue: Arc::new(RwLock::new(JobQueue::new())),
            status_output: None,
        }
    }

    /// Build a controller with one machine per `(identity, remote)` pair.
    pub fn with_remotes(
        config: SchedulerConfig,
        remotes: Vec<(MachineIdentity, Arc<dyn RemoteHost>)>,
    ) -> Self {
        let config = Arc::new(config);
        let machines = remotes
            .into_iter()
            .map(|(identity, remote)| MachineHandle::new(identity, remote, config.clone()))
            .collect();
        Self {
            config,
            machines,
            job_queue: Arc::new(RwLock::new(JobQueue::new())),
            status_output: None,
        }
    }

    /// Print a status report to stdout on every status tick.
    pub fn with_status_output(mut self, format: OutputFormat) -> Self {
        self.status_output = Some(format);
        self
    }

    /// Queue a job. Returns false if the queue is full.
    pub async fn submit(&self, job: Job) -> bool {
        let job_id = job.id;
        let script = job.script_name();
        let accepted = self.job_queue.write().await.enqueue(job);
        if accepted {
            tracing::info!(job_id = %job_id, script, "Job queued");
        } else {
            tracing::warn!(job_id = %job_id, script, "Job queue at capacity, job dropped");
        }
        accepted
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport::collect(&self.machines, &self.job_queue).await
    }

    /// True once the queue is empty, no machine holds a job and every
    /// outcome has been delivered.
    ///
    /// All machine locks are taken before the queue lock (the same order the
    /// scheduler uses), so a job moving between queue and machine can't slip
    /// past the check.
    pub async fn is_finished(&self) -> bool {
        let mut states = Vec::with_capacity(self.machines.len());
        for machine in &self.machines {
            states.push(machine.state().read().await);
        }
        if states.iter().any(|state| !state.is_settled()) {
            return false;
        }
        self.job_queue.read().await.is_empty()
    }

    async fn unfinished_jobs(&self) -> usize {
        let mut count = self.job_queue.read().await.len();
        for machine in &self.machines {
            if machine.state().read().await.has_job() {
                count += 1;
            }
        }
        count
    }

    /// Run polling, scheduling and status loops until every job is done or
    /// `shutdown` fires.
    ///
    /// This is the main entry point:
    /// 1. Spawns one polling loop per machine
    /// 2. Spawns the scheduling loop, which sends finished outcomes to `outcomes`
    /// 3. Runs the status loop here, which also checks for completion
    ///
    /// On exit every loop is cancelled and awaited. In-flight remote calls
    /// are allowed to finish.
    pub async fn run(
        self,
        outcomes: mpsc::Sender<JobOutcome>,
        shutdown: CancellationToken,
    ) -> RunSummary {
        let token = shutdown.child_token();
        let mut handles = Vec::with_capacity(self.machines.len() + 1);

        tracing::info!(
            machines = self.machines.len(),
            jobs = self.job_queue.read().await.len(),
            "Starting run"
        );

        for machine in &self.machines {
            let poller = MachinePoller::new(machine.clone(), self.config.poll_interval());
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                poller.run(token).await;
            }));
        }

        let assigner = JobAssigner::new(self.machines.clone(), self.job_queue.clone(), outcomes);
        let schedule_interval = self.config.schedule_interval();
        let scheduler_token = token.clone();
        handles.push(tokio::spawn(async move {
            assigner.run(schedule_interval, scheduler_token).await;
        }));

        let mut ticker = tokio::time::interval(self.config.status_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interrupted = loop {
            tokio::select! {
                _ = token.cancelled() => break true,
                _ = ticker.tick() => {}
            }

            let report = self.status().await;
            match self.status_output.map(|format| report.render(format)) {
                Some(Ok(rendered)) => println!("{rendered}"),
                Some(Err(e)) => tracing::warn!(error = %e, "Could not render status"),
                None => tracing::debug!(
                    pending = report.pending.len(),
                    busy = report.machines.iter().filter(|m| m.script.is_some()).count(),
                    "Status"
                ),
            }

            if self.is_finished().await {
                tracing::info!("All jobs completed");
                break false;
            }
        };

        token.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Loop task failed");
            }
        }

        let unfinished_jobs = self.unfinished_jobs().await;
        if interrupted {
            tracing::warn!(unfinished_jobs, "Run interrupted");
        }
        RunSummary {
            interrupted,
            unfinished_jobs,
        }
    }
}
