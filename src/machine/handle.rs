use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::SchedulerConfig;
use crate::machine::sampler::UtilizationSampler;
use crate::machine::state::Machine;
use crate::remote::{shell_quote, MachineIdentity, RemoteError, RemoteHost};
use crate::scheduler::{Job, JobOutcome, JobQueue};

/// How a dispatch attempt ended.
#[derive(Debug)]
pub enum DispatchResult {
    Launched { pid: u32 },
    /// The machine already had a job; the job is handed back untouched.
    Rejected(Job),
    /// Transfer or launch failed and the job went back on the queue.
    Requeued { error: String },
    /// Transfer or launch failed too often; a failed outcome awaits delivery.
    Abandoned { error: String },
    /// Nothing was reserved on the machine.
    NotReserved,
}

/// Shared handle to one machine: its state plus the remote it lives behind.
///
/// The state lock is only held between remote calls, never across one.
#[derive(Clone)]
pub struct MachineHandle {
    name: String,
    state: Arc<RwLock<Machine>>,
    remote: Arc<dyn RemoteHost>,
    config: Arc<SchedulerConfig>,
}

impl std::fmt::Debug for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl MachineHandle {
    pub fn new(
        identity: MachineIdentity,
        remote: Arc<dyn RemoteHost>,
        config: Arc<SchedulerConfig>,
    ) -> Self {
        let sampler = UtilizationSampler::from_config(&config);
        Self {
            name: identity.name.clone(),
            state: Arc::new(RwLock::new(Machine::new(identity, sampler))),
            remote,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &Arc<RwLock<Machine>> {
        &self.state
    }

    fn remote_path(&self, file_name: &str) -> String {
        format!(
            "{}/{}",
            self.config.remote_work_dir.trim_end_matches('/'),
            file_name
        )
    }

    /// Take one utilization sample and recompute idleness.
    ///
    /// Returns false when the sample was skipped; the histories are then
    /// left exactly as they were.
    pub async fn refresh_utilization(&self) -> bool {
        let pid = self.state.read().await.running_process();

        let readings = match self.remote.query_utilization().await {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!(machine = %self.name, error = %e, "Utilization query failed, sample skipped");
                return false;
            }
        };
        let Some(total) = readings.iter().copied().max() else {
            tracing::warn!(machine = %self.name, "Utilization query returned no GPUs, sample skipped");
            return false;
        };

        let other = match pid {
            Some(pid) => {
                let shares = self.job_utilization(pid, readings.len()).await;
                readings
                    .iter()
                    .zip(&shares)
                    .map(|(&reading, &share)| reading.saturating_sub(share))
                    .max()
                    .unwrap_or(total)
            }
            None => total,
        };

        let mut state = self.state.write().await;
        state.record_sample(total, other);
        tracing::debug!(
            machine = %self.name,
            total,
            other,
            idle = state.is_idle(),
            "Utilization sampled"
        );
        true
    }

    /// Utilization of `pid` and its descendants on each of `gpus` GPUs.
    /// Anything that cannot be attributed counts as zero, which leaves it
    /// in "other".
    async fn job_utilization(&self, pid: u32, gpus: usize) -> Vec<u8> {
        let mut tree: HashSet<u32> = match self.remote.list_child_processes(pid).await {
            Ok(children) => children.into_iter().collect(),
            Err(e) => {
                tracing::debug!(machine = %self.name, pid, error = %e, "Could not list job child processes");
                HashSet::new()
            }
        };
        tree.insert(pid);

        let mut shares = vec![0u32; gpus];
        match self.remote.query_process_utilization().await {
            Ok(per_process) => {
                for usage in per_process.iter().filter(|u| tree.contains(&u.pid)) {
                    if let Some(share) = shares.get_mut(usage.gpu) {
                        *share += u32::from(usage.sm);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(machine = %self.name, pid, error = %e, "Per-process utilization unavailable");
            }
        }
        shares.into_iter().map(|share| share.min(100) as u8).collect()
    }

    /// Check whether the running job's process has exited and, if so,
    /// collect its log. Returns true when the job left the machine.
    pub async fn poll_completion(&self) -> bool {
        let (pid, job) = {
            let state = self.state.read().await;
            match (state.running_process(), state.current_job()) {
                (Some(pid), Some(job)) => (pid, job.clone()),
                _ => return false,
            }
        };

        match self.remote.is_process_alive(pid).await {
            Ok(true) => return false,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(machine = %self.name, pid, error = %e, "Completion check failed");
                return false;
            }
        }

        tracing::info!(machine = %self.name, job_id = %job.id, pid, "Job process exited, collecting output");
        let remote_log = self.remote_path(&job.log_file_name());
        let remote_script = self.remote_path(&job.script_name());

        match self.fetch_output(&remote_log, &job).await {
            Ok(output) => {
                self.cleanup(&[remote_log.as_str(), remote_script.as_str()])
                    .await;
                self.state.write().await.finish_job(Ok(output));
                tracing::info!(machine = %self.name, job_id = %job.id, "Job completed");
                true
            }
            Err(e) => {
                let failures = self.state.write().await.record_fetch_failure();
                if failures < self.config.max_fetch_attempts {
                    tracing::warn!(
                        machine = %self.name,
                        job_id = %job.id,
                        attempt = failures,
                        error = %e,
                        "Could not fetch job output, will retry"
                    );
                    return false;
                }
                tracing::error!(machine = %self.name, job_id = %job.id, error = %e, "Giving up on job output");
                self.cleanup(&[remote_log.as_str(), remote_script.as_str()])
                    .await;
                self.state.write().await.finish_job(Err(format!(
                    "output unavailable after {failures} attempts: {e}"
                )));
                true
            }
        }
    }

    async fn fetch_output(&self, remote_log: &str, job: &Job) -> Result<String, RemoteError> {
        let local: PathBuf = self.config.staging_dir.join(job.log_file_name());
        self.remote.copy_file_from(remote_log, &local).await?;
        let output = tokio::fs::read_to_string(&local).await?;
        if let Err(e) = tokio::fs::remove_file(&local).await {
            tracing::warn!(path = %local.display(), error = %e, "Could not remove staged log");
        }
        Ok(output)
    }

    async fn cleanup(&self, paths: &[&str]) {
        for path in paths {
            if let Err(e) = self.remote.remove_remote_file(path).await {
                tracing::warn!(machine = %self.name, path, error = %e, "Remote cleanup failed");
            }
        }
    }

    /// Reserve this machine for `job` and launch it.
    pub async fn dispatch(&self, job: Job, queue: &RwLock<JobQueue>) -> DispatchResult {
        if let Err(job) = self.state.write().await.try_reserve(job) {
            return DispatchResult::Rejected(job);
        }
        self.launch(queue).await
    }

    /// Transfer and start the job already reserved on this machine.
    pub async fn launch(&self, queue: &RwLock<JobQueue>) -> DispatchResult {
        let Some(job) = self.state.read().await.dispatching_job().cloned() else {
            return DispatchResult::NotReserved;
        };

        match self.transfer_and_start(&job).await {
            Ok(pid) => {
                if let Err(e) = self.state.write().await.mark_running(pid) {
                    tracing::error!(machine = %self.name, job_id = %job.id, error = %e, "Lost track of launched job");
                    return DispatchResult::NotReserved;
                }
                tracing::info!(
                    machine = %self.name,
                    job_id = %job.id,
                    script = %job.script_name(),
                    pid,
                    "Job launched"
                );
                DispatchResult::Launched { pid }
            }
            Err(e) => self.dispatch_failed(&job, e, queue).await,
        }
    }

    async fn transfer_and_start(&self, job: &Job) -> Result<u32, RemoteError> {
        let remote_script = self.remote_path(&job.script_name());
        let remote_log = self.remote_path(&job.log_file_name());

        self.remote
            .copy_file_to(&job.script_path, &remote_script)
            .await?;

        let command = format!(
            "{} {} > {} 2>&1",
            self.config.interpreter,
            shell_quote(&remote_script),
            shell_quote(&remote_log)
        );
        self.remote
            .launch_background(&command, job.timeout_secs)
            .await
    }

    async fn dispatch_failed(
        &self,
        job: &Job,
        error: RemoteError,
        queue: &RwLock<JobQueue>,
    ) -> DispatchResult {
        let remote_script = self.remote_path(&job.script_name());
        self.cleanup(&[remote_script.as_str()]).await;

        let mut state = self.state.write().await;
        let Some(mut job) = state.abort_dispatch() else {
            return DispatchResult::NotReserved;
        };
        job.attempts += 1;
        let error = error.to_string();

        if job.attempts < self.config.max_dispatch_attempts {
            tracing::warn!(
                machine = %self.name,
                job_id = %job.id,
                attempt = job.attempts,
                error = %error,
                "Dispatch failed, job requeued"
            );
            queue.write().await.requeue(job);
            DispatchResult::Requeued { error }
        } else {
            tracing::error!(
                machine = %self.name,
                job_id = %job.id,
                attempts = job.attempts,
                error = %error,
                "Dispatch failed, job abandoned"
            );
            let attempts = job.attempts;
            state.deposit_outcome(JobOutcome::failed(
                job,
                self.name.clone(),
                format!("dispatch failed after {attempts} attempts: {error}"),
            ));
            DispatchResult::Abandoned { error }
        }
    }
}
