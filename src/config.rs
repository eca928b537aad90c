use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::remote::MachineRecord;

/// Tuning knobs for sampling, idle detection and dispatch.
///
/// Every field has a default, so a run file only needs to name the values it
/// wants to change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of samples kept per utilization history.
    pub history_capacity: usize,
    /// How many of the most recent "other" samples must sit below the ceiling.
    pub idle_window: usize,
    /// A sample at or above this percentage counts as busy.
    pub utilization_ceiling: u8,
    pub poll_interval_ms: u64,
    pub schedule_interval_ms: u64,
    pub status_interval_ms: u64,
    /// Directory on the remote machine for scripts and logs.
    pub remote_work_dir: String,
    /// Interpreter used to launch scripts remotely.
    pub interpreter: String,
    /// Local directory where fetched logs are staged before reading.
    pub staging_dir: PathBuf,
    /// Transfer/launch attempts before a job is abandoned.
    pub max_dispatch_attempts: u32,
    /// Log fetch attempts after the remote process has exited.
    pub max_fetch_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 120,
            idle_window: 1,
            utilization_ceiling: 20,
            poll_interval_ms: 5000,
            schedule_interval_ms: 5000,
            status_interval_ms: 5000,
            remote_work_dir: "/tmp".to_string(),
            interpreter: "/opt/python/3.10/bin/python".to_string(),
            staging_dir: PathBuf::from("."),
            max_dispatch_attempts: 3,
            max_fetch_attempts: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Reject settings that would make idle detection or the loops meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.history_capacity == 0 {
            return Err(SchedError::Config(
                "history_capacity must be at least 1".to_string(),
            ));
        }
        if self.idle_window == 0 || self.idle_window > self.history_capacity {
            return Err(SchedError::Config(format!(
                "idle_window must be between 1 and history_capacity ({}), got {}",
                self.history_capacity, self.idle_window
            )));
        }
        if self.utilization_ceiling == 0 || self.utilization_ceiling > 100 {
            return Err(SchedError::Config(format!(
                "utilization_ceiling must be between 1 and 100, got {}",
                self.utilization_ceiling
            )));
        }
        if self.poll_interval_ms == 0
            || self.schedule_interval_ms == 0
            || self.status_interval_ms == 0
        {
            return Err(SchedError::Config(
                "loop intervals must be non-zero".to_string(),
            ));
        }
        if self.max_dispatch_attempts == 0 || self.max_fetch_attempts == 0 {
            return Err(SchedError::Config(
                "attempt limits must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// One unit of work as written in the run file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub script_path: PathBuf,
    /// Seconds the remote `timeout` wrapper allows the script to run.
    pub timeout: u64,
}

/// Contents of the JSON run file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub project_id: String,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
    /// Single-job shorthand, used together with `timeout`.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default)]
    pub timeout: Option<u64>,
    /// When non-empty, these machines are used instead of discovery.
    #[serde(default)]
    pub machines: Vec<MachineRecord>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl RunConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SchedError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(raw)?;
        if config.project_id.trim().is_empty() {
            return Err(SchedError::Config("project_id must not be empty".to_string()));
        }
        config.scheduler.validate()?;
        config.job_specs()?;
        Ok(config)
    }

    /// All jobs named by the file, the single-job shorthand first.
    pub fn job_specs(&self) -> Result<Vec<JobSpec>> {
        let mut specs = Vec::with_capacity(self.jobs.len() + 1);
        match (&self.script_path, self.timeout) {
            (Some(script_path), Some(timeout)) => specs.push(JobSpec {
                script_path: script_path.clone(),
                timeout,
            }),
            (None, None) => {}
            _ => {
                return Err(SchedError::Config(
                    "script_path and timeout must be given together".to_string(),
                ))
            }
        }
        specs.extend(self.jobs.iter().cloned());

        if specs.is_empty() {
            return Err(SchedError::Config("no jobs to run".to_string()));
        }
        for spec in &specs {
            if spec.timeout == 0 {
                return Err(SchedError::Config(format!(
                    "job {} has a zero timeout",
                    spec.script_path.display()
                )));
            }
            if spec.script_path.file_name().is_none() {
                return Err(SchedError::Config(format!(
                    "job script path {:?} has no file name",
                    spec.script_path
                )));
            }
        }
        Ok(specs)
    }
}
