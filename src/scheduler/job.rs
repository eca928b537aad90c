use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A script to run on some idle machine.
///
/// `submitted_at` is fixed at construction and is the queue's ordering key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub script_path: PathBuf,
    pub timeout_secs: u64,
    submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    /// Failed transfer/launch attempts so far.
    pub attempts: u32,
    /// Queue insertion number, assigned on first enqueue and kept across requeues.
    #[serde(skip)]
    pub(crate) sequence: Option<u64>,
}

impl Job {
    pub fn new(script_path: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self::with_submitted_at(script_path, timeout_secs, Utc::now())
    }

    pub fn with_submitted_at(
        script_path: impl Into<PathBuf>,
        timeout_secs: u64,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            script_path: script_path.into(),
            timeout_secs,
            submitted_at,
            status: JobStatus::Pending,
            attempts: 0,
            sequence: None,
        }
    }

    pub fn from_spec(spec: &JobSpec) -> Self {
        Self::new(spec.script_path.clone(), spec.timeout)
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// File name of the script, e.g. `train.py`.
    pub fn script_name(&self) -> String {
        file_name_or_path(&self.script_path)
    }

    /// Name of the log the remote run writes, unique per job.
    pub fn log_file_name(&self) -> String {
        let stem = self
            .script_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "job".to_string());
        let short_id = self.id.simple().to_string();
        format!(
            "{}_{}_{}.log",
            stem,
            self.submitted_at.timestamp(),
            &short_id[..8]
        )
    }
}

fn file_name_or_path(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// What came of a job once it left its machine.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job: Job,
    pub machine: String,
    pub status: JobStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl JobOutcome {
    pub fn completed(mut job: Job, machine: impl Into<String>, output: String) -> Self {
        job.status = JobStatus::Completed;
        Self {
            job,
            machine: machine.into(),
            status: JobStatus::Completed,
            output: Some(output),
            error: None,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(mut job: Job, machine: impl Into<String>, error: impl Into<String>) -> Self {
        job.status = JobStatus::Failed;
        Self {
            job,
            machine: machine.into(),
            status: JobStatus::Failed,
            output: None,
            error: Some(error.into()),
            finished_at: Utc::now(),
        }
    }
}
