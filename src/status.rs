//! Periodic human-readable status: one row per machine, one per pending job.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::machine::{JobSlot, MachineHandle};
use crate::scheduler::{JobOutcome, JobQueue};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineStatus {
    pub name: String,
    pub zone: String,
    pub idle: bool,
    /// Script currently dispatching or running, if any.
    pub script: Option<String>,
    pub dispatching: bool,
    pub last_total: Option<u8>,
    pub last_other: Option<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingJobStatus {
    pub script: String,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub machines: Vec<MachineStatus>,
    pub pending: Vec<PendingJobStatus>,
}

impl StatusReport {
    pub async fn collect(machines: &[MachineHandle], queue: &RwLock<JobQueue>) -> Self {
        let mut rows = Vec::with_capacity(machines.len());
        for machine in machines {
            let state = machine.state().read().await;
            let (script, dispatching) = match state.slot() {
                JobSlot::Empty => (None, false),
                JobSlot::Dispatching(job) => (Some(job.script_name()), true),
                JobSlot::Running { job, .. } => (Some(job.script_name()), false),
            };
            rows.push(MachineStatus {
                name: state.name().to_string(),
                zone: state.identity().zone.clone(),
                idle: state.is_idle(),
                script,
                dispatching,
                last_total: state.sampler().last_total(),
                last_other: state.sampler().last_other(),
            });
        }

        let pending = queue
            .read()
            .await
            .peek_all()
            .into_iter()
            .map(|job| PendingJobStatus {
                script: job.script_name(),
                timeout_secs: job.timeout_secs,
                attempts: job.attempts,
                submitted_at: job.submitted_at(),
            })
            .collect();

        Self {
            generated_at: Utc::now(),
            machines: rows,
            pending,
        }
    }

    /// JSON output is one compact line, so periodic reports form a
    /// newline-delimited stream.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Table => Ok(self.render_table()),
            OutputFormat::Json => Ok(serde_json::to_string(self)?),
        }
    }

    pub fn render_table(&self) -> String {
        let mut out = String::new();
        out.push_str("--- Status ---\n");
        out.push_str(&format!(
            "{:<24} {:<8} {:>6} {:>6}  SCRIPT\n",
            "MACHINE", "STATE", "TOTAL", "OTHER"
        ));
        for m in &self.machines {
            let state = if m.idle { "Idle" } else { "Active" };
            let script = match (&m.script, m.dispatching) {
                (Some(s), true) => format!("{s} (dispatching)"),
                (Some(s), false) => s.clone(),
                (None, _) => "N/A".to_string(),
            };
            out.push_str(&format!(
                "{:<24} {:<8} {:>6} {:>6}  {}\n",
                m.name,
                state,
                percent(m.last_total),
                percent(m.last_other),
                script
            ));
        }

        if self.pending.is_empty() {
            out.push_str("No jobs in queue.\n");
        } else {
            out.push_str(&format!("Pending jobs ({}):\n", self.pending.len()));
            for job in &self.pending {
                out.push_str(&format!("  {} (Timeout: {}s)", job.script, job.timeout_secs));
                if job.attempts > 0 {
                    out.push_str(&format!(" [retry {}]", job.attempts));
                }
                out.push('\n');
            }
        }
        out
    }
}

/// A delivered outcome as printed in JSON mode.
#[derive(Debug, Serialize)]
pub struct OutcomeRecord<'a> {
    pub job_id: String,
    pub script: String,
    pub machine: &'a str,
    pub status: String,
    pub output: Option<&'a str>,
    pub error: Option<&'a str>,
}

impl<'a> OutcomeRecord<'a> {
    pub fn new(outcome: &'a JobOutcome) -> Self {
        Self {
            job_id: outcome.job.id.to_string(),
            script: outcome.job.script_name(),
            machine: &outcome.machine,
            status: outcome.status.to_string(),
            output: outcome.output.as_deref(),
            error: outcome.error.as_deref(),
        }
    }

    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn percent(value: Option<u8>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v}%"))
}
