//! Narrow interfaces to everything outside the scheduling core.
//!
//! The scheduler never shells out directly. It talks to machines through
//! [`RemoteHost`] and finds them through [`Inventory`]:
//! - **RemoteHost**: utilization queries, process liveness, file transfer and
//!   background launch on one machine
//! - **Inventory**: lists the GPU machines available in a project
//!
//! [`gcloud`] provides the production implementations on top of the `gcloud`
//! CLI. Every call returns a typed [`RemoteError`] on failure so callers can
//! log and carry on with the next tick.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gcloud;
pub mod inventory;

pub use gcloud::{GcloudInventory, GcloudRemote};
pub use inventory::{Inventory, StaticInventory};

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("unparsable {what}: {raw:?}")]
    Parse { what: &'static str, raw: String },

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    pub fn parse(what: &'static str, raw: impl Into<String>) -> Self {
        RemoteError::Parse {
            what,
            raw: raw.into(),
        }
    }
}

/// A machine as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub name: String,
    pub address: String,
    pub zone: String,
}

/// Full addressing tuple for one machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineIdentity {
    pub name: String,
    pub address: String,
    pub zone: String,
    pub project: String,
}

impl MachineIdentity {
    pub fn new(record: MachineRecord, project: impl Into<String>) -> Self {
        Self {
            name: record.name,
            address: record.address,
            zone: record.zone,
            project: project.into(),
        }
    }
}

impl std::fmt::Display for MachineIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.zone)
    }
}

/// GPU busy percentage of one process on one GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUsage {
    /// Index into the readings returned by [`RemoteHost::query_utilization`].
    pub gpu: usize,
    pub pid: u32,
    pub sm: u8,
}

/// Single-quote `raw` for a POSIX shell.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Operations the scheduler needs on a single remote machine.
///
/// Utilization values are GPU busy percentages in `0..=100`. Process ids
/// refer to the remote machine's process table.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// One reading per GPU, in GPU index order. Never empty on success.
    async fn query_utilization(&self) -> Result<Vec<u8>, RemoteError>;

    async fn is_process_alive(&self, pid: u32) -> Result<bool, RemoteError>;

    /// Every descendant of `pid`, not just its direct children.
    async fn list_child_processes(&self, pid: u32) -> Result<Vec<u32>, RemoteError>;

    async fn query_process_utilization(&self) -> Result<Vec<ProcessUsage>, RemoteError>;

    async fn copy_file_to(&self, local: &Path, remote: &str) -> Result<(), RemoteError>;

    async fn copy_file_from(&self, remote: &str, local: &Path) -> Result<(), RemoteError>;

    /// Start `command` detached under a `timeout_secs` limit and return its pid.
    async fn launch_background(&self, command: &str, timeout_secs: u64)
        -> Result<u32, RemoteError>;

    async fn remove_remote_file(&self, path: &str) -> Result<(), RemoteError>;
}
