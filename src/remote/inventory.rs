use async_trait::async_trait;

use crate::remote::{MachineRecord, RemoteError};

/// Source of candidate GPU machines for a project.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn discover_machines(&self, project: &str) -> Result<Vec<MachineRecord>, RemoteError>;
}

/// Fixed list of machines, typically taken from the run file.
#[derive(Debug, Clone, Default)]
pub struct StaticInventory {
    machines: Vec<MachineRecord>,
}

impl StaticInventory {
    pub fn new(machines: Vec<MachineRecord>) -> Self {
        Self { machines }
    }
}

#[async_trait]
impl Inventory for StaticInventory {
    async fn discover_machines(&self, _project: &str) -> Result<Vec<MachineRecord>, RemoteError> {
        Ok(self.machines.clone())
    }
}

/// Run discovery, logging and swallowing a failed query.
///
/// A failure yields an empty list; callers treat "nothing found" and "lookup
/// failed" the same way.
pub async fn discover_or_empty(inventory: &dyn Inventory, project: &str) -> Vec<MachineRecord> {
    tracing::info!(project, "Discovering GPU machines");
    match inventory.discover_machines(project).await {
        Ok(machines) if machines.is_empty() => {
            tracing::warn!(project, "No GPU machines found");
            machines
        }
        Ok(machines) => {
            tracing::info!(project, count = machines.len(), "Discovered GPU machines");
            machines
        }
        Err(e) => {
            tracing::error!(project, error = %e, "Machine discovery failed");
            Vec::new()
        }
    }
}
