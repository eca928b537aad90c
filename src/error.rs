use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum SchedError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No machines available in project {0}")]
    NoMachines(String),

    #[error("Machine {0} has no job being dispatched")]
    NotDispatching(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;
