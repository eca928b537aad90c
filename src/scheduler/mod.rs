pub mod assigner;
pub mod job;
pub mod queue;

pub use assigner::JobAssigner;
pub use job::{Job, JobOutcome, JobStatus};
pub use queue::JobQueue;
