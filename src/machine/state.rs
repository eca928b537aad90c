use crate::error::{Result, SchedError};
use crate::machine::sampler::UtilizationSampler;
use crate::remote::MachineIdentity;
use crate::scheduler::{Job, JobOutcome, JobStatus};

/// What occupies a machine's single job slot.
#[derive(Debug, Clone)]
pub enum JobSlot {
    Empty,
    /// Reserved by the scheduler; script transfer and launch in progress.
    Dispatching(Job),
    Running {
        job: Job,
        pid: u32,
        fetch_failures: u32,
    },
}

/// Scheduling-side view of one remote machine.
///
/// Pure state: the remote calls that feed it live in
/// [`MachineHandle`](crate::machine::MachineHandle).
#[derive(Debug)]
pub struct Machine {
    identity: MachineIdentity,
    sampler: UtilizationSampler,
    slot: JobSlot,
    pending_outputs: Vec<JobOutcome>,
}

impl Machine {
    pub fn new(identity: MachineIdentity, sampler: UtilizationSampler) -> Self {
        Self {
            identity,
            sampler,
            slot: JobSlot::Empty,
            pending_outputs: Vec::new(),
        }
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn sampler(&self) -> &UtilizationSampler {
        &self.sampler
    }

    pub fn slot(&self) -> &JobSlot {
        &self.slot
    }

    pub fn is_idle(&self) -> bool {
        self.sampler.is_idle()
    }

    pub fn record_sample(&mut self, total: u8, other: u8) {
        self.sampler.record(total, other);
    }

    /// The running job. Present exactly when [`running_process`](Self::running_process) is.
    pub fn current_job(&self) -> Option<&Job> {
        match &self.slot {
            JobSlot::Running { job, .. } => Some(job),
            _ => None,
        }
    }

    pub fn running_process(&self) -> Option<u32> {
        match &self.slot {
            JobSlot::Running { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn dispatching_job(&self) -> Option<&Job> {
        match &self.slot {
            JobSlot::Dispatching(job) => Some(job),
            _ => None,
        }
    }

    pub fn has_job(&self) -> bool {
        !matches!(self.slot, JobSlot::Empty)
    }

    pub fn can_accept_job(&self) -> bool {
        self.is_idle() && !self.has_job()
    }

    /// Claim the slot for `job`. Hands the job back if the slot is taken.
    pub fn try_reserve(&mut self, mut job: Job) -> std::result::Result<(), Job> {
        if self.has_job() {
            return Err(job);
        }
        job.status = JobStatus::Running;
        self.slot = JobSlot::Dispatching(job);
        Ok(())
    }

    pub fn mark_running(&mut self, pid: u32) -> Result<()> {
        match std::mem::replace(&mut self.slot, JobSlot::Empty) {
            JobSlot::Dispatching(job) => {
                self.slot = JobSlot::Running {
                    job,
                    pid,
                    fetch_failures: 0,
                };
                Ok(())
            }
            other => {
                self.slot = other;
                Err(SchedError::NotDispatching(self.identity.name.clone()))
            }
        }
    }

    /// Release a reservation whose launch failed.
    pub fn abort_dispatch(&mut self) -> Option<Job> {
        match std::mem::replace(&mut self.slot, JobSlot::Empty) {
            JobSlot::Dispatching(job) => Some(job),
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Count a failed log fetch for the running job and return the total.
    pub fn record_fetch_failure(&mut self) -> u32 {
        match &mut self.slot {
            JobSlot::Running { fetch_failures, .. } => {
                *fetch_failures += 1;
                *fetch_failures
            }
            _ => 0,
        }
    }

    /// Detach the running job, leaving its outcome for delivery.
    ///
    /// `result` is the captured output, or why it could not be retrieved.
    pub fn finish_job(&mut self, result: std::result::Result<String, String>) -> bool {
        match std::mem::replace(&mut self.slot, JobSlot::Empty) {
            JobSlot::Running { job, .. } => {
                let outcome = match result {
                    Ok(output) => JobOutcome::completed(job, self.identity.name.clone(), output),
                    Err(error) => JobOutcome::failed(job, self.identity.name.clone(), error),
                };
                self.pending_outputs.push(outcome);
                true
            }
            other => {
                self.slot = other;
                false
            }
        }
    }

    pub fn deposit_outcome(&mut self, outcome: JobOutcome) {
        self.pending_outputs.push(outcome);
    }

    pub fn has_pending_output(&self) -> bool {
        !self.pending_outputs.is_empty()
    }

    pub fn take_pending_outputs(&mut self) -> Vec<JobOutcome> {
        std::mem::take(&mut self.pending_outputs)
    }

    /// No job attached and nothing left to deliver.
    pub fn is_settled(&self) -> bool {
        !self.has_job() && self.pending_outputs.is_empty()
    }
}
