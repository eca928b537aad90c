use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::scheduler::job::{Job, JobStatus};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Pending jobs ordered by submission time, ties broken by insertion order.
///
/// Shared as `Arc<RwLock<JobQueue>>`; each method is one critical section, so
/// a snapshot never sees a job twice or misses one.
#[derive(Debug)]
pub struct JobQueue {
    jobs: BTreeMap<(DateTime<Utc>, u64), Job>,
    next_sequence: u64,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_sequence: 0,
            max_jobs,
        }
    }

    /// Add a new job. Returns false if the queue is at capacity.
    pub fn enqueue(&mut self, job: Job) -> bool {
        if self.jobs.len() >= self.max_jobs {
            return false;
        }
        self.insert(job);
        true
    }

    /// Put back a job that failed to dispatch.
    ///
    /// Ignores the capacity limit and keeps the job's original position.
    pub fn requeue(&mut self, job: Job) {
        self.insert(job);
    }

    fn insert(&mut self, mut job: Job) {
        let sequence = match job.sequence {
            Some(seq) => seq,
            None => {
                let seq = self.next_sequence;
                self.next_sequence += 1;
                job.sequence = Some(seq);
                seq
            }
        };
        job.status = JobStatus::Pending;
        self.jobs.insert((job.submitted_at(), sequence), job);
    }

    /// Remove and return the earliest-submitted job.
    pub fn take_oldest(&mut self) -> Option<Job> {
        self.jobs.pop_first().map(|(_, job)| job)
    }

    /// Copy of every pending job, oldest first. The queue is left untouched.
    pub fn peek_all(&self) -> Vec<Job> {
        self.jobs.values().cloned().collect()
    }

    /// Returns the current number of jobs in the queue
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.jobs.len() >= self.max_jobs
    }
}
