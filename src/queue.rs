use std::collections::VecDeque;

use crate::{FabricatorId, JobId, QueueError, SharedJob};

/// FIFO of jobs bound to exactly one Fabricator.
///
/// Ids are cached next to each entry so lookups never need to lock a job.
/// The queue itself is not synchronized; the owning Fabricator keeps it
/// behind a lock.
#[derive(Debug)]
pub struct JobQueue {
    fabricator_id: FabricatorId,
    entries: VecDeque<(JobId, SharedJob)>,
}

impl JobQueue {
    /// Create an empty queue for `fabricator_id`.
    pub fn new(fabricator_id: FabricatorId) -> Self {
        Self {
            fabricator_id,
            entries: VecDeque::new(),
        }
    }

    /// Fabricator this queue belongs to.
    pub fn fabricator_id(&self) -> FabricatorId {
        self.fabricator_id
    }

    /// Whether a job with `job_id` is queued.
    pub fn job_exists(&self, job_id: JobId) -> bool {
        self.entries.iter().any(|(id, _)| *id == job_id)
    }

    /// Append `job` unless a job with the same id is already queued.
    /// Returns whether it was added.
    pub fn add_to_back(&mut self, job_id: JobId, job: SharedJob) -> bool {
        if self.job_exists(job_id) {
            tracing::debug!(job_id = job_id.0, "job already queued; not adding");
            return false;
        }
        self.entries.push_back((job_id, job));
        true
    }

    /// Remove the job with `job_id`, wherever it sits.
    pub fn remove_by_id(&mut self, job_id: JobId) -> Result<SharedJob, QueueError> {
        let idx = self
            .entries
            .iter()
            .position(|(id, _)| *id == job_id)
            .ok_or(QueueError::UnknownJob(job_id))?;
        self.entries
            .remove(idx)
            .map(|(_, job)| job)
            .ok_or(QueueError::UnknownJob(job_id))
    }

    /// The next job, without removing it.
    pub fn peek(&self) -> Option<&SharedJob> {
        self.entries.front().map(|(_, job)| job)
    }

    /// Remove and return the next job.
    pub fn pop(&mut self) -> Option<SharedJob> {
        self.entries.pop_front().map(|(_, job)| job)
    }

    /// Ids in queue order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
