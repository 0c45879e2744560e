//! Expansion queue for nested sub-resources.

use std::collections::{HashSet, VecDeque};

use crate::models::ExpansionJob;

/// Why a job was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// No continuation token; the thread cannot be paginated
    NoToken,
    /// The parent was already queued during this run
    AlreadyQueued,
}

/// FIFO of reply-thread jobs, drained breadth-first between top-level pages.
///
/// Each parent is queued at most once per run. Jobs are not checkpointed.
#[derive(Debug, Default)]
pub struct ExpansionQueue {
    jobs: VecDeque<ExpansionJob>,
    queued_parents: HashSet<String>,
}

impl ExpansionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, job: ExpansionJob) -> Result<(), Rejected> {
        if job.continuation_token.as_deref().is_none_or(str::is_empty) {
            log::debug!("Dropping expansion for {}: no continuation token", job.parent_id);
            return Err(Rejected::NoToken);
        }
        if !self.queued_parents.insert(job.parent_id.clone()) {
            return Err(Rejected::AlreadyQueued);
        }
        self.jobs.push_back(job);
        Ok(())
    }

    /// Queue every job, returning how many were accepted.
    pub fn enqueue_all(&mut self, jobs: impl IntoIterator<Item = ExpansionJob>) -> usize {
        jobs.into_iter()
            .filter(|job| self.enqueue(job.clone()).is_ok())
            .count()
    }

    pub fn pop(&mut self) -> Option<ExpansionJob> {
        self.jobs.pop_front()
    }

    /// Drop pending jobs, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let dropped = self.jobs.len();
        self.jobs.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
