//! In-memory job registry.

use std::sync::Arc;

use dashmap::DashMap;

use super::model::Job;
use crate::{Error, Result};

/// Concurrent map from job id to its latest snapshot.
///
/// Entries are never evicted. Updates on the same id are serialized by the
/// shard lock, so readers always observe a whole record.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    jobs: Arc<DashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.insert(job.id.clone(), job);
    }

    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.get(id).map(|entry| entry.value().clone())
    }

    /// Apply `f` to the stored record and return the updated snapshot.
    ///
    /// The record is left untouched when `f` fails.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut entry = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found("job", id))?;

        let mut next = entry.value().clone();
        f(&mut next)?;
        *entry.value_mut() = next.clone();
        Ok(next)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;

    #[test]
    fn get_returns_a_snapshot() {
        let store = JobStore::new();
        store.insert(Job::new("a", "src"));

        let mut snapshot = store.get("a").unwrap();
        snapshot.progress = 99;
        assert_eq!(store.get("a").unwrap().progress, 0);
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn failed_update_leaves_record_untouched() {
        let store = JobStore::new();
        store.insert(Job::new("a", "src"));

        let err = store
            .update("a", |job| {
                job.advance(50);
                job.complete("nowhere")
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let job = store.get("a").unwrap();
        assert_eq!(job.status, JobStatus::Initializing);
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn update_of_unknown_job_is_not_found() {
        let store = JobStore::new();
        let err = store.update("nope", |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
