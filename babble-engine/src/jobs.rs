//! Training job records and the storage-backed job registry.
//!
//! Job state lives in the storage collaborator, not in process memory, so
//! records survive restarts and concurrent access is mediated by the
//! store's atomicity guarantees. The registry is the only writer; readers
//! go through [`JobRegistry::get`] / [`JobRegistry::list`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::storage::{Store, now_unix};

/// Lifecycle of a training job.
///
/// `Queued → Running → {Success | Error}`, with `Paused` reachable from
/// `Running` and returning to it on resume. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }
}

/// One training job record, retained after completion for history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: String,
    pub status: JobStatus,
    /// Fractional progress, 0–100. Non-decreasing while running.
    pub progress: u8,
    /// Human-readable phase message.
    pub message: String,
    /// Error detail; present and non-empty exactly when status is Error.
    pub error: Option<String>,
    /// Ingestion block size used by this job.
    pub block_size: usize,
    /// Neural training epochs requested.
    pub epochs: usize,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Get/set/list access to job records, backed by the store.
pub struct JobRegistry {
    store: Arc<dyn Store>,
    seq: AtomicU64,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            seq: AtomicU64::new(1),
        }
    }

    /// Create a queued job record and persist it.
    pub fn create(&self, block_size: usize, epochs: usize) -> Result<TrainingJob> {
        let now = now_unix();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let job = TrainingJob {
            id: format!("job-{now}-{seq:04}"),
            status: JobStatus::Queued,
            progress: 0,
            message: "Queued".to_string(),
            error: None,
            block_size,
            epochs,
            created_at: now,
            updated_at: now,
        };
        self.store.put_job(&job)?;
        Ok(job)
    }

    pub fn get(&self, id: &str) -> Result<Option<TrainingJob>> {
        Ok(self.store.get_job(id)?)
    }

    pub fn list(&self) -> Result<Vec<TrainingJob>> {
        Ok(self.store.list_jobs()?)
    }

    /// Apply a mutation to a job record and persist it.
    ///
    /// Enforces the record invariants regardless of what the closure does:
    /// terminal jobs are immutable, progress never decreases, and an Error
    /// status always carries a non-empty detail string.
    pub fn update<F>(&self, id: &str, mutate: F) -> Result<TrainingJob>
    where
        F: FnOnce(&mut TrainingJob),
    {
        let Some(mut job) = self.store.get_job(id)? else {
            return Err(EngineError::InvalidArgument(format!(
                "unknown job id '{id}'"
            )));
        };
        if job.status.is_terminal() {
            return Err(EngineError::InvalidArgument(format!(
                "job '{id}' is already terminal ({:?})",
                job.status
            )));
        }

        let floor = job.progress;
        mutate(&mut job);
        job.progress = job.progress.max(floor).min(100);
        if job.status == JobStatus::Error && job.error.as_deref().unwrap_or("").is_empty() {
            job.error = Some(job.message.clone());
        }
        job.updated_at = now_unix();

        self.store.put_job(&job)?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_create_and_get() {
        let reg = registry();
        let job = reg.create(1000, 3).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.progress, 0);

        let loaded = reg.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.epochs, 3);
        assert!(reg.get("job-0-9999").unwrap().is_none());
    }

    #[test]
    fn test_progress_never_decreases() {
        let reg = registry();
        let job = reg.create(1000, 1).unwrap();
        reg.update(&job.id, |j| {
            j.status = JobStatus::Running;
            j.progress = 40;
        })
        .unwrap();

        let after = reg.update(&job.id, |j| j.progress = 10).unwrap();
        assert_eq!(after.progress, 40);

        let after = reg.update(&job.id, |j| j.progress = 55).unwrap();
        assert_eq!(after.progress, 55);
    }

    #[test]
    fn test_terminal_jobs_immutable() {
        let reg = registry();
        let job = reg.create(1000, 1).unwrap();
        reg.update(&job.id, |j| {
            j.status = JobStatus::Success;
            j.progress = 100;
        })
        .unwrap();

        let err = reg.update(&job.id, |j| j.progress = 0);
        assert!(matches!(err, Err(EngineError::InvalidArgument(_))));

        let stored = reg.get(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Success);
        assert_eq!(stored.progress, 100);
    }

    #[test]
    fn test_error_status_carries_detail() {
        let reg = registry();
        let job = reg.create(1000, 1).unwrap();
        let failed = reg
            .update(&job.id, |j| {
                j.status = JobStatus::Error;
                j.message = "ingestion failed".to_string();
            })
            .unwrap();
        assert_eq!(failed.error.as_deref(), Some("ingestion failed"));
    }

    #[test]
    fn test_list_in_creation_order() {
        let reg = registry();
        let a = reg.create(1, 1).unwrap();
        let b = reg.create(1, 1).unwrap();
        let ids: Vec<String> = reg.list().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }
}
