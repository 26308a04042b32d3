// Job store contract plus an in-process implementation

use crate::types::{Job, JobId, JobMetrics};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    AlreadyExists(JobId),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Persistence for job records and their metrics.
///
/// `update` is a full-record upsert of the mutable fields. Deleting a job
/// also deletes its metrics.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;
    async fn load(&self, job_id: JobId) -> Result<Option<Job>, StoreError>;
    async fn update(&self, job: &Job) -> Result<(), StoreError>;
    async fn append_metrics(&self, job_id: JobId, metrics: &JobMetrics) -> Result<(), StoreError>;
    async fn load_metrics(&self, job_id: JobId) -> Result<Option<JobMetrics>, StoreError>;
    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError>;
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    metrics: HashMap<JobId, JobMetrics>,
}

/// Store backed by process memory. Used for single-node runs and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if tables.jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.lock().jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        self.tables.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn append_metrics(&self, job_id: JobId, metrics: &JobMetrics) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        if !tables.jobs.contains_key(&job_id) {
            return Err(StoreError::NotFound(job_id));
        }
        tables.metrics.insert(job_id, metrics.clone());
        Ok(())
    }

    async fn load_metrics(&self, job_id: JobId) -> Result<Option<JobMetrics>, StoreError> {
        Ok(self.tables.lock().metrics.get(&job_id).cloned())
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        tables.metrics.remove(&job_id);
        Ok(tables.jobs.remove(&job_id).is_some())
    }
}
