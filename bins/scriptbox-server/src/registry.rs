// Job id -> live sandbox handle
//
// One mutex guards the whole table. Entries are replaced whole, never
// mutated in place, so readers always see a consistent handle.

use parking_lot::Mutex;
use scriptbox_common::types::{Job, JobId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Shared view of one supervised job
#[derive(Clone)]
pub struct SandboxHandle {
    pub job_id: JobId,
    /// Authoritative in-memory record while the job is live
    pub job: Arc<tokio::sync::Mutex<Job>>,
    pub container_id: Option<String>,
    pub container_name: String,
    cancel: Arc<watch::Sender<bool>>,
}

impl SandboxHandle {
    pub fn new(job: Job, container_name: String) -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        let handle = Self {
            job_id: job.id,
            job: Arc::new(tokio::sync::Mutex::new(job)),
            container_id: None,
            container_name,
            cancel: Arc::new(tx),
        };
        (handle, rx)
    }

    pub fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn with_container(&self, container_id: String) -> Self {
        Self {
            container_id: Some(container_id),
            ..self.clone()
        }
    }
}

#[derive(Default)]
struct Tables {
    live: HashMap<JobId, SandboxHandle>,
    /// Terminal jobs whose final write to the store failed
    unpersisted: HashMap<JobId, Job>,
}

#[derive(Default)]
pub struct SandboxRegistry {
    tables: Mutex<Tables>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SandboxHandle) {
        self.tables.lock().live.insert(handle.job_id, handle);
    }

    pub fn get(&self, job_id: JobId) -> Option<SandboxHandle> {
        self.tables.lock().live.get(&job_id).cloned()
    }

    /// Record the runtime id once the sandbox exists
    pub fn set_container(&self, job_id: JobId, container_id: String) -> Option<SandboxHandle> {
        let mut tables = self.tables.lock();
        let updated = tables.live.get(&job_id)?.with_container(container_id);
        tables.live.insert(job_id, updated.clone());
        Some(updated)
    }

    pub fn remove(&self, job_id: JobId) -> Option<SandboxHandle> {
        self.tables.lock().live.remove(&job_id)
    }

    pub fn handles(&self) -> Vec<SandboxHandle> {
        self.tables.lock().live.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keep_unpersisted(&self, job: Job) {
        self.tables.lock().unpersisted.insert(job.id, job);
    }

    pub fn unpersisted(&self, job_id: JobId) -> Option<Job> {
        self.tables.lock().unpersisted.get(&job_id).cloned()
    }

    pub fn forget_unpersisted(&self, job_id: JobId) {
        self.tables.lock().unpersisted.remove(&job_id);
    }
}
