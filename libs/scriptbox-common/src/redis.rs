use crate::store::{JobStore, StoreError};
use crate::types::{Job, JobId, JobMetrics};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Redis key layout for the job store
/// Deterministic so the server and tooling never drift

pub const JOB_PREFIX: &str = "scriptbox:job";
pub const METRICS_PREFIX: &str = "scriptbox:metrics";
pub const JOB_INDEX: &str = "scriptbox:jobs";

/// Key holding the JSON job record
pub fn job_key(job_id: &JobId) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Key holding the JSON metrics record
pub fn metrics_key(job_id: &JobId) -> String {
    format!("{}:{}", METRICS_PREFIX, job_id)
}

/// Job store over a shared Redis connection manager.
/// The manager is cheap to clone and reconnects on its own.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
}

impl RedisJobStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;

        // SET NX so a duplicate id never clobbers an existing record
        let created: Option<String> = redis::cmd("SET")
            .arg(job_key(&job.id))
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(StoreError::AlreadyExists(job.id));
        }

        let _: () = conn.sadd(JOB_INDEX, job.id.to_string()).await?;
        Ok(())
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(job_key(&job_id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(job)?;
        let _: () = conn.set(job_key(&job.id), payload).await?;
        let _: () = conn.sadd(JOB_INDEX, job.id.to_string()).await?;
        Ok(())
    }

    async fn append_metrics(&self, job_id: JobId, metrics: &JobMetrics) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(job_key(&job_id)).await?;
        if !exists {
            return Err(StoreError::NotFound(job_id));
        }
        let payload = serde_json::to_string(metrics)?;
        let _: () = conn.set(metrics_key(&job_id), payload).await?;
        Ok(())
    }

    async fn load_metrics(&self, job_id: JobId) -> Result<Option<JobMetrics>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(metrics_key(&job_id)).await?;
        match payload {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(vec![job_key(&job_id), metrics_key(&job_id)]).await?;
        let _: () = conn.srem(JOB_INDEX, job_id.to_string()).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_job_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(&id), job_key(&id));
        assert_eq!(job_key(&id), format!("scriptbox:job:{}", id));
    }

    #[test]
    fn test_metrics_key_format() {
        let id = Uuid::new_v4();
        let key = metrics_key(&id);
        assert!(key.starts_with("scriptbox:metrics:"));
        assert!(key.contains(&id.to_string()));
        assert_ne!(key, job_key(&id));
    }
}
