/// Execution service
///
/// The operations the transport layer calls. Owns the wiring between the
/// store, the relay, the sandbox registry and one supervision task per job.
use crate::launcher::{container_name, ImageSet, Launcher};
use crate::registry::SandboxRegistry;
use crate::relay::{LogRelay, LogSubscription, RelayError};
use crate::runtime::SandboxRuntime;
use crate::supervisor::{Supervisor, SupervisorConfig};
use crate::telemetry;
use crate::workspace::{ResultFile, Workspace};
use chrono::Utc;
use scriptbox_common::allocation::allocate;
use scriptbox_common::analyzer::{ScriptAnalysis, ScriptAnalyzer};
use scriptbox_common::config::Settings;
use scriptbox_common::profiles::ProfileTable;
use scriptbox_common::store::{JobStore, StoreError};
use scriptbox_common::types::{Job, JobId, JobMetrics, JobOutcome, JobSpec};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_LOG_TAIL: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("job {0} cannot be deleted while it is active")]
    NotDeletable(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<RelayError> for ServiceError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound(id) => ServiceError::NotFound(id),
            RelayError::Store(e) => ServiceError::Store(e),
            RelayError::Io(e) => ServiceError::InvalidRequest(format!("log unreadable: {}", e)),
        }
    }
}

pub struct ExecutionService {
    supervisor: Arc<Supervisor>,
    runtime: Arc<dyn SandboxRuntime>,
    store: Arc<dyn JobStore>,
    relay: Arc<LogRelay>,
    registry: Arc<SandboxRegistry>,
    workspace: Arc<Workspace>,
    analyzer: Arc<ScriptAnalyzer>,
    profiles: Arc<ProfileTable>,
    gpu_enabled: bool,
}

impl ExecutionService {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn JobStore>,
        settings: &Settings,
        profiles: ProfileTable,
        analyzer: ScriptAnalyzer,
    ) -> Self {
        let workspace = Arc::new(Workspace::new(&settings.scripts_dir, &settings.logs_dir));
        let relay = Arc::new(LogRelay::new(store.clone(), workspace.clone()));
        let registry = Arc::new(SandboxRegistry::new());
        let profiles = Arc::new(profiles);
        let launcher = Launcher::new(
            runtime.clone(),
            workspace.clone(),
            ImageSet {
                cpu: settings.cpu_image.clone(),
                gpu: settings.gpu_image.clone(),
            },
            settings.network_mode.clone(),
        );
        let supervisor = Arc::new(Supervisor::new(
            runtime.clone(),
            launcher,
            store.clone(),
            relay.clone(),
            registry.clone(),
            workspace.clone(),
            profiles.clone(),
            SupervisorConfig {
                poll_interval: settings.poll_interval,
                retry_limit: settings.runtime_retry_limit,
                stats_every_polls: settings.stats_every_polls,
                stop_grace: settings.stop_grace,
                gpu_enabled: settings.gpu_enabled,
            },
        ));

        Self {
            supervisor,
            runtime,
            store,
            relay,
            registry,
            workspace,
            analyzer: Arc::new(analyzer),
            profiles,
            gpu_enabled: settings.gpu_enabled,
        }
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    pub async fn gpu_available(&self) -> bool {
        self.gpu_enabled && self.runtime.gpu_available().await
    }

    /// Container runtime reachability, for health reporting
    pub async fn runtime_reachable(&self) -> bool {
        self.runtime.ping().await.is_ok()
    }

    fn validate(spec: &JobSpec) -> Result<(), ServiceError> {
        if spec.script.trim().is_empty() {
            return Err(ServiceError::InvalidRequest("script is empty".into()));
        }
        if spec.script.len() > MAX_SCRIPT_BYTES {
            return Err(ServiceError::InvalidRequest(format!(
                "script exceeds {} bytes",
                MAX_SCRIPT_BYTES
            )));
        }
        Ok(())
    }

    /// Accept a job and start supervising it in the background
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId, ServiceError> {
        Self::validate(&spec)?;

        let gpu_available = self.gpu_available().await;
        let allocation = allocate(&spec, &self.analyzer, gpu_available);
        let job = Job::new(Uuid::new_v4(), &spec, allocation, Utc::now());
        let job_id = job.id;

        self.store.create(&job).await?;
        info!(
            job_id = %job_id,
            mode = %job.execution_mode,
            profile = %job.resource_profile,
            auto_allocated = job.auto_allocated,
            timeout_seconds = job.timeout_seconds,
            "Job submitted"
        );

        let (handle, cancel_rx) = self.supervisor.admit(job);
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move { supervisor.run(handle, cancel_rx).await });

        telemetry::JOBS_SUBMITTED.inc();
        Ok(job_id)
    }

    /// Analyzer verdict for a script without submitting it
    pub async fn analyze(&self, script: &str) -> ScriptAnalysis {
        let gpu_available = self.gpu_available().await;
        self.analyzer.analyze(script, gpu_available)
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<Job, ServiceError> {
        if let Some(handle) = self.registry.get(job_id) {
            return Ok(handle.job.lock().await.clone());
        }
        if let Some(job) = self.registry.unpersisted(job_id) {
            return Ok(job);
        }
        self.store
            .load(job_id)
            .await?
            .ok_or(ServiceError::NotFound(job_id))
    }

    pub async fn get_metrics(&self, job_id: JobId) -> Result<Option<JobMetrics>, ServiceError> {
        self.get_status(job_id).await?;
        Ok(self.store.load_metrics(job_id).await?)
    }

    /// Cancel a job. `Ok(false)` when it had already finished.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, ServiceError> {
        if let Some(handle) = self.registry.get(job_id) {
            return Ok(self.supervisor.cancel(&handle).await);
        }

        let mut job = self.get_status(job_id).await?;
        if job.is_terminal() {
            return Ok(false);
        }

        // No live supervision: find the sandbox by its deterministic name
        let name = container_name(job_id);
        let mut lookup = self.runtime.find_by_name(&name).await;
        if let Err(e) = &lookup {
            warn!(job_id = %job_id, error = %e, "Sandbox lookup failed, retrying");
            lookup = self.runtime.find_by_name(&name).await;
        }
        match lookup {
            Ok(Some(container_id)) => {
                for result in [
                    self.runtime.kill(&container_id).await,
                    self.runtime.remove(&container_id).await,
                ] {
                    if let Err(e) = result {
                        if !e.is_not_found() {
                            warn!(job_id = %job_id, error = %e, "Failed to stop orphaned sandbox");
                        }
                    }
                }
            }
            // Already gone
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Sandbox lookup failed"),
        }

        if !job.finalize(&JobOutcome::Cancelled, Utc::now()) {
            return Ok(false);
        }
        self.supervisor.persist_terminal(&job).await;
        telemetry::record_finished(job.status, job.duration_seconds);
        info!(job_id = %job_id, "Orphaned job cancelled");
        Ok(true)
    }

    /// Recent output. Live jobs read from the runtime, finished jobs from the
    /// persisted log.
    pub async fn get_logs(&self, job_id: JobId, tail: Option<usize>) -> Result<String, ServiceError> {
        if let Some(handle) = self.registry.get(job_id) {
            if let Some(container_id) = &handle.container_id {
                match self
                    .runtime
                    .tail_logs(container_id, tail.unwrap_or(DEFAULT_LOG_TAIL))
                    .await
                {
                    Ok(text) => return Ok(text),
                    Err(e) => warn!(job_id = %job_id, error = %e, "Live log read failed"),
                }
            }
            let lines = self.relay.lines(job_id);
            let start = tail.map_or(0, |n| lines.len().saturating_sub(n));
            return Ok(lines[start..].join("\n"));
        }

        self.get_status(job_id).await?;
        let text = self
            .workspace
            .tail_log(job_id, tail)
            .await
            .map_err(|e| ServiceError::InvalidRequest(format!("log unreadable: {}", e)))?;
        Ok(text.unwrap_or_default())
    }

    pub async fn subscribe_logs(&self, job_id: JobId) -> Result<LogSubscription, ServiceError> {
        Ok(self.relay.subscribe(job_id).await?)
    }

    pub async fn running_jobs(&self) -> Vec<Job> {
        let mut jobs = Vec::new();
        for handle in self.registry.handles() {
            jobs.push(handle.job.lock().await.clone());
        }
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn list_results(&self, job_id: JobId) -> Result<Vec<ResultFile>, ServiceError> {
        self.get_status(job_id).await?;
        self.workspace
            .list_results(job_id)
            .await
            .map_err(|e| ServiceError::InvalidRequest(format!("results unreadable: {}", e)))
    }

    /// Remove a finished job and everything it left behind
    pub async fn delete(&self, job_id: JobId) -> Result<(), ServiceError> {
        let job = self.get_status(job_id).await?;
        if !job.is_terminal() || self.registry.get(job_id).is_some() {
            return Err(ServiceError::NotDeletable(job_id));
        }

        self.store.delete(job_id).await?;
        self.registry.forget_unpersisted(job_id);
        if let Err(e) = self.workspace.remove(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to remove job files");
        }
        info!(job_id = %job_id, "Job deleted");
        Ok(())
    }
}
