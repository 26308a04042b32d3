/// Container Launcher
///
/// Turns a job plus resolved limits into a running sandbox:
/// materializes the workspace, renders the bootstrap, pulls the image once if
/// missing, and creates the container with hard resource caps.
use crate::bootstrap;
use crate::runtime::{LaunchSpec, RuntimeError, SandboxRuntime};
use crate::workspace::Workspace;
use scriptbox_common::analyzer::extract_imports;
use scriptbox_common::profiles::ResolvedLimits;
use scriptbox_common::types::{ExecutionMode, Job, JobId, ProfileName};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const SANDBOX_WORKDIR: &str = "/app";
const CPU_PERIOD: i64 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("container runtime unreachable: {0}")]
    RuntimeUnreachable(String),
    #[error("image '{image}' could not be obtained: {reason}")]
    ImageUnavailable { image: String, reason: String },
    #[error("GPU launch failed: {0}")]
    Gpu(String),
    #[error("failed to prepare job workspace: {0}")]
    Workspace(#[from] std::io::Error),
    #[error("failed to start sandbox: {0}")]
    Start(String),
}

impl LaunchError {
    /// Whether retrying on CPU could plausibly succeed
    pub fn is_gpu_attributable(&self) -> bool {
        match self {
            LaunchError::Gpu(_) => true,
            LaunchError::Start(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("gpu") || lower.contains("nvidia")
            }
            _ => false,
        }
    }
}

impl From<RuntimeError> for LaunchError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unreachable(msg) => LaunchError::RuntimeUnreachable(msg),
            RuntimeError::ImageUnavailable { image, reason } => {
                LaunchError::ImageUnavailable { image, reason }
            }
            RuntimeError::Gpu(msg) => LaunchError::Gpu(msg),
            other => LaunchError::Start(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageSet {
    pub cpu: String,
    pub gpu: String,
}

impl ImageSet {
    pub fn for_gpu(&self, use_gpu: bool) -> &str {
        if use_gpu {
            &self.gpu
        } else {
            &self.cpu
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchedSandbox {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    pub gpu: bool,
    pub job_dir: PathBuf,
}

/// Deterministic sandbox name, used to find the sandbox again without a handle
pub fn container_name(job_id: JobId) -> String {
    format!("scriptbox-job-{}", job_id)
}

/// Pure translation from job parameters to a runtime launch request
pub fn build_spec(
    job_id: JobId,
    profile: ProfileName,
    limits: &ResolvedLimits,
    use_gpu: bool,
    job_dir: &Path,
    images: &ImageSet,
    network_mode: &str,
) -> LaunchSpec {
    let memory_bytes = limits.memory_mb as i64 * 1024 * 1024;
    let mode = if use_gpu {
        ExecutionMode::Gpu
    } else {
        ExecutionMode::Cpu
    };

    let mut labels = HashMap::new();
    labels.insert("scriptbox.job_id".to_string(), job_id.to_string());
    labels.insert("scriptbox.profile".to_string(), profile.to_string());
    labels.insert("scriptbox.mode".to_string(), mode.to_string());

    let mut env = vec!["PYTHONUNBUFFERED=1".to_string()];
    if use_gpu {
        env.push("NVIDIA_VISIBLE_DEVICES=all".to_string());
    }

    LaunchSpec {
        name: container_name(job_id),
        image: images.for_gpu(use_gpu).to_string(),
        command: vec!["sh".to_string(), format!("{}/run.sh", SANDBOX_WORKDIR)],
        working_dir: SANDBOX_WORKDIR.to_string(),
        binds: vec![format!("{}:{}:rw", job_dir.display(), SANDBOX_WORKDIR)],
        env,
        labels,
        cpu_shares: limits.cpu_shares as i64,
        cpu_period: CPU_PERIOD,
        cpu_quota: limits.cpu_shares as i64 * 100,
        memory_bytes,
        memory_swap_bytes: memory_bytes,
        network_mode: network_mode.to_string(),
        gpu: use_gpu,
    }
}

pub struct Launcher {
    runtime: Arc<dyn SandboxRuntime>,
    workspace: Arc<Workspace>,
    images: ImageSet,
    network_mode: String,
}

impl Launcher {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        workspace: Arc<Workspace>,
        images: ImageSet,
        network_mode: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            workspace,
            images,
            network_mode: network_mode.into(),
        }
    }

    #[tracing::instrument(skip(self, job, limits), fields(job_id = %job.id, gpu = use_gpu))]
    pub async fn build_and_start(
        &self,
        job: &Job,
        limits: &ResolvedLimits,
        use_gpu: bool,
    ) -> Result<LaunchedSandbox, LaunchError> {
        self.runtime.ping().await?;

        let imports = extract_imports(&job.script_content);
        let run_script = bootstrap::render_run_script(&imports, use_gpu, &self.images.gpu);
        let job_dir = self
            .workspace
            .prepare(job.id, &job.script_content, &run_script)
            .await?;

        let spec = build_spec(
            job.id,
            job.resource_profile,
            limits,
            use_gpu,
            &job_dir,
            &self.images,
            &self.network_mode,
        );

        self.runtime.ensure_image(&spec.image).await?;

        // Leftover from a crashed run would block the deterministic name
        match self.runtime.find_by_name(&spec.name).await {
            Ok(Some(stale)) => {
                warn!(container_id = %stale, name = %spec.name, "Removing stale sandbox");
                if let Err(e) = self.runtime.remove(&stale).await {
                    warn!(error = %e, "Failed to remove stale sandbox");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Stale sandbox lookup failed"),
        }

        let container_id = self.runtime.create_and_start(&spec).await?;
        info!(
            container_id = %container_id,
            image = %spec.image,
            memory_mb = limits.memory_mb,
            cpu_shares = limits.cpu_shares,
            "Sandbox started"
        );

        Ok(LaunchedSandbox {
            container_id,
            container_name: spec.name,
            image: spec.image,
            gpu: use_gpu,
            job_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn images() -> ImageSet {
        ImageSet {
            cpu: "python:3.11-slim".into(),
            gpu: "tensorflow/tensorflow:2.15.0-gpu".into(),
        }
    }

    fn limits(memory_mb: u32, cpu_shares: u32) -> ResolvedLimits {
        ResolvedLimits {
            cpu_shares,
            memory_mb,
            timeout_seconds: 60,
            gpu_required: false,
        }
    }

    #[test]
    fn test_cpu_spec() {
        let id = Uuid::new_v4();
        let spec = build_spec(
            id,
            ProfileName::Small,
            &limits(512, 512),
            false,
            Path::new("/data/scripts/x"),
            &images(),
            "bridge",
        );

        assert_eq!(spec.name, format!("scriptbox-job-{}", id));
        assert_eq!(spec.image, "python:3.11-slim");
        assert_eq!(spec.command, vec!["sh", "/app/run.sh"]);
        assert_eq!(spec.working_dir, "/app");
        assert_eq!(spec.binds, vec!["/data/scripts/x:/app:rw"]);
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.memory_swap_bytes, spec.memory_bytes);
        assert_eq!(spec.cpu_shares, 512);
        assert_eq!(spec.cpu_quota, 51_200);
        assert_eq!(spec.cpu_period, 100_000);
        assert_eq!(spec.network_mode, "bridge");
        assert!(!spec.gpu);
        assert_eq!(spec.labels["scriptbox.mode"], "cpu");
        assert_eq!(spec.labels["scriptbox.profile"], "small");
        assert_eq!(spec.labels["scriptbox.job_id"], id.to_string());
    }

    #[test]
    fn test_gpu_spec() {
        let spec = build_spec(
            Uuid::new_v4(),
            ProfileName::Gpu,
            &limits(6144, 2048),
            true,
            Path::new("/tmp/j"),
            &images(),
            "bridge",
        );
        assert!(spec.gpu);
        assert_eq!(spec.image, "tensorflow/tensorflow:2.15.0-gpu");
        assert_eq!(spec.labels["scriptbox.mode"], "gpu");
        assert!(spec.env.contains(&"NVIDIA_VISIBLE_DEVICES=all".to_string()));
    }

    #[test]
    fn test_gpu_attribution() {
        assert!(LaunchError::Gpu("x".into()).is_gpu_attributable());
        assert!(LaunchError::Start("nvidia runtime missing".into()).is_gpu_attributable());
        assert!(!LaunchError::ImageUnavailable {
            image: "a".into(),
            reason: "b".into()
        }
        .is_gpu_attributable());
        assert!(!LaunchError::RuntimeUnreachable("down".into()).is_gpu_attributable());
    }
}
