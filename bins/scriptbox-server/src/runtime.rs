/// Sandbox runtime abstraction
///
/// The supervisor and launcher only talk to a container runtime through this
/// trait. Production uses `DockerRuntime`; tests use an in-process fake.
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use scriptbox_common::types::LogStream;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unreachable: {0}")]
    Unreachable(String),
    #[error("image '{image}' unavailable: {reason}")]
    ImageUnavailable { image: String, reason: String },
    #[error("sandbox '{0}' not found")]
    NotFound(String),
    #[error("GPU device request failed: {0}")]
    Gpu(String),
    #[error("runtime communication error: {0}")]
    Communication(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Everything needed to create one sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub binds: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub cpu_shares: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    /// Equal to `memory_bytes`: no swap
    pub memory_swap_bytes: i64,
    pub network_mode: String,
    pub gpu: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Exited { exit_code: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: LogStream,
    pub bytes: Vec<u8>,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stdout,
            bytes: text.into(),
        }
    }

    pub fn stderr(text: impl Into<Vec<u8>>) -> Self {
        Self {
            stream: LogStream::Stderr,
            bytes: text.into(),
        }
    }
}

/// One point-in-time resource reading. CPU and I/O counters are cumulative
/// since sandbox start.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageSample {
    pub cpu_total_ns: u64,
    pub system_cpu_ns: u64,
    pub online_cpus: u32,
    pub memory_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync + 'static {
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Whether the runtime can attach accelerator devices at all
    async fn gpu_available(&self) -> bool;

    /// Make sure `image` is present locally, pulling it at most once
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create and start a sandbox, returning its runtime id
    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<SandboxState, RuntimeError>;

    /// Follow the sandbox output from its first line until it exits
    fn output_stream(&self, id: &str) -> BoxStream<'static, Result<OutputChunk, RuntimeError>>;

    /// Everything the sandbox wrote so far
    async fn full_logs(&self, id: &str) -> Result<Vec<OutputChunk>, RuntimeError>;

    async fn tail_logs(&self, id: &str, lines: usize) -> Result<String, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<UsageSample, RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the sandbox; a missing sandbox is `NotFound`
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn find_by_name(&self, name: &str) -> Result<Option<String>, RuntimeError>;
}
