use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = Uuid;

/// Requested timeout bounds (seconds), applied on submission
pub const MIN_TIMEOUT_SECONDS: u64 = 10;
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Cpu,
    Gpu,
    Auto,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Cpu => "cpu",
            ExecutionMode::Gpu => "gpu",
            ExecutionMode::Auto => "auto",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(ExecutionMode::Cpu),
            "gpu" => Ok(ExecutionMode::Gpu),
            "auto" => Ok(ExecutionMode::Auto),
            _ => Err(ParseEnumError::new("execution mode", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileName {
    Small,
    Medium,
    Large,
    Gpu,
    Auto,
}

impl ProfileName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileName::Small => "small",
            ProfileName::Medium => "medium",
            ProfileName::Large => "large",
            ProfileName::Gpu => "gpu",
            ProfileName::Auto => "auto",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProfileName {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "small" => Ok(ProfileName::Small),
            "medium" => Ok(ProfileName::Medium),
            "large" => Ok(ProfileName::Large),
            "gpu" => Ok(ProfileName::Gpu),
            "auto" => Ok(ProfileName::Auto),
            _ => Err(ParseEnumError::new("resource profile", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Job lifecycle
///
/// `Pending -> Queued -> Running -> {Success | Failed | Cancelled | Timeout}`.
/// `Pending`/`Queued` may also go straight to `Cancelled`, and `Queued` to `Failed`
/// when the sandbox cannot be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-job resource overrides. Values are clamped when resolved, never trusted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomLimits {
    #[serde(default)]
    pub memory_mb: Option<u32>,
    #[serde(default)]
    pub cpu_shares: Option<u32>,
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: Option<u64>,
}

impl CustomLimits {
    pub fn is_empty(&self) -> bool {
        self.memory_mb.is_none() && self.cpu_shares.is_none() && self.timeout_seconds.is_none()
    }
}

fn default_script_name() -> String {
    "script.py".to_string()
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Auto
}

fn default_profile() -> ProfileName {
    ProfileName::Auto
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

/// A submission as received from the transport layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(alias = "code")]
    pub script: String,
    #[serde(default = "default_script_name")]
    pub script_name: String,
    #[serde(default = "default_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_profile")]
    pub resource_profile: ProfileName,
    #[serde(default = "default_timeout", alias = "timeout")]
    pub timeout_seconds: u64,
    #[serde(default, alias = "custom_config")]
    pub custom_limits: Option<CustomLimits>,
}

impl JobSpec {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            script_name: default_script_name(),
            execution_mode: default_mode(),
            resource_profile: default_profile(),
            timeout_seconds: default_timeout(),
            custom_limits: None,
        }
    }
}

/// Effective mode/profile chosen for a job before it is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub execution_mode: ExecutionMode,
    pub resource_profile: ProfileName,
    pub timeout_seconds: u64,
    pub auto_allocated: bool,
    pub reasoning: Option<String>,
}

/// How a supervised run ended, before it is folded into the job record
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The sandbox exited on its own
    Exited { exit_code: i64 },
    /// Launch or runtime failure; no usable exit code
    Failed { message: String },
    TimedOut { timeout_seconds: u64 },
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Exited { exit_code: 0 } => JobStatus::Success,
            JobOutcome::Exited { .. } | JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::TimedOut { .. } => JobStatus::Timeout,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub script_name: String,
    pub script_content: String,
    pub requested_mode: ExecutionMode,
    pub requested_profile: ProfileName,
    /// Effective values after analysis and GPU fallback
    pub execution_mode: ExecutionMode,
    pub resource_profile: ProfileName,
    pub timeout_seconds: u64,
    pub custom_limits: Option<CustomLimits>,
    pub auto_allocated: bool,
    pub analysis_reasoning: Option<String>,
    /// Sandbox instance id, present only while running
    pub container_id: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub queue_time_seconds: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub logs_location: Option<String>,
    pub results_location: Option<String>,
    pub gpu_used: bool,
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Job {
    pub fn new(id: JobId, spec: &JobSpec, allocation: Allocation, now: DateTime<Utc>) -> Self {
        Self {
            id,
            script_name: spec.script_name.clone(),
            script_content: spec.script.clone(),
            requested_mode: spec.execution_mode,
            requested_profile: spec.resource_profile,
            execution_mode: allocation.execution_mode,
            resource_profile: allocation.resource_profile,
            timeout_seconds: allocation.timeout_seconds,
            custom_limits: spec.custom_limits.clone().filter(|c| !c.is_empty()),
            auto_allocated: allocation.auto_allocated,
            analysis_reasoning: allocation.reasoning,
            container_id: None,
            status: JobStatus::Pending,
            created_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            queue_time_seconds: None,
            duration_seconds: None,
            exit_code: None,
            error_message: None,
            logs_location: None,
            results_location: None,
            gpu_used: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_queued(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Pending {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Queued,
            });
        }
        self.status = JobStatus::Queued;
        self.queued_at = Some(at.max(self.created_at));
        Ok(())
    }

    pub fn mark_running(
        &mut self,
        at: DateTime<Utc>,
        container_id: String,
    ) -> Result<(), InvalidTransition> {
        if self.status != JobStatus::Queued {
            return Err(InvalidTransition {
                from: self.status,
                to: JobStatus::Running,
            });
        }
        let queued_at = self.queued_at.unwrap_or(self.created_at);
        let started_at = at.max(queued_at);
        self.status = JobStatus::Running;
        self.started_at = Some(started_at);
        self.queue_time_seconds = Some(seconds_between(queued_at, started_at));
        self.container_id = Some(container_id);
        Ok(())
    }

    /// Move the job into its terminal state.
    ///
    /// Returns `false` without touching the record when the job is already terminal,
    /// so a second finalize is always a no-op.
    pub fn finalize(&mut self, outcome: &JobOutcome, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }

        let status = outcome.status();
        let floor = self
            .started_at
            .or(self.queued_at)
            .unwrap_or(self.created_at);
        let finished_at = at.max(floor);

        // A launch failure never reached running; pin its start to the failure time
        if self.started_at.is_none() && status != JobStatus::Cancelled {
            self.started_at = Some(finished_at);
        }

        self.status = status;
        self.finished_at = Some(finished_at);
        self.duration_seconds = self
            .started_at
            .map(|started| seconds_between(started, finished_at));
        self.container_id = None;

        match outcome {
            JobOutcome::Exited { exit_code } => {
                self.exit_code = Some(*exit_code);
                if *exit_code != 0 {
                    self.error_message = Some(describe_exit_code(*exit_code));
                }
            }
            JobOutcome::Failed { message } => {
                self.exit_code = None;
                self.error_message = Some(message.clone());
            }
            JobOutcome::TimedOut { timeout_seconds } => {
                self.exit_code = None;
                self.error_message =
                    Some(format!("Job exceeded timeout of {} seconds", timeout_seconds));
            }
            JobOutcome::Cancelled => {
                self.exit_code = None;
            }
        }
        true
    }
}

/// Human-readable message for a non-zero exit code
pub fn describe_exit_code(exit_code: i64) -> String {
    match exit_code {
        137 => format!(
            "Script exited with code {} (killed: likely out of memory or over the memory limit)",
            exit_code
        ),
        139 => format!("Script exited with code {} (segmentation fault)", exit_code),
        _ => format!("Script exited with code {}", exit_code),
    }
}

/// Resource usage collected for one finished job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub job_id: JobId,
    pub cpu_seconds: f64,
    pub avg_cpu_percent: f64,
    pub max_cpu_percent: f64,
    pub peak_ram_mb: f64,
    pub avg_ram_mb: f64,
    pub gpu_seconds: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => f.write_str("stdout"),
            LogStream::Stderr => f.write_str("stderr"),
        }
    }
}

/// Event delivered to log subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Log {
        job_id: JobId,
        stream: LogStream,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line_number: Option<u64>,
        timestamp: DateTime<Utc>,
    },
    Status {
        job_id: JobId,
        status: JobStatus,
        timestamp: DateTime<Utc>,
    },
    Complete {
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i64>,
        duration_seconds: Option<f64>,
        timestamp: DateTime<Utc>,
    },
}

impl LogEvent {
    pub fn is_complete(&self) -> bool {
        matches!(self, LogEvent::Complete { .. })
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            LogEvent::Log { message, .. } => Some(message),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn allocation() -> Allocation {
        Allocation {
            execution_mode: ExecutionMode::Cpu,
            resource_profile: ProfileName::Small,
            timeout_seconds: 60,
            auto_allocated: false,
            reasoning: None,
        }
    }

    fn make_job() -> Job {
        Job::new(Uuid::new_v4(), &JobSpec::new("print(1)"), allocation(), Utc::now())
    }

    #[test]
    fn test_status_terminality() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_enum_parsing() {
        assert_eq!("GPU".parse::<ExecutionMode>().unwrap(), ExecutionMode::Gpu);
        assert_eq!("large".parse::<ProfileName>().unwrap(), ProfileName::Large);
        assert!("turbo".parse::<ProfileName>().is_err());
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: JobSpec = serde_json::from_str(r#"{"code": "print('hi')"}"#).unwrap();
        assert_eq!(spec.script_name, "script.py");
        assert_eq!(spec.execution_mode, ExecutionMode::Auto);
        assert_eq!(spec.resource_profile, ProfileName::Auto);
        assert_eq!(spec.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert!(spec.custom_limits.is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut job = make_job();
        let t0 = job.created_at;

        job.mark_queued(t0 + Duration::milliseconds(10)).unwrap();
        job.mark_running(t0 + Duration::milliseconds(250), "abc".into())
            .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.container_id.as_deref(), Some("abc"));
        assert_eq!(job.queue_time_seconds, Some(0.24));

        assert!(job.finalize(
            &JobOutcome::Exited { exit_code: 0 },
            t0 + Duration::milliseconds(2250)
        ));
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.exit_code, Some(0));
        assert_eq!(job.duration_seconds, Some(2.0));
        assert!(job.container_id.is_none());
        assert!(job.error_message.is_none());
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut job = make_job();
        job.mark_queued(Utc::now()).unwrap();
        job.mark_running(Utc::now(), "c1".into()).unwrap();

        assert!(job.finalize(&JobOutcome::Cancelled, Utc::now()));
        let snapshot = job.clone();

        assert!(!job.finalize(&JobOutcome::Exited { exit_code: 0 }, Utc::now()));
        assert_eq!(job, snapshot);
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_before_start_never_runs() {
        let mut job = make_job();
        assert!(job.finalize(&JobOutcome::Cancelled, Utc::now()));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.started_at.is_none());
        assert!(job.duration_seconds.is_none());
        assert!(job.exit_code.is_none());
    }

    #[test]
    fn test_no_revisiting_states() {
        let mut job = make_job();
        job.mark_queued(Utc::now()).unwrap();
        assert!(job.mark_queued(Utc::now()).is_err());
        job.mark_running(Utc::now(), "c".into()).unwrap();
        assert!(job.mark_running(Utc::now(), "c".into()).is_err());
        job.finalize(&JobOutcome::TimedOut { timeout_seconds: 60 }, Utc::now());
        assert!(job.mark_queued(Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Job exceeded timeout of 60 seconds")
        );
    }

    #[test]
    fn test_timestamps_monotonic_under_clock_skew() {
        let mut job = make_job();
        let t0 = job.created_at;
        job.mark_queued(t0).unwrap();
        job.mark_running(t0 + Duration::seconds(5), "c".into()).unwrap();

        // finish reported "before" start must not produce negative durations
        job.finalize(&JobOutcome::Exited { exit_code: 1 }, t0);
        let started = job.started_at.unwrap();
        let finished = job.finished_at.unwrap();
        assert!(started <= finished);
        assert_eq!(job.duration_seconds, Some(0.0));
    }

    #[test]
    fn test_launch_failure_pins_start() {
        let mut job = make_job();
        job.mark_queued(Utc::now()).unwrap();
        job.finalize(
            &JobOutcome::Failed {
                message: "image missing".into(),
            },
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.started_at, job.finished_at);
        assert_eq!(job.duration_seconds, Some(0.0));
        assert!(job.exit_code.is_none());
    }

    #[test]
    fn test_exit_code_descriptions() {
        assert!(describe_exit_code(137).contains("memory"));
        assert!(describe_exit_code(139).contains("segmentation"));
        assert_eq!(describe_exit_code(2), "Script exited with code 2");
    }

    #[test]
    fn test_log_event_wire_format() {
        let id = Uuid::new_v4();
        let event = LogEvent::Complete {
            job_id: id,
            status: JobStatus::Success,
            exit_code: Some(0),
            duration_seconds: Some(1.5),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "complete");
        assert_eq!(json["status"], "success");
        assert_eq!(json["exit_code"], 0);
    }
}
