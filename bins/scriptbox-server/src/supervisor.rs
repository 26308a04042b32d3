/// Execution Supervisor
///
/// Owns the run-to-completion protocol for one job:
/// queue -> launch (with a single GPU->CPU retry) -> poll for exit/timeout/cancel
/// while forwarding output -> reconcile output -> finalize -> clean up.
///
/// Output draining runs in its own task and feeds the polling loop through a
/// channel, so bursty output never delays timeout detection. The drain task
/// re-attaches to the output stream after transient errors.
///
/// Finalization is shared with the cancel path. Whichever side moves the job
/// into a terminal state first wins; the other side's finalize is a no-op.
use crate::launcher::{container_name, LaunchError, LaunchedSandbox, Launcher};
use crate::output::{split_chunks, LineBuffer};
use crate::registry::{SandboxHandle, SandboxRegistry};
use crate::relay::LogRelay;
use crate::runtime::{SandboxRuntime, SandboxState};
use crate::telemetry;
use crate::usage::UsageTracker;
use crate::workspace::Workspace;
use chrono::Utc;
use futures_util::StreamExt;
use scriptbox_common::profiles::{ProfileTable, ResolvedLimits};
use scriptbox_common::store::JobStore;
use scriptbox_common::types::{ExecutionMode, Job, JobId, JobOutcome, JobStatus, LogStream};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const DRAIN_GRACE: Duration = Duration::from_secs(2);
const GPU_FALLBACK_NOTE: &str = " (GPU not available, using CPU fallback)";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub poll_interval: Duration,
    /// Consecutive runtime errors tolerated while polling
    pub retry_limit: u32,
    pub stats_every_polls: u32,
    pub stop_grace: Duration,
    pub gpu_enabled: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            retry_limit: 3,
            stats_every_polls: 4,
            stop_grace: Duration::from_secs(5),
            gpu_enabled: true,
        }
    }
}

/// How the polling loop ended
#[derive(Debug)]
enum LoopExit {
    Exited(i64),
    TimedOut,
    Cancelled,
    Lost(String),
}

/// Container cleanup guard - removes the sandbox if supervision is dropped
/// before it gets to its own cleanup (panic or task abort).
struct ContainerGuard {
    runtime: Arc<dyn SandboxRuntime>,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn new(runtime: Arc<dyn SandboxRuntime>, container_id: String) -> Self {
        Self {
            runtime,
            container_id: Some(container_id),
        }
    }

    fn disarm(&mut self) {
        self.container_id = None;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        let runtime = self.runtime.clone();
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            rt.spawn(async move {
                if let Err(e) = runtime.remove(&container_id).await {
                    if !e.is_not_found() {
                        warn!(container_id = %container_id, error = %e, "Failed to cleanup sandbox");
                    }
                }
            });
        }
    }
}

/// Lines present in `full` but not yet in `streamed`, compared as multisets of
/// message text, in `full` order.
pub fn missing_lines(
    streamed: &[(LogStream, String)],
    full: &[(LogStream, String)],
) -> Vec<(LogStream, String)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (_, line) in streamed {
        *seen.entry(line.as_str()).or_default() += 1;
    }
    let mut missing = Vec::new();
    for (stream, line) in full {
        match seen.get_mut(line.as_str()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => missing.push((*stream, line.clone())),
        }
    }
    missing
}

/// Follow a sandbox's output into `tx`, re-attaching up to `retry_limit` times
/// after stream errors. A re-attached stream starts over from the first line,
/// so lines already sent are skipped by count.
async fn drain_output(
    runtime: Arc<dyn SandboxRuntime>,
    container_id: String,
    tx: mpsc::UnboundedSender<(LogStream, String)>,
    retry_limit: u32,
    backoff: Duration,
) {
    let mut sent = 0usize;
    let mut failures = 0u32;
    loop {
        let mut output = runtime.output_stream(&container_id);
        let mut buffer = LineBuffer::new();
        let mut seen = 0usize;
        let mut error = None;

        while let Some(item) = output.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    error = Some(e);
                    break;
                }
            };
            for line in buffer.push(&chunk) {
                seen += 1;
                if seen <= sent {
                    continue;
                }
                if tx.send(line).is_err() {
                    return;
                }
                sent += 1;
            }
        }

        let Some(e) = error else {
            for line in buffer.flush() {
                seen += 1;
                if seen > sent {
                    let _ = tx.send(line);
                }
            }
            return;
        };

        failures += 1;
        if failures > retry_limit {
            warn!(error = %e, failures, "Output stream keeps failing, live output stopped");
            return;
        }
        debug!(error = %e, failures, lines_sent = sent, "Output stream failed, re-attaching");
        tokio::time::sleep(backoff).await;
    }
}

fn cancel_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

pub struct Supervisor {
    runtime: Arc<dyn SandboxRuntime>,
    launcher: Launcher,
    store: Arc<dyn JobStore>,
    relay: Arc<LogRelay>,
    registry: Arc<SandboxRegistry>,
    workspace: Arc<Workspace>,
    profiles: Arc<ProfileTable>,
    config: SupervisorConfig,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        launcher: Launcher,
        store: Arc<dyn JobStore>,
        relay: Arc<LogRelay>,
        registry: Arc<SandboxRegistry>,
        workspace: Arc<Workspace>,
        profiles: Arc<ProfileTable>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            runtime,
            launcher,
            store,
            relay,
            registry,
            workspace,
            profiles,
            config,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Register a freshly created job so it can be cancelled and observed
    /// before its supervision task starts.
    pub fn admit(&self, job: Job) -> (SandboxHandle, watch::Receiver<bool>) {
        let (handle, cancel_rx) = SandboxHandle::new(job.clone(), container_name(job.id));
        self.registry.insert(handle.clone());
        self.relay.open(job.id);
        (handle, cancel_rx)
    }

    /// Supervise one job to a terminal state
    #[tracing::instrument(skip_all, fields(job_id = %handle.job_id))]
    pub async fn run(&self, handle: SandboxHandle, mut cancel_rx: watch::Receiver<bool>) {
        let job_id = handle.job_id;

        let Some(job) = self
            .transition(&handle, |job| job.mark_queued(Utc::now()).is_ok())
            .await
        else {
            debug!("Job finalized before supervision started");
            self.registry.remove(job_id);
            return;
        };
        self.relay.publish_status(job_id, JobStatus::Queued);

        if handle.is_cancel_requested() {
            self.finalize(&handle, JobOutcome::Cancelled).await;
            self.registry.remove(job_id);
            return;
        }

        let limits = self
            .profiles
            .resolve(job.resource_profile, job.custom_limits.as_ref());
        let timeout_seconds = job.timeout_seconds.min(limits.timeout_seconds);

        let launched = match self.launch(&handle, &job, &limits).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(error = %e, "Sandbox launch failed");
                self.finalize(
                    &handle,
                    JobOutcome::Failed {
                        message: e.to_string(),
                    },
                )
                .await;
                self.registry.remove(job_id);
                return;
            }
        };

        let container_id = launched.container_id.clone();
        let mut guard = ContainerGuard::new(self.runtime.clone(), container_id.clone());
        let handle = self
            .registry
            .set_container(job_id, container_id.clone())
            .unwrap_or_else(|| handle.with_container(container_id.clone()));

        let running = if cancel_requested(&cancel_rx) {
            None
        } else {
            let log_path = self.workspace.log_path(job_id);
            let output_dir = self.workspace.output_dir(job_id);
            let gpu = launched.gpu;
            let id = container_id.clone();
            self.transition(&handle, move |job| {
                let ok = job.mark_running(Utc::now(), id).is_ok();
                if ok {
                    job.gpu_used = gpu;
                    job.logs_location = Some(log_path.display().to_string());
                    job.results_location = Some(output_dir.display().to_string());
                }
                ok
            })
            .await
        };

        if running.is_none() {
            // Cancelled while the sandbox was being created
            self.force_stop(&container_id).await;
            self.finalize(&handle, JobOutcome::Cancelled).await;
            self.cleanup(job_id, &container_id, &mut guard).await;
            return;
        }

        self.relay.publish_status(job_id, JobStatus::Running);
        telemetry::JOBS_RUNNING.inc();
        info!(
            container_id = %container_id,
            container = %launched.container_name,
            image = %launched.image,
            job_dir = %launched.job_dir.display(),
            timeout_seconds,
            gpu = launched.gpu,
            "Job running"
        );

        let started = Instant::now();
        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        let mut drain = tokio::spawn(drain_output(
            self.runtime.clone(),
            container_id.clone(),
            line_tx,
            self.config.retry_limit,
            self.config.poll_interval,
        ));

        let mut streamed: Vec<(LogStream, String)> = Vec::new();
        let mut usage = UsageTracker::new();
        let timeout = Duration::from_secs(timeout_seconds);
        let mut failures = 0u32;
        let mut polls = 0u32;

        let exit = loop {
            if cancel_requested(&cancel_rx) {
                break LoopExit::Cancelled;
            }

            match self.runtime.inspect(&container_id).await {
                Ok(SandboxState::Exited { exit_code }) => {
                    // A cancel observed alongside the exit wins
                    if cancel_requested(&cancel_rx) {
                        break LoopExit::Cancelled;
                    }
                    break LoopExit::Exited(exit_code);
                }
                Ok(SandboxState::Running) => failures = 0,
                Err(e) if e.is_not_found() => {
                    if cancel_requested(&cancel_rx) {
                        break LoopExit::Cancelled;
                    }
                    break LoopExit::Lost(format!("Sandbox disappeared: {}", e));
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "Runtime poll failed");
                    if failures > self.config.retry_limit {
                        break LoopExit::Lost(format!(
                            "Lost contact with container runtime after {} attempts: {}",
                            failures, e
                        ));
                    }
                }
            }

            self.forward(job_id, &mut line_rx, &mut streamed);

            if started.elapsed() >= timeout {
                break LoopExit::TimedOut;
            }

            polls += 1;
            if polls == 1 || polls % self.config.stats_every_polls.max(1) == 0 {
                match self.runtime.stats(&container_id).await {
                    Ok(sample) => usage.record(sample),
                    Err(e) => debug!(error = %e, "Stats sample failed"),
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = cancel_rx.changed() => {}
            }
        };

        match &exit {
            LoopExit::TimedOut => {
                warn!(timeout_seconds, "Job timed out, stopping sandbox");
                self.stop_and_confirm(&container_id).await;
            }
            LoopExit::Cancelled | LoopExit::Lost(_) => self.force_stop(&container_id).await,
            LoopExit::Exited(_) => {}
        }

        if tokio::time::timeout(DRAIN_GRACE, &mut drain).await.is_err() {
            drain.abort();
        }
        self.forward(job_id, &mut line_rx, &mut streamed);

        if !matches!(exit, LoopExit::Cancelled) {
            if streamed.len() < self.relay.history_limit() {
                self.reconcile(job_id, &container_id, &mut streamed).await;
            } else {
                debug!("Output exceeded relay history, skipping final log reconciliation");
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        let outcome = match exit {
            LoopExit::Exited(exit_code) => JobOutcome::Exited { exit_code },
            LoopExit::TimedOut => JobOutcome::TimedOut { timeout_seconds },
            LoopExit::Cancelled => JobOutcome::Cancelled,
            LoopExit::Lost(message) => JobOutcome::Failed { message },
        };
        self.finalize(&handle, outcome).await;

        let gpu_seconds = if launched.gpu { elapsed } else { 0.0 };
        if let Some(metrics) = usage.summarize(job_id, gpu_seconds, Utc::now()) {
            if let Err(e) = self.store.append_metrics(job_id, &metrics).await {
                warn!(error = %e, "Failed to store job metrics");
            }
        }

        telemetry::JOBS_RUNNING.dec();
        self.cleanup(job_id, &container_id, &mut guard).await;
    }

    /// Apply a non-terminal transition and persist it while holding the job lock,
    /// so a concurrent finalize can never be overwritten by an older snapshot.
    async fn transition<F>(&self, handle: &SandboxHandle, apply: F) -> Option<Job>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut job = handle.job.lock().await;
        if job.is_terminal() || !apply(&mut job) {
            return None;
        }
        if let Err(e) = self.store.update(&job).await {
            warn!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist job transition");
        }
        Some(job.clone())
    }

    async fn launch(
        &self,
        handle: &SandboxHandle,
        job: &Job,
        limits: &ResolvedLimits,
    ) -> Result<LaunchedSandbox, LaunchError> {
        let mut job = job.clone();
        let mut use_gpu = job.execution_mode == ExecutionMode::Gpu;

        if use_gpu && !(self.config.gpu_enabled && self.runtime.gpu_available().await) {
            warn!("GPU requested but not available, falling back to CPU");
            self.downgrade_to_cpu(handle, &mut job).await;
            use_gpu = false;
        }

        match self.launcher.build_and_start(&job, limits, use_gpu).await {
            Ok(launched) => Ok(launched),
            Err(e) if use_gpu && e.is_gpu_attributable() => {
                warn!(error = %e, "GPU launch failed, retrying on CPU");
                self.downgrade_to_cpu(handle, &mut job).await;
                self.launcher.build_and_start(&job, limits, false).await
            }
            Err(e) => Err(e),
        }
    }

    async fn downgrade_to_cpu(&self, handle: &SandboxHandle, job: &mut Job) {
        telemetry::GPU_FALLBACKS.inc();
        job.execution_mode = ExecutionMode::Cpu;
        let mut shared = handle.job.lock().await;
        shared.execution_mode = ExecutionMode::Cpu;
        match &mut shared.analysis_reasoning {
            Some(reasoning) if reasoning.ends_with(GPU_FALLBACK_NOTE) => {}
            Some(reasoning) => reasoning.push_str(GPU_FALLBACK_NOTE),
            None => shared.analysis_reasoning = Some(GPU_FALLBACK_NOTE.trim_start().to_string()),
        }
        job.analysis_reasoning = shared.analysis_reasoning.clone();
    }

    fn forward(
        &self,
        job_id: JobId,
        rx: &mut mpsc::UnboundedReceiver<(LogStream, String)>,
        streamed: &mut Vec<(LogStream, String)>,
    ) {
        let limit = self.relay.history_limit();
        while let Ok((stream, line)) = rx.try_recv() {
            self.relay.publish(job_id, stream, line.clone());
            if streamed.len() < limit {
                streamed.push((stream, line));
            }
        }
    }

    /// Close the gap between what was streamed and what the runtime kept
    async fn reconcile(
        &self,
        job_id: JobId,
        container_id: &str,
        streamed: &mut Vec<(LogStream, String)>,
    ) {
        let chunks = match self.runtime.full_logs(container_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                debug!(error = %e, "Final log read failed, keeping streamed output");
                return;
            }
        };
        let missing = missing_lines(streamed, &split_chunks(&chunks));
        if !missing.is_empty() {
            debug!(count = missing.len(), "Recovered lines from final log read");
        }
        for (stream, line) in missing {
            self.relay.publish(job_id, stream, line.clone());
            streamed.push((stream, line));
        }
    }

    async fn stop_and_confirm(&self, container_id: &str) {
        if let Err(e) = self.runtime.stop(container_id, self.config.stop_grace).await {
            warn!(error = %e, "Graceful stop failed");
        }
        match self.runtime.inspect(container_id).await {
            Ok(SandboxState::Exited { .. }) => {}
            Err(e) if e.is_not_found() => {}
            _ => self.force_stop(container_id).await,
        }
    }

    async fn force_stop(&self, container_id: &str) {
        if let Err(e) = self.runtime.kill(container_id).await {
            if !e.is_not_found() {
                debug!(error = %e, "Kill failed");
            }
        }
    }

    async fn cleanup(&self, job_id: JobId, container_id: &str, guard: &mut ContainerGuard) {
        match self.runtime.remove(container_id).await {
            Ok(()) => guard.disarm(),
            Err(e) if e.is_not_found() => guard.disarm(),
            Err(e) => warn!(error = %e, "Sandbox removal failed, retrying in background"),
        }
        self.registry.remove(job_id);
    }

    /// Move the job to its terminal state, persist it, and close its relay.
    /// Returns the final record, or `None` if another path finalized first.
    pub async fn finalize(&self, handle: &SandboxHandle, outcome: JobOutcome) -> Option<Job> {
        let job_id = handle.job_id;
        let job = {
            let mut job = handle.job.lock().await;
            if !job.finalize(&outcome, Utc::now()) {
                return None;
            }
            job.clone()
        };

        if let Err(e) = self
            .workspace
            .write_log(job_id, &self.relay.lines(job_id))
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to write job log");
        }

        self.persist_terminal(&job).await;
        telemetry::record_finished(job.status, job.duration_seconds);
        info!(
            job_id = %job_id,
            status = %job.status,
            exit_code = ?job.exit_code,
            duration_seconds = ?job.duration_seconds,
            "Job finished"
        );
        self.relay
            .complete(job_id, job.status, job.exit_code, job.duration_seconds);
        Some(job)
    }

    /// Write a terminal record, retrying once. If both writes fail the decision
    /// stands in memory and is served from the registry's side table.
    pub async fn persist_terminal(&self, job: &Job) {
        let first = match self.store.update(job).await {
            Ok(()) => return,
            Err(e) => e,
        };
        warn!(job_id = %job.id, error = %first, "Terminal write failed, retrying once");
        if let Err(second) = self.store.update(job).await {
            error!(
                job_id = %job.id,
                status = %job.status,
                error = %second,
                "Durability warning: terminal state not persisted"
            );
            self.registry.keep_unpersisted(job.clone());
        }
    }

    /// Cancel a job. Kills the sandbox immediately without a graceful stop and
    /// marks the job cancelled regardless of whether the kill succeeded.
    pub async fn cancel(&self, handle: &SandboxHandle) -> bool {
        handle.request_cancel();
        let current = self
            .registry
            .get(handle.job_id)
            .unwrap_or_else(|| handle.clone());

        if let Some(container_id) = &current.container_id {
            self.force_stop(container_id).await;
            if let Err(e) = self.runtime.remove(container_id).await {
                if !e.is_not_found() {
                    warn!(job_id = %handle.job_id, error = %e, "Failed to remove cancelled sandbox");
                }
            }
        }

        let cancelled = self.finalize(&current, JobOutcome::Cancelled).await.is_some();
        if cancelled {
            info!(job_id = %handle.job_id, container = %current.container_name, "Job cancelled");
        }
        cancelled
    }
}
