// In-process sandbox runtime for tests

use crate::runtime::{
    LaunchSpec, OutputChunk, RuntimeError, SandboxRuntime, SandboxState, UsageSample,
};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use scriptbox_common::store::{JobStore, MemoryJobStore, StoreError};
use scriptbox_common::types::{Job, JobId, JobMetrics};
use std::collections::HashMap;
use std::time::Duration;

/// What every sandbox created by the fake does
#[derive(Debug, Clone)]
pub struct FakeProgram {
    pub output: Vec<OutputChunk>,
    /// `None` runs until stopped
    pub exit_code: Option<i64>,
    /// Inspections reporting `Running` before the exit is visible
    pub polls_before_exit: u32,
}

struct FakeContainer {
    name: String,
    running: bool,
    exit_code: i64,
    polls_left: u32,
    samples: u64,
}

#[derive(Default)]
struct FakeState {
    next_id: u32,
    containers: HashMap<String, FakeContainer>,
    attempts: Vec<LaunchSpec>,
    stopped: Vec<String>,
    killed: Vec<String>,
    removed: Vec<String>,
    inspect_failures: u32,
    streams_opened: u32,
}

pub struct FakeRuntime {
    pub program: FakeProgram,
    pub gpu: bool,
    pub fail_gpu_launch: bool,
    pub launch_error: Option<RuntimeError>,
    /// Consecutive inspect calls that fail before inspection recovers
    pub inspect_failures: u32,
    /// Only this many chunks are delivered by the live stream
    pub stream_limit: Option<usize>,
    /// The first `n` live streams deliver one chunk and then fail
    pub stream_breaks: u32,
    pub fail_stats: bool,
    state: Mutex<FakeState>,
    on_exit: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeRuntime {
    pub fn new(program: FakeProgram) -> Self {
        Self {
            program,
            gpu: false,
            fail_gpu_launch: false,
            launch_error: None,
            inspect_failures: 0,
            stream_limit: None,
            stream_breaks: 0,
            fail_stats: false,
            state: Mutex::new(FakeState::default()),
            on_exit: Mutex::new(None),
        }
    }

    pub fn program(output: Vec<OutputChunk>, exit_code: Option<i64>, polls_before_exit: u32) -> FakeProgram {
        FakeProgram {
            output,
            exit_code,
            polls_before_exit,
        }
    }

    /// Run `f` when an inspection first observes the program's natural exit
    pub fn on_exit(&self, f: impl FnOnce() + Send + 'static) {
        *self.on_exit.lock() = Some(Box::new(f));
    }

    pub fn attempts(&self) -> Vec<LaunchSpec> {
        self.state.lock().attempts.clone()
    }

    pub fn created(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().containers.keys().cloned().collect();
        ids.extend(self.removed());
        ids
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.state.lock().killed.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn streams_opened(&self) -> u32 {
        self.state.lock().streams_opened
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state.lock();
        state
            .containers
            .get_mut(id)
            .map(f)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn gpu_available(&self) -> bool {
        self.gpu
    }

    async fn ensure_image(&self, _image: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let mut state = self.state.lock();
        state.attempts.push(spec.clone());
        if let Some(err) = &self.launch_error {
            return Err(err.clone());
        }
        if spec.gpu && self.fail_gpu_launch {
            return Err(RuntimeError::Gpu("could not select device driver \"nvidia\"".into()));
        }
        if state.attempts.len() == 1 {
            state.inspect_failures = self.inspect_failures;
        }
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: true,
                exit_code: 0,
                polls_left: self.program.polls_before_exit,
                samples: 0,
            },
        );
        Ok(id)
    }

    async fn inspect(&self, id: &str) -> Result<SandboxState, RuntimeError> {
        {
            let mut state = self.state.lock();
            if state.inspect_failures > 0 {
                state.inspect_failures -= 1;
                return Err(RuntimeError::Communication("connection reset".into()));
            }
        }
        let exit = self.program.exit_code;
        let (state, exited_now) = self.with_container(id, |c| {
            let mut exited_now = false;
            if c.running {
                if c.polls_left > 0 {
                    c.polls_left -= 1;
                } else if let Some(code) = exit {
                    c.running = false;
                    c.exit_code = code;
                    exited_now = true;
                }
            }
            let state = if c.running {
                SandboxState::Running
            } else {
                SandboxState::Exited {
                    exit_code: c.exit_code,
                }
            };
            (state, exited_now)
        })?;
        if exited_now {
            let hook = self.on_exit.lock().take();
            if let Some(f) = hook {
                f();
            }
        }
        Ok(state)
    }

    fn output_stream(&self, _id: &str) -> BoxStream<'static, Result<OutputChunk, RuntimeError>> {
        let opened = {
            let mut state = self.state.lock();
            state.streams_opened += 1;
            state.streams_opened
        };
        if opened <= self.stream_breaks {
            let mut items: Vec<_> = self.program.output.iter().take(1).cloned().map(Ok).collect();
            items.push(Err(RuntimeError::Communication("log stream reset".into())));
            return stream::iter(items).boxed();
        }
        let limit = self.stream_limit.unwrap_or(usize::MAX);
        let chunks: Vec<_> = self.program.output.iter().take(limit).cloned().map(Ok).collect();
        stream::iter(chunks).boxed()
    }

    async fn full_logs(&self, id: &str) -> Result<Vec<OutputChunk>, RuntimeError> {
        self.with_container(id, |_| ())?;
        Ok(self.program.output.clone())
    }

    async fn tail_logs(&self, id: &str, lines: usize) -> Result<String, RuntimeError> {
        self.with_container(id, |_| ())?;
        let text: String = self
            .program
            .output
            .iter()
            .map(|c| String::from_utf8_lossy(&c.bytes).into_owned())
            .collect();
        let all: Vec<&str> = text.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].join("\n"))
    }

    async fn stats(&self, id: &str) -> Result<UsageSample, RuntimeError> {
        if self.fail_stats {
            return Err(RuntimeError::Communication("stats unavailable".into()));
        }
        self.with_container(id, |c| {
            c.samples += 1;
            UsageSample {
                cpu_total_ns: c.samples * 100_000_000,
                system_cpu_ns: c.samples * 1_000_000_000,
                online_cpus: 1,
                memory_bytes: 64 * 1024 * 1024,
                ..Default::default()
            }
        })
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.with_container(id, |c| {
            c.running = false;
            c.exit_code = 143;
        })?;
        self.state.lock().stopped.push(id.to_string());
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.with_container(id, |c| {
            c.running = false;
            c.exit_code = 137;
        })?;
        self.state.lock().killed.push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        if state.containers.remove(id).is_none() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone()))
    }
}

/// Memory store whose writes of terminal records fail a set number of times
pub struct FlakyStore {
    inner: MemoryJobStore,
    terminal_failures: Mutex<u32>,
    terminal_attempts: Mutex<u32>,
}

impl FlakyStore {
    pub fn new(terminal_failures: u32) -> Self {
        Self {
            inner: MemoryJobStore::new(),
            terminal_failures: Mutex::new(terminal_failures),
            terminal_attempts: Mutex::new(0),
        }
    }

    pub fn terminal_attempts(&self) -> u32 {
        *self.terminal_attempts.lock()
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.inner.create(job).await
    }

    async fn load(&self, job_id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.load(job_id).await
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        if job.is_terminal() {
            *self.terminal_attempts.lock() += 1;
            let mut left = self.terminal_failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err(StoreError::NotFound(job.id));
            }
        }
        self.inner.update(job).await
    }

    async fn append_metrics(&self, job_id: JobId, metrics: &JobMetrics) -> Result<(), StoreError> {
        self.inner.append_metrics(job_id, metrics).await
    }

    async fn load_metrics(&self, job_id: JobId) -> Result<Option<JobMetrics>, StoreError> {
        self.inner.load_metrics(job_id).await
    }

    async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.inner.delete(job_id).await
    }
}
