// Docker sandbox runtime using Bollard

use crate::runtime::{
    LaunchSpec, OutputChunk, RuntimeError, SandboxRuntime, SandboxState, UsageSample,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions,
    StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{DeviceRequest, HostConfig};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use scriptbox_common::types::LogStream;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn classify(id: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(id.to_string()),
        BollardError::DockerResponseServerError { message, .. } => {
            if is_gpu_message(&message) {
                RuntimeError::Gpu(message)
            } else {
                RuntimeError::Communication(message)
            }
        }
        other => RuntimeError::Communication(other.to_string()),
    }
}

fn is_gpu_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("gpu") || lower.contains("nvidia") || lower.contains("device driver")
}

fn to_chunk(output: LogOutput) -> Option<OutputChunk> {
    match output {
        LogOutput::StdOut { message } | LogOutput::Console { message } => Some(OutputChunk {
            stream: LogStream::Stdout,
            bytes: message.to_vec(),
        }),
        LogOutput::StdErr { message } => Some(OutputChunk {
            stream: LogStream::Stderr,
            bytes: message.to_vec(),
        }),
        LogOutput::StdIn { .. } => None,
    }
}

fn sample_from_stats(stats: &Stats) -> UsageSample {
    let (rx, tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (read, write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0, 0), |(r, w), e| {
                match e.op.to_lowercase().as_str() {
                    "read" => (r + e.value, w),
                    "write" => (r, w + e.value),
                    _ => (r, w),
                }
            })
        })
        .unwrap_or((0, 0));

    UsageSample {
        cpu_total_ns: stats.cpu_stats.cpu_usage.total_usage,
        system_cpu_ns: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats.cpu_stats.online_cpus.unwrap_or(1) as u32,
        memory_bytes: stats.memory_stats.usage.unwrap_or(0),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
        disk_read_bytes: read,
        disk_write_bytes: write,
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    async fn gpu_available(&self) -> bool {
        match self.docker.info().await {
            Ok(info) => info
                .runtimes
                .map(|runtimes| runtimes.contains_key("nvidia"))
                .unwrap_or(false),
            Err(e) => {
                warn!(error = %e, "Failed to query Docker info for GPU runtime");
                false
            }
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(match e {
                    BollardError::DockerResponseServerError { .. }
                    | BollardError::DockerStreamError { .. } => RuntimeError::ImageUnavailable {
                        image: image.to_string(),
                        reason: e.to_string(),
                    },
                    other => RuntimeError::Unreachable(other.to_string()),
                });
            }
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn create_and_start(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        let device_requests = spec.gpu.then(|| {
            vec![DeviceRequest {
                count: Some(-1),
                capabilities: Some(vec![vec!["gpu".to_string()]]),
                ..Default::default()
            }]
        });

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                cpu_shares: Some(spec.cpu_shares),
                cpu_period: Some(spec.cpu_period),
                cpu_quota: Some(spec.cpu_quota),
                memory: Some(spec.memory_bytes),
                memory_swap: Some(spec.memory_swap_bytes),
                network_mode: Some(spec.network_mode.clone()),
                device_requests,
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| match classify(&spec.name, e) {
                RuntimeError::NotFound(_) => RuntimeError::ImageUnavailable {
                    image: spec.image.clone(),
                    reason: "image not found at create time".to_string(),
                },
                other => other,
            })?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
        {
            // A created-but-unstarted container would leak under the same name
            let _ = self.remove(&container.id).await;
            return Err(classify(&container.id, e));
        }

        Ok(container.id)
    }

    async fn inspect(&self, id: &str) -> Result<SandboxState, RuntimeError> {
        let details = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| classify(id, e))?;

        let state = details.state.unwrap_or_default();
        if state.running.unwrap_or(false) {
            Ok(SandboxState::Running)
        } else {
            Ok(SandboxState::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            })
        }
    }

    fn output_stream(&self, id: &str) -> BoxStream<'static, Result<OutputChunk, RuntimeError>> {
        let options = Some(LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        });
        let id = id.to_string();
        self.docker
            .logs(&id, options)
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(output) => to_chunk(output).map(Ok),
                    Err(e) => Some(Err(classify(&id, e))),
                };
                futures_util::future::ready(mapped)
            })
            .boxed()
    }

    async fn full_logs(&self, id: &str) -> Result<Vec<OutputChunk>, RuntimeError> {
        let options = Some(LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            ..Default::default()
        });
        let mut stream = self.docker.logs(id, options);
        let mut chunks = Vec::new();
        while let Some(item) = stream.next().await {
            let output = item.map_err(|e| classify(id, e))?;
            if let Some(chunk) = to_chunk(output) {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    async fn tail_logs(&self, id: &str, lines: usize) -> Result<String, RuntimeError> {
        let options = Some(LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: lines.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.logs(id, options);
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let output = item.map_err(|e| classify(id, e))?;
            if let Some(chunk) = to_chunk(output) {
                text.push_str(&String::from_utf8_lossy(&chunk.bytes));
            }
        }
        Ok(text)
    }

    async fn stats(&self, id: &str) -> Result<UsageSample, RuntimeError> {
        let options = Some(StatsOptions {
            stream: false,
            one_shot: false,
        });
        let mut stream = self.docker.stats(id, options);
        match stream.next().await {
            Some(Ok(stats)) => Ok(sample_from_stats(&stats)),
            Some(Err(e)) => Err(classify(id, e)),
            None => Err(RuntimeError::Communication(format!(
                "no stats returned for {}",
                id
            ))),
        }
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: grace.as_secs() as i64,
                }),
            )
            .await
            .map_err(|e| classify(id, e))
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| classify(id, e))
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| classify(id, e))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });
        let containers = self
            .docker
            .list_containers(options)
            .await
            .map_err(|e| classify(name, e))?;

        // The name filter is a substring match; require the exact name
        let wanted = format!("/{}", name);
        Ok(containers
            .into_iter()
            .find(|c| {
                c.names
                    .as_ref()
                    .map(|names| names.iter().any(|n| n == &wanted || n == name))
                    .unwrap_or(false)
            })
            .and_then(|c| c.id))
    }
}
