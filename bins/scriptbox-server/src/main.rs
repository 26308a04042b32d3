mod bootstrap;
mod docker;
mod handlers;
mod launcher;
mod output;
mod registry;
mod relay;
mod routes;
mod runtime;
mod service;
mod supervisor;
mod telemetry;
mod usage;
mod workspace;

#[cfg(test)]
mod testing;

use anyhow::Context;
use axum::Router;
use docker::DockerRuntime;
use runtime::SandboxRuntime;
use scriptbox_common::analyzer::{AnalyzerRules, ScriptAnalyzer};
use scriptbox_common::config::{LogFormat, Settings, StoreBackend};
use scriptbox_common::profiles::ProfileTable;
use scriptbox_common::redis::RedisJobStore;
use scriptbox_common::store::{JobStore, MemoryJobStore};
use service::ExecutionService;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

pub struct AppState {
    pub service: ExecutionService,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("Invalid configuration")?;
    init_tracing(settings.log_format);

    info!("Scriptbox server booting...");

    let profiles = ProfileTable::load_or_default(&settings.profiles_path).with_context(|| {
        format!(
            "Failed to load resource profiles from {}",
            settings.profiles_path.display()
        )
    })?;
    info!(
        profiles = ?profiles.profiles().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        "Resource profiles loaded"
    );

    let analyzer = match &settings.analyzer_rules_path {
        Some(path) => {
            let rules = AnalyzerRules::load(path)
                .with_context(|| format!("Failed to load analyzer rules from {}", path.display()))?;
            info!(path = %path.display(), "Analyzer rules loaded");
            ScriptAnalyzer::new(rules).context("Invalid analyzer rules")?
        }
        None => ScriptAnalyzer::default(),
    };

    let store: Arc<dyn JobStore> = match settings.store {
        StoreBackend::Redis => {
            let store = RedisJobStore::connect(&settings.redis_url)
                .await
                .with_context(|| format!("Failed to connect to Redis at {}", settings.redis_url))?;
            info!("Connected to Redis: {}", settings.redis_url);
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory job store, job records will not survive a restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    let runtime = DockerRuntime::connect().context("Failed to connect to Docker")?;
    let runtime = Arc::new(runtime);
    match runtime.ping().await {
        Ok(()) => info!("Docker is reachable"),
        Err(e) => warn!(error = %e, "Docker is not reachable yet, launches will fail until it is"),
    }

    let service = ExecutionService::new(runtime, store, &settings, profiles, analyzer);
    info!(
        cpu_image = %settings.cpu_image,
        gpu_image = %settings.gpu_image,
        gpu_available = service.gpu_available().await,
        "Execution engine ready"
    );

    let state = Arc::new(AppState { service });
    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;
    info!("HTTP server listening on {}", settings.bind_addr);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping HTTP server");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    info!("Scriptbox server stopped");
    Ok(())
}
