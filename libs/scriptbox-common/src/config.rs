// Process configuration
// Read once from the environment at startup

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {key}: '{value}' ({reason})")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("expected 'redis' or 'memory', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'pretty' or 'json', got '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub store: StoreBackend,
    pub redis_url: String,
    pub cpu_image: String,
    pub gpu_image: String,
    pub gpu_enabled: bool,
    pub scripts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub profiles_path: PathBuf,
    pub analyzer_rules_path: Option<PathBuf>,
    pub poll_interval: Duration,
    pub runtime_retry_limit: u32,
    pub stats_every_polls: u32,
    pub stop_grace: Duration,
    pub network_mode: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            store: StoreBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            cpu_image: "python:3.11-slim".to_string(),
            gpu_image: "tensorflow/tensorflow:2.15.0-gpu".to_string(),
            gpu_enabled: true,
            scripts_dir: PathBuf::from("./data/scripts"),
            logs_dir: PathBuf::from("./data/logs"),
            profiles_path: PathBuf::from("config/profiles.json"),
            analyzer_rules_path: None,
            poll_interval: Duration::from_millis(500),
            runtime_retry_limit: 3,
            stats_every_polls: 4,
            stop_grace: Duration::from_secs(5),
            network_mode: "bridge".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Ok(Self {
            bind_addr: string("SCRIPTBOX_BIND_ADDR", defaults.bind_addr),
            store: parse(&lookup, "SCRIPTBOX_STORE", defaults.store)?,
            redis_url: string("REDIS_URL", defaults.redis_url),
            cpu_image: string("DOCKER_IMAGE_CPU", defaults.cpu_image),
            gpu_image: string("DOCKER_IMAGE_GPU", defaults.gpu_image),
            gpu_enabled: parse_bool(&lookup, "GPU_ENABLED", defaults.gpu_enabled)?,
            scripts_dir: lookup("SCRIPTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scripts_dir),
            logs_dir: lookup("LOGS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.logs_dir),
            profiles_path: lookup("PROFILES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.profiles_path),
            analyzer_rules_path: lookup("ANALYZER_RULES_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            poll_interval: Duration::from_millis(parse(
                &lookup,
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            runtime_retry_limit: parse(
                &lookup,
                "RUNTIME_RETRY_LIMIT",
                defaults.runtime_retry_limit,
            )?,
            stats_every_polls: parse(&lookup, "STATS_EVERY_POLLS", defaults.stats_every_polls)?
                .max(1),
            stop_grace: Duration::from_secs(parse(
                &lookup,
                "STOP_GRACE_SECONDS",
                defaults.stop_grace.as_secs(),
            )?),
            network_mode: string("SANDBOX_NETWORK_MODE", defaults.network_mode),
            log_format: parse(&lookup, "LOG_FORMAT", defaults.log_format)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: ToString,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            reason: e.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_bool<F>(lookup: &F, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr, "0.0.0.0:3000");
        assert_eq!(s.store, StoreBackend::Redis);
        assert_eq!(s.cpu_image, "python:3.11-slim");
        assert_eq!(s.poll_interval, Duration::from_millis(500));
        assert_eq!(s.runtime_retry_limit, 3);
        assert!(s.analyzer_rules_path.is_none());
        assert_eq!(s.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let s = settings(&[
            ("SCRIPTBOX_STORE", "memory"),
            ("GPU_ENABLED", "false"),
            ("POLL_INTERVAL_MS", "100"),
            ("LOG_FORMAT", "JSON"),
            ("STATS_EVERY_POLLS", "0"),
        ])
        .unwrap();
        assert_eq!(s.store, StoreBackend::Memory);
        assert!(!s.gpu_enabled);
        assert_eq!(s.poll_interval, Duration::from_millis(100));
        assert_eq!(s.log_format, LogFormat::Json);
        assert_eq!(s.stats_every_polls, 1);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = settings(&[("POLL_INTERVAL_MS", "fast")]).unwrap_err();
        assert_eq!(err.key, "POLL_INTERVAL_MS");
        assert!(settings(&[("GPU_ENABLED", "maybe")]).is_err());
        assert!(settings(&[("SCRIPTBOX_STORE", "postgres")]).is_err());
    }
}
