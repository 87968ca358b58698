//! Configuration for the engine binary.
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/pipewright/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

mod infrastructure;
mod logging;
mod services;

pub use infrastructure::{FileInfrastructure, InfrastructureKind};
pub use logging::{FileLogging, LogRotation, LoggingConfig};
pub use services::{BackendKind, FileServiceBackends, ServiceBackends};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Top-level engine configuration (§3's configuration snapshot).
#[derive(Debug, Clone)]
pub struct Config {
    /// Which infrastructure runtime drives dispatch.
    pub infrastructure: InfrastructureKind,
    /// Which backend each service contract resolves to.
    pub services: ServiceBackends,
    pub logging: LoggingConfig,
    /// How long a broker-backed dispatch may run before it's considered
    /// stuck and eligible for re-enqueue.
    pub task_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            infrastructure: InfrastructureKind::default(),
            services: ServiceBackends::default(),
            logging: LoggingConfig::default(),
            task_timeout: Duration::from_secs(300),
        }
    }
}

/// Config file structure (subset of [`Config`] that makes sense to persist).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub task_timeout_secs: Option<u64>,
    pub infrastructure: Option<FileInfrastructure>,
    pub services: Option<FileServiceBackends>,
    pub logging: Option<FileLogging>,
}

impl Config {
    /// `~/.config/pipewright/config.toml`.
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("pipewright").join("config.toml"))
    }

    /// Load file config if it exists.
    ///
    /// # Panics
    /// If config file exists but cannot be parsed. This is intentional: a
    /// broken config should fail fast with a clear error, not silently fall
    /// back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                eprintln!("config error: failed to parse {}: {e}", path.display());
                std::process::exit(1);
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("config error: cannot read {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }

    /// Loads configuration: defaults < file < `PIPEWRIGHT_*` env vars.
    pub fn from_env() -> Self {
        let file = Self::load_file_config();

        let task_timeout = std::env::var("PIPEWRIGHT_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.task_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        let mut infrastructure = InfrastructureKind::from_file(file.infrastructure);
        if let Ok(kind) = std::env::var("PIPEWRIGHT_INFRASTRUCTURE") {
            infrastructure = match kind.as_str() {
                "worker_pool" => InfrastructureKind::WorkerPool {
                    size: std::env::var("PIPEWRIGHT_WORKER_POOL_SIZE")
                        .ok()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(4),
                },
                "broker" => InfrastructureKind::Broker {
                    max_retries: 5,
                    retry_backoff: Duration::from_secs(30),
                },
                _ => InfrastructureKind::Inline,
            };
        }

        let services = ServiceBackends::from_file(file.services);
        let logging = LoggingConfig::from_file(file.logging);

        Self {
            infrastructure,
            services,
            logging,
            task_timeout,
        }
    }
}

#[cfg(test)]
mod inline_tests {
    use super::*;

    #[test]
    fn defaults_select_inline_infrastructure_and_memory_backends() {
        let config = Config::default();
        assert_eq!(config.infrastructure, InfrastructureKind::Inline);
        assert!(config.services.validate().is_ok());
    }
}
