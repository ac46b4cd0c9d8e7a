// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub store: StoreConfig,
    pub generic_worker: GenericWorkerConfig,
    pub processors: ProcessorsConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub uri: String,
    pub database: String,
    pub connect_timeout_seconds: u64,
}

/// Worker manager configuration, one key per recognized option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericWorkerConfig {
    /// When false the manager does not start.
    pub active: bool,
    /// Hard ceiling on in-flight jobs.
    pub max_concurrent: u32,
    /// Polling cadence of the supervision loop.
    pub poll_interval_seconds: u64,
    /// Jobs in `processing` longer than this are failed by the stall sweep.
    pub stall_timeout_seconds: u64,
    /// Supervision iterations between stall sweeps.
    #[serde(default = "default_stall_check_every")]
    pub stall_check_every: u32,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_seconds: u64,
    /// Per-job log size cap; exceeding it drops the oldest half.
    #[serde(default = "default_log_entries_cap")]
    pub log_entries_cap: u32,
    /// Reported as the `worker` field of webhook payloads.
    #[serde(default = "default_worker_identity")]
    pub worker_identity: String,
}

fn default_stall_check_every() -> u32 {
    12
}

fn default_webhook_timeout() -> u64 {
    30
}

fn default_log_entries_cap() -> u32 {
    1000
}

fn default_worker_identity() -> String {
    "generic-worker".to_string()
}

/// External processing pipeline commands invoked by the worker binary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorsConfig {
    pub session_command: String,
    pub pdf_command: String,
    pub command_timeout_seconds: u64,
    pub workdir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
}

impl Settings {
    /// Load configuration with layered precedence: defaults file -> local file -> env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.store.uri.is_empty() {
            return Err("Store URI cannot be empty".to_string());
        }
        if self.store.database.is_empty() {
            return Err("Store database name cannot be empty".to_string());
        }

        if self.generic_worker.max_concurrent == 0 {
            return Err("Worker max_concurrent must be greater than 0".to_string());
        }
        if self.generic_worker.poll_interval_seconds == 0 {
            return Err("Worker poll_interval_seconds must be greater than 0".to_string());
        }
        if self.generic_worker.stall_timeout_seconds == 0 {
            return Err("Worker stall_timeout_seconds must be greater than 0".to_string());
        }
        if self.generic_worker.stall_check_every == 0 {
            return Err("Worker stall_check_every must be greater than 0".to_string());
        }
        if self.generic_worker.log_entries_cap < 2 {
            return Err("Worker log_entries_cap must be at least 2".to_string());
        }

        if self.processors.session_command.is_empty() {
            return Err("Processor session_command cannot be empty".to_string());
        }
        if self.processors.pdf_command.is_empty() {
            return Err("Processor pdf_command cannot be empty".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                uri: "mongodb://localhost:27017".to_string(),
                database: "mediaworks".to_string(),
                connect_timeout_seconds: 30,
            },
            generic_worker: GenericWorkerConfig {
                active: true,
                max_concurrent: 4,
                poll_interval_seconds: 5,
                stall_timeout_seconds: 1800,
                stall_check_every: 12,
                webhook_timeout_seconds: 30,
                log_entries_cap: 1000,
                worker_identity: "generic-worker".to_string(),
            },
            processors: ProcessorsConfig {
                session_command: "session-pipeline".to_string(),
                pdf_command: "pdf-pipeline".to_string(),
                command_timeout_seconds: 1500,
                workdir: "work".to_string(),
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
            },
        }
    }
}
