//! Service configuration types
//!
//! Every section has defaults matching a single-host deployment, so an empty
//! YAML document (or no file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::languages::LanguageRegistry;
use crate::model::{Language, RequestLimits};
use crate::queue::JobOptions;
use crate::sandbox::RunnerSettings;
use crate::security::is_memory_limit;
use crate::worker::WorkerPoolConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerSection,
    pub broker: BrokerSection,
    pub docker: DockerSection,
    pub execution: ExecutionSection,
    pub limits: RequestLimits,
    pub jobs: JobOptions,
    pub languages: LanguagesSection,
    pub security: SecuritySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub body_limit_bytes: usize,
    /// Added to a request's own timeout when waiting for its result.
    pub result_slack_ms: u64,
    pub enable_cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            request_timeout_secs: 30,
            body_limit_bytes: 1024 * 1024,
            result_slack_ms: 10_000,
            enable_cors: true,
        }
    }
}

impl ServerSection {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub kind: BrokerKind,
    pub redis_host: String,
    pub redis_port: u16,
    pub queue_name: String,
    pub poll_interval_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Redis,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            queue_name: "code-execution".to_string(),
            poll_interval_ms: 50,
        }
    }
}

impl BrokerSection {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}", self.redis_host, self.redis_port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    /// Engine socket; `None` uses the platform default.
    pub socket: Option<String>,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            socket: Some("/var/run/docker.sock".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    pub cpu_limit: f64,
    pub memory_limit: String,
    pub max_concurrent_jobs: usize,
    pub io_timeout_secs: u64,
    pub cleanup_timeout_secs: u64,
    pub tmpfs_size_mb: u32,
    pub worker_poll_timeout_ms: u64,
    /// Zero disables the check for jobs abandoned by a dead worker.
    pub stalled_check_interval_secs: u64,
    pub stalled_grace_secs: u64,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            cpu_limit: 0.5,
            memory_limit: "128m".to_string(),
            max_concurrent_jobs: 10,
            io_timeout_secs: 10,
            cleanup_timeout_secs: 5,
            tmpfs_size_mb: 8,
            worker_poll_timeout_ms: 1_000,
            stalled_check_interval_secs: 30,
            stalled_grace_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguagesSection {
    pub disabled: Vec<Language>,
    /// Runner image overrides per language.
    pub images: HashMap<Language, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    /// Send the syscall allow-list inline instead of relying on the engine default.
    pub inline_seccomp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let exec = &self.execution;
        if exec.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "execution.max_concurrent_jobs must be greater than 0".to_string(),
            ));
        }
        if !(exec.cpu_limit > 0.0 && exec.cpu_limit.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "execution.cpu_limit must be a positive number of cores (got {})",
                exec.cpu_limit
            )));
        }
        if !is_memory_limit(&exec.memory_limit) {
            return Err(ConfigError::Invalid(format!(
                "execution.memory_limit '{}' must look like 128m, 512k or 1g",
                exec.memory_limit
            )));
        }
        if exec.io_timeout_secs == 0 || exec.cleanup_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "execution.io_timeout_secs and execution.cleanup_timeout_secs must be greater than 0"
                    .to_string(),
            ));
        }
        if exec.tmpfs_size_mb == 0 {
            return Err(ConfigError::Invalid(
                "execution.tmpfs_size_mb must be greater than 0".to_string(),
            ));
        }

        let limits = &self.limits;
        if limits.min_timeout_ms == 0 || limits.min_timeout_ms > limits.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "limits timeout window {}..={}ms is empty",
                limits.min_timeout_ms, limits.max_timeout_ms
            )));
        }
        if !(limits.min_timeout_ms..=limits.max_timeout_ms).contains(&limits.default_timeout_ms) {
            return Err(ConfigError::Invalid(format!(
                "limits.default_timeout_ms {} is outside {}..={}ms",
                limits.default_timeout_ms, limits.min_timeout_ms, limits.max_timeout_ms
            )));
        }
        if limits.max_code_length == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_code_length must be greater than 0".to_string(),
            ));
        }

        if self.jobs.attempts != 1 {
            return Err(ConfigError::Invalid(
                "jobs.attempts must be 1; failed jobs are never retried".to_string(),
            ));
        }
        if self.broker.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.queue_name cannot be empty".to_string()));
        }
        if self.registry().languages().is_empty() {
            return Err(ConfigError::Invalid(
                "languages.disabled leaves no supported language".to_string(),
            ));
        }
        Ok(())
    }

    pub fn registry(&self) -> LanguageRegistry {
        let mut registry = LanguageRegistry::default();
        for (language, image) in &self.languages.images {
            registry = registry.with_image(*language, image.clone());
        }
        for language in &self.languages.disabled {
            registry = registry.without(*language);
        }
        registry
    }

    pub fn request_limits(&self) -> RequestLimits {
        self.limits.clone()
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            memory_limit: self.execution.memory_limit.clone(),
            cpu_limit: self.execution.cpu_limit,
            default_timeout_ms: self.limits.default_timeout_ms,
            io_timeout: Duration::from_secs(self.execution.io_timeout_secs),
            cleanup_timeout: Duration::from_secs(self.execution.cleanup_timeout_secs),
            tmpfs_size_mb: self.execution.tmpfs_size_mb,
            inline_seccomp: self.security.inline_seccomp,
        }
    }

    pub fn worker_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency: self.execution.max_concurrent_jobs,
            poll_timeout: Duration::from_millis(self.execution.worker_poll_timeout_ms),
            stalled_check_interval: Duration::from_secs(self.execution.stalled_check_interval_secs),
            stalled_grace: Duration::from_secs(self.execution.stalled_grace_secs),
            ..Default::default()
        }
    }
}
