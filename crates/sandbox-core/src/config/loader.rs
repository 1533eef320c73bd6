//! Configuration loader for YAML files and environment overrides
//!
//! Precedence, lowest first: built-in defaults, the YAML file, then the
//! deployment environment variables. The result is validated before use.

use std::path::Path;
use std::str::FromStr;

use super::types::ServiceConfig;
use crate::errors::ConfigError;

pub const ENV_PORT: &str = "PORT";
pub const ENV_REDIS_HOST: &str = "REDIS_HOST";
pub const ENV_REDIS_PORT: &str = "REDIS_PORT";
pub const ENV_DOCKER_SOCKET: &str = "DOCKER_SOCKET";
pub const ENV_EXECUTION_TIMEOUT: &str = "EXECUTION_TIMEOUT";
pub const ENV_CPU_LIMIT: &str = "CPU_LIMIT";
pub const ENV_MEMORY_LIMIT: &str = "MEMORY_LIMIT";
pub const ENV_MAX_CONCURRENT_JOBS: &str = "MAX_CONCURRENT_JOBS";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `path` when given, otherwise start from defaults; then apply
    /// the process environment and validate.
    pub fn load(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
        let mut config = match path {
            Some(path) => Self::parse_file(path)?,
            None => ServiceConfig::default(),
        };
        Self::apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file with environment overrides applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ServiceConfig, ConfigError> {
        Self::load(Some(path.as_ref()))
    }

    /// Parse and validate a YAML document. The environment is not consulted.
    pub fn from_str(content: &str) -> Result<ServiceConfig, ConfigError> {
        let config = Self::parse_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse_str(&content)
    }

    fn parse_str(content: &str) -> Result<ServiceConfig, ConfigError> {
        // an empty document deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(ServiceConfig::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_env_overrides(config: &mut ServiceConfig) {
        Self::apply_overrides_with(config, |key| std::env::var(key).ok());
    }

    /// Apply overrides read through `lookup`. A value that does not parse
    /// leaves the current setting in place.
    pub fn apply_overrides_with<F>(config: &mut ServiceConfig, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, ENV_PORT, &mut config.server.port);
        override_string(&lookup, ENV_REDIS_HOST, &mut config.broker.redis_host);
        override_parsed(&lookup, ENV_REDIS_PORT, &mut config.broker.redis_port);
        if let Some(socket) = non_empty(&lookup, ENV_DOCKER_SOCKET) {
            config.docker.socket = Some(socket);
        }
        // the default applies to requests that carry no timeoutMs of their own
        override_parsed(
            &lookup,
            ENV_EXECUTION_TIMEOUT,
            &mut config.limits.default_timeout_ms,
        );
        override_parsed(&lookup, ENV_CPU_LIMIT, &mut config.execution.cpu_limit);
        override_string(&lookup, ENV_MEMORY_LIMIT, &mut config.execution.memory_limit);
        override_parsed(
            &lookup,
            ENV_MAX_CONCURRENT_JOBS,
            &mut config.execution.max_concurrent_jobs,
        );
        override_string(&lookup, ENV_LOG_LEVEL, &mut config.logging.level);
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn override_string<F>(lookup: &F, key: &str, target: &mut String)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = non_empty(lookup, key) {
        *target = value;
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = non_empty(lookup, key) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => log::warn!("Ignoring unparseable {}={:?}", key, raw),
    }
}
