//! Error types for the execution orchestration core
//!
//! Errors are grouped by the boundary they cross. Validation and queue errors
//! reach the HTTP layer; runtime errors stay inside the sandbox runner and are
//! folded into an `ExecutionResult` with status `error`. Only an unsupported
//! language escapes the runner as a `SandboxError`.

use thiserror::Error;

use crate::model::Language;

/// Request rejected before a job is ever queued.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("Code must not be empty")]
    EmptyCode,
    #[error("Code exceeds maximum length of {max} characters (got {actual})")]
    CodeTooLong { max: usize, actual: usize },
    #[error("Input exceeds maximum length of {max} characters (got {actual})")]
    StdinTooLong { max: usize, actual: usize },
    #[error("Timeout must be between {min}ms and {max}ms (got {actual}ms)")]
    TimeoutOutOfRange { min: u64, max: u64, actual: u64 },
}

/// Broker and job lifecycle failures.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Broker error: {0}")]
    Broker(#[from] redis::RedisError),
    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("Job {0} not found")]
    JobNotFound(String),
    #[error("Job failed: {0}")]
    JobFailed(String),
    #[error("Timed out waiting for job {0}")]
    WaitTimeout(String),
}

/// Faults raised by the container engine.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Docker engine error: {0}")]
    Bollard(#[from] bollard::errors::Error),
    #[error("I/O error during container operation: {0}")]
    Io(#[from] std::io::Error),
    #[error("Container operation '{operation}' timed out after {millis}ms")]
    OperationTimeout { operation: &'static str, millis: u64 },
    #[error("Container wait stream ended unexpectedly")]
    WaitStreamEnded,
    #[error("Container runtime error: {0}")]
    Other(String),
}

/// Configuration-level faults of the sandbox runner.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(Language),
}

/// Configuration loading and validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
