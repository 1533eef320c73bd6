//! Sandboxed code execution.
//!
//! `SandboxRunner` turns one request into exactly one `ExecutionResult`. Faults
//! of the container lifecycle are reported inside the result; only a language
//! missing from the registry is returned as an error, and that check happens
//! before the engine is touched.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::SandboxError;
use crate::model::{ExecutionRequest, ExecutionResult};

pub mod guard;
pub mod runner;
pub mod spec;

pub use guard::ContainerGuard;
pub use runner::SandboxRunner;

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}

/// Tunables of the sandbox runner, derived from service configuration.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub memory_limit: String,
    pub cpu_limit: f64,
    pub default_timeout_ms: u64,
    /// Bound on create, start, log and stats calls.
    pub io_timeout: Duration,
    /// Bound on each of the stop and remove calls.
    pub cleanup_timeout: Duration,
    pub tmpfs_size_mb: u32,
    pub inline_seccomp: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            memory_limit: "128m".to_string(),
            cpu_limit: 0.5,
            default_timeout_ms: 2_000,
            io_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(5),
            tmpfs_size_mb: 8,
            inline_seccomp: false,
        }
    }
}
