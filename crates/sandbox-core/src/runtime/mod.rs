//! Container engine boundary.
//!
//! The sandbox runner only talks to the engine through `ContainerRuntime`, so
//! a single client can be constructed at startup and shared by every worker.
//! `DockerRuntime` is the production implementation.

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::errors::RuntimeError;
use crate::security::ResourceLimits;

pub mod docker;

pub use docker::DockerRuntime;

/// Everything needed to create one sandbox container. Built per execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Option<String>,
    pub user: String,
    pub working_dir: String,
    pub network_disabled: bool,
    pub readonly_rootfs: bool,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub limits: ResourceLimits,
    /// Mount point to tmpfs options.
    pub tmpfs: BTreeMap<String, String>,
}

/// Point-in-time resource usage of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub memory_usage_bytes: Option<u64>,
    pub memory_max_usage_bytes: Option<u64>,
}

impl UsageSnapshot {
    /// Peak memory when the engine reports it, otherwise current usage.
    pub fn peak_memory_bytes(&self) -> u64 {
        self.memory_max_usage_bytes
            .or(self.memory_usage_bytes)
            .unwrap_or(0)
    }

    pub fn peak_memory_megabytes(&self) -> u64 {
        (self.peak_memory_bytes() as f64 / (1024.0 * 1024.0)).round() as u64
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create a container and return its id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Start the container, delivering `stdin` and closing it when given.
    async fn start(&self, id: &str, stdin: Option<&str>) -> Result<(), RuntimeError>;

    /// Resolve once the container has exited, with its exit code.
    async fn wait(&self, id: &str) -> Result<i64, RuntimeError>;

    /// Full log stream in the engine's multiplexed framing.
    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<UsageSnapshot, RuntimeError>;

    /// Stop without a grace period. Stopping an exited container succeeds.
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove. Removing a container that is already gone succeeds.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_memory_prefers_max_usage() {
        let snapshot = UsageSnapshot {
            memory_usage_bytes: Some(3 * 1024 * 1024),
            memory_max_usage_bytes: Some(10 * 1024 * 1024 + 100),
        };
        assert_eq!(snapshot.peak_memory_megabytes(), 10);

        let usage_only = UsageSnapshot {
            memory_usage_bytes: Some(1024 * 1024 + 600 * 1024),
            memory_max_usage_bytes: None,
        };
        assert_eq!(usage_only.peak_memory_megabytes(), 2);
        assert_eq!(UsageSnapshot::default().peak_memory_megabytes(), 0);
    }
}
