//! Execution orchestration core for a multi-language code sandbox.
//!
//! Untrusted programs are accepted as jobs, queued in a broker and run by a
//! bounded worker pool, each in a fresh, locked-down container that is always
//! removed afterwards. Every job ends in exactly one `ExecutionResult`.
//!
//! # Architecture Overview
//!
//! - **Security policy**: resource ceilings, capability and syscall restrictions
//! - **Language registry**: per-language runner image and launch command
//! - **Log demultiplexing**: splitting the engine's framed log stream
//! - **Container runtime**: the engine seam, with a Docker implementation
//! - **Sandbox runner**: one request in, one container, one result out
//! - **Queue and worker pool**: durable jobs, exactly-once hand-off, bounded concurrency
//! - **Configuration system**: YAML with environment overrides

pub mod config;
pub mod demux;
pub mod errors;
pub mod languages;
pub mod model;
pub mod queue;
pub mod runtime;
pub mod sandbox;
pub mod security;
pub mod worker;

pub use config::{ConfigLoader, ServiceConfig};
pub use errors::{ConfigError, QueueError, RuntimeError, SandboxError, ValidationError};
pub use languages::LanguageRegistry;
pub use model::{ExecutionRequest, ExecutionResult, ExecutionStatus, Language, RequestLimits};
pub use queue::{Broker, ExecutionQueue, JobHandle, MemoryBroker, QueueCounts, RedisBroker};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use sandbox::{CodeExecutor, RunnerSettings, SandboxRunner};
pub use worker::{WorkerPool, WorkerPoolConfig};

#[cfg(test)]
pub mod test_utils;
