// src/test_utils/mock_runtime.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::demux::{encode_frame, StreamKind};
use crate::errors::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, UsageSnapshot};

/// What the scripted engine does with every container it creates.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub run_for: Duration,
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub memory_bytes: u64,
    pub echo_stdin: bool,
    pub fail_create: Option<String>,
    /// Register the container, then stall `create` for this long.
    pub slow_create: Option<Duration>,
    pub fail_logs: Option<String>,
    pub fail_stop: bool,
    pub fail_remove: bool,
    pub hang_stop: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            run_for: Duration::from_millis(5),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            memory_bytes: 0,
            echo_stdin: false,
            fail_create: None,
            slow_create: None,
            fail_logs: None,
            fail_stop: false,
            fail_remove: false,
            hang_stop: false,
        }
    }
}

#[derive(Default)]
struct MockState {
    live: HashMap<String, Option<String>>,
    created: usize,
    max_live: usize,
    stop_calls: usize,
    removed: Vec<String>,
    stdin_seen: Vec<Option<String>>,
    specs: Vec<ContainerSpec>,
}

/// In-process `ContainerRuntime` that records what the runner asked for.
#[derive(Default)]
pub struct MockRuntime {
    behavior: Mutex<MockBehavior>,
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn live_containers(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn max_live_containers(&self) -> usize {
        self.state.lock().unwrap().max_live
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap().stop_calls
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn stdin_seen(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().stdin_seen.clone()
    }

    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.state.lock().unwrap().specs.last().cloned()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let behavior = self.behavior();
        if let Some(message) = behavior.fail_create {
            return Err(RuntimeError::Other(message));
        }
        // the engine addresses containers by name as well as by id
        let id = spec.name.clone();
        {
            let mut state = self.state.lock().unwrap();
            state.live.insert(id.clone(), None);
            state.created += 1;
            state.max_live = state.max_live.max(state.live.len());
            state.specs.push(spec.clone());
        }
        if let Some(delay) = behavior.slow_create {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start(&self, id: &str, stdin: Option<&str>) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.stdin_seen.push(stdin.map(str::to_string));
        match state.live.get_mut(id) {
            Some(slot) => {
                *slot = stdin.map(str::to_string);
                Ok(())
            }
            None => Err(RuntimeError::Other(format!("no such container: {}", id))),
        }
    }

    async fn wait(&self, _id: &str) -> Result<i64, RuntimeError> {
        let behavior = self.behavior();
        tokio::time::sleep(behavior.run_for).await;
        Ok(behavior.exit_code)
    }

    async fn logs(&self, id: &str) -> Result<Vec<u8>, RuntimeError> {
        let behavior = self.behavior();
        if let Some(message) = behavior.fail_logs {
            return Err(RuntimeError::Other(message));
        }

        let stdout = if behavior.echo_stdin {
            let state = self.state.lock().unwrap();
            state.live.get(id).cloned().flatten().unwrap_or_default()
        } else {
            behavior.stdout
        };

        let mut raw = Vec::new();
        encode_frame(StreamKind::Stdout, stdout.as_bytes(), &mut raw);
        encode_frame(StreamKind::Stderr, behavior.stderr.as_bytes(), &mut raw);
        Ok(raw)
    }

    async fn stats(&self, _id: &str) -> Result<UsageSnapshot, RuntimeError> {
        Ok(UsageSnapshot {
            memory_usage_bytes: Some(self.behavior().memory_bytes),
            memory_max_usage_bytes: None,
        })
    }

    async fn stop(&self, _id: &str) -> Result<(), RuntimeError> {
        let behavior = self.behavior();
        self.state.lock().unwrap().stop_calls += 1;
        if behavior.hang_stop {
            std::future::pending::<()>().await;
        }
        if behavior.fail_stop {
            return Err(RuntimeError::Other("stop refused".to_string()));
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        if self.behavior().fail_remove {
            return Err(RuntimeError::Other("remove refused".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        state.live.remove(id);
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }
}
