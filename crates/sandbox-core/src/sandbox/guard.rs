//! Scoped ownership of a sandbox container.
//!
//! A `ContainerGuard` is created as soon as the engine hands back a container
//! id. `release` stops and force-removes the container; if the guard is
//! dropped unreleased (the task was cancelled or panicked) the same cleanup
//! is spawned onto the current tokio runtime. Cleanup faults are logged and
//! never returned.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::RuntimeError;
use crate::runtime::ContainerRuntime;

pub struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: Option<String>,
    cleanup_timeout: Duration,
}

impl ContainerGuard {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, id: String, cleanup_timeout: Duration) -> Self {
        Self {
            runtime,
            id: Some(id),
            cleanup_timeout,
        }
    }

    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Stop and remove the container. Returns whether both steps succeeded.
    pub async fn release(mut self) -> bool {
        match self.id.take() {
            Some(id) => cleanup_container(self.runtime.as_ref(), &id, self.cleanup_timeout).await,
            None => true,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("Container {} dropped without release, cleaning up in background", id);
                let runtime = Arc::clone(&self.runtime);
                let timeout = self.cleanup_timeout;
                handle.spawn(async move {
                    cleanup_container(runtime.as_ref(), &id, timeout).await;
                });
            }
            Err(_) => {
                log::error!("Container {} leaked: no async runtime available for cleanup", id);
            }
        }
    }
}

/// Best-effort stop (no grace period) followed by a forced remove.
pub async fn cleanup_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
    timeout: Duration,
) -> bool {
    let stopped = match bounded("stop", timeout, runtime.stop(id)).await {
        Ok(()) => true,
        Err(e) => {
            log::error!("Container {} stop failed: {}", id, e);
            false
        }
    };

    let removed = match bounded("remove", timeout, runtime.remove(id)).await {
        Ok(()) => true,
        Err(e) => {
            log::error!("Container {} cleanup failed: {}", id, e);
            false
        }
    };

    if removed {
        log::info!("Container {} cleaned up", id);
    }
    stopped && removed
}

/// Run an engine call with an upper bound on its duration.
pub(crate) async fn bounded<T, F>(
    operation: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, RuntimeError>
where
    F: Future<Output = Result<T, RuntimeError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::OperationTimeout {
            operation,
            millis: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageRegistry;
    use crate::model::Language;
    use crate::sandbox::spec::build_container_spec;
    use crate::security::SecurityProfile;
    use crate::test_utils::mock_runtime::MockRuntime;

    const CLEANUP: Duration = Duration::from_millis(200);

    async fn created(mock: &MockRuntime) -> String {
        let registry = LanguageRegistry::default();
        let spec = build_container_spec(
            registry.get(Language::Python).unwrap(),
            &SecurityProfile::new("128m", 0.5),
            "print(1)",
            "",
            8,
        );
        mock.create(&spec).await.unwrap()
    }

    #[tokio::test]
    async fn test_cleanup_twice_is_harmless() {
        let mock = MockRuntime::new();
        let id = created(&mock).await;

        assert!(cleanup_container(&mock, &id, CLEANUP).await);
        assert!(cleanup_container(&mock, &id, CLEANUP).await);
        assert_eq!(mock.live_containers(), 0);
        assert_eq!(mock.stop_calls(), 2);
    }

    #[tokio::test]
    async fn test_release_reports_refused_remove() {
        let mock = Arc::new(MockRuntime::new());
        let id = created(&mock).await;
        mock.configure(|b| b.fail_remove = true);

        let guard = ContainerGuard::new(mock.clone(), id.clone(), CLEANUP);
        assert_eq!(guard.id(), id);
        assert!(!guard.release().await);
        assert_eq!(mock.live_containers(), 1);
    }

    #[tokio::test]
    async fn test_hanging_stop_is_bounded() {
        let mock = MockRuntime::new();
        let id = created(&mock).await;
        mock.configure(|b| b.hang_stop = true);

        let cleaned = cleanup_container(&mock, &id, Duration::from_millis(50)).await;
        assert!(!cleaned);
        // remove still runs after stop gave up
        assert_eq!(mock.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_unreleased_guard_cleans_up_in_background() {
        let mock = Arc::new(MockRuntime::new());
        let id = created(&mock).await;

        drop(ContainerGuard::new(mock.clone(), id.clone(), CLEANUP));

        for _ in 0..50 {
            if mock.live_containers() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mock.live_containers(), 0);
        assert_eq!(mock.removed(), vec![id]);
    }
}
