use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::guard::{bounded, cleanup_container, ContainerGuard};
use super::spec::build_container_spec;
use super::{CodeExecutor, RunnerSettings};
use crate::demux::{demux, DemuxedOutput};
use crate::errors::{RuntimeError, SandboxError};
use crate::languages::LanguageRegistry;
use crate::model::{ExecutionRequest, ExecutionResult, Language};
use crate::runtime::ContainerRuntime;
use crate::security::SecurityProfile;

/// How a single container run ended, before it is shaped into a result.
enum Outcome {
    Completed {
        exit_code: i64,
        output: DemuxedOutput,
        memory_mb: u64,
        runtime_ms: u64,
    },
    TimedOut {
        runtime_ms: u64,
    },
    Failed {
        error: RuntimeError,
        runtime_ms: u64,
    },
}

pub struct SandboxRunner {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<LanguageRegistry>,
    security: SecurityProfile,
    settings: RunnerSettings,
}

impl SandboxRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<LanguageRegistry>,
        settings: RunnerSettings,
    ) -> Result<Self, serde_json::Error> {
        let mut security = SecurityProfile::new(&settings.memory_limit, settings.cpu_limit);
        if settings.inline_seccomp {
            security = security.with_inline_seccomp()?;
        }
        Ok(Self {
            runtime,
            registry,
            security,
            settings,
        })
    }

    /// Run `code` in a fresh container and report how it went.
    ///
    /// Only an unsupported language is returned as `Err`; every failure of
    /// the container lifecycle becomes a result with status `error`.
    pub async fn execute_code(
        &self,
        language: Language,
        code: &str,
        stdin: &str,
        timeout_ms: u64,
    ) -> Result<ExecutionResult, SandboxError> {
        let lang_runtime = self
            .registry
            .get(language)
            .ok_or(SandboxError::UnsupportedLanguage(language))?;

        let spec = build_container_spec(
            lang_runtime,
            &self.security,
            code,
            stdin,
            self.settings.tmpfs_size_mb,
        );

        let start = Instant::now();
        log::info!("Creating container for {} (timeout {}ms)", language, timeout_ms);

        let outcome = match bounded("create", self.settings.io_timeout, self.runtime.create(&spec)).await {
            Ok(id) => {
                let guard = ContainerGuard::new(
                    Arc::clone(&self.runtime),
                    id,
                    self.settings.cleanup_timeout,
                );
                let outcome = self
                    .run_container(guard.id(), spec.stdin.as_deref(), timeout_ms, start)
                    .await;
                guard.release().await;
                outcome
            }
            Err(error) => {
                // a timed-out or interrupted create may still leave a container behind
                cleanup_container(self.runtime.as_ref(), &spec.name, self.settings.cleanup_timeout)
                    .await;
                Outcome::Failed {
                    error,
                    runtime_ms: elapsed_ms(start),
                }
            }
        };

        Ok(self.into_result(language, timeout_ms, outcome))
    }

    async fn run_container(
        &self,
        id: &str,
        stdin: Option<&str>,
        timeout_ms: u64,
        start: Instant,
    ) -> Outcome {
        let io_timeout = self.settings.io_timeout;

        if let Err(error) = bounded("start", io_timeout, self.runtime.start(id, stdin)).await {
            return Outcome::Failed {
                error,
                runtime_ms: elapsed_ms(start),
            };
        }
        log::info!("Container {} started", id);

        let exited = tokio::select! {
            res = self.runtime.wait(id) => Some(res),
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
        };

        let exit_code = match exited {
            None => {
                return Outcome::TimedOut {
                    runtime_ms: elapsed_ms(start),
                }
            }
            Some(Err(error)) => {
                return Outcome::Failed {
                    error,
                    runtime_ms: elapsed_ms(start),
                }
            }
            Some(Ok(code)) => code,
        };

        let raw_logs = match bounded("logs", io_timeout, self.runtime.logs(id)).await {
            Ok(raw) => raw,
            Err(error) => {
                return Outcome::Failed {
                    error,
                    runtime_ms: elapsed_ms(start),
                }
            }
        };
        let output = demux(&raw_logs);
        let runtime_ms = elapsed_ms(start);

        let usage = match bounded("stats", io_timeout, self.runtime.stats(id)).await {
            Ok(usage) => usage,
            Err(error) => return Outcome::Failed { error, runtime_ms },
        };

        Outcome::Completed {
            exit_code,
            output,
            memory_mb: usage.peak_memory_megabytes(),
            runtime_ms,
        }
    }

    fn into_result(&self, language: Language, timeout_ms: u64, outcome: Outcome) -> ExecutionResult {
        match outcome {
            Outcome::Completed {
                exit_code,
                output,
                memory_mb,
                runtime_ms,
            } => {
                log::info!(
                    "Execution completed: language={} runtime={}ms memory={}mb exit_code={}",
                    language,
                    runtime_ms,
                    memory_mb,
                    exit_code
                );
                ExecutionResult::success(output.stdout, output.stderr, runtime_ms, memory_mb)
            }
            Outcome::TimedOut { runtime_ms } => {
                log::warn!("Execution timeout: language={} timeout={}ms", language, timeout_ms);
                ExecutionResult::timeout(timeout_ms, runtime_ms)
            }
            Outcome::Failed { error, runtime_ms } => {
                log::error!("Execution error: language={} error={}", language, error);
                ExecutionResult::error(error.to_string(), runtime_ms)
            }
        }
    }
}

#[async_trait]
impl CodeExecutor for SandboxRunner {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let timeout_ms = request.timeout_ms.unwrap_or(self.settings.default_timeout_ms);
        self.execute_code(request.language, &request.code, &request.stdin, timeout_ms)
            .await
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExecutionStatus;
    use crate::test_utils::mock_runtime::MockRuntime;

    fn runner_with(mock: Arc<MockRuntime>, registry: LanguageRegistry) -> SandboxRunner {
        let settings = RunnerSettings {
            io_timeout: Duration::from_millis(500),
            cleanup_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        SandboxRunner::new(mock, Arc::new(registry), settings).unwrap()
    }

    fn runner(mock: Arc<MockRuntime>) -> SandboxRunner {
        runner_with(mock, LanguageRegistry::default())
    }

    #[tokio::test]
    async fn test_success_for_every_language() {
        for language in Language::ALL {
            let mock = Arc::new(MockRuntime::new());
            mock.configure(|b| {
                b.stdout = "Hello, World!\n".to_string();
                b.memory_bytes = 5 * 1024 * 1024;
            });
            let result = runner(mock.clone())
                .execute_code(language, "trivial program", "", 2000)
                .await
                .unwrap();

            assert_eq!(result.status, ExecutionStatus::Success, "{}", language);
            assert_eq!(result.stdout, "Hello, World!");
            assert_eq!(result.memory, 5);
            assert_eq!(mock.live_containers(), 0);
            assert_eq!(mock.removed().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_still_success() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| {
            b.exit_code = 1;
            b.stderr = "  Traceback: boom \n".to_string();
        });
        let result = runner(mock)
            .execute_code(Language::Python, "raise Exception('boom')", "", 2000)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stderr, "Traceback: boom");
    }

    #[tokio::test]
    async fn test_timeout_reports_and_removes_container() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| {
            b.run_for = Duration::from_secs(30);
            b.stdout = "never".to_string();
        });
        let result = runner(mock.clone())
            .execute_code(Language::Python, "while True: pass", "", 100)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "Execution exceeded timeout of 100ms");
        assert_eq!(result.memory, 0);
        assert!(result.runtime >= 100);
        assert_eq!(mock.live_containers(), 0);
        assert_eq!(mock.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_language_fails_before_create() {
        let mock = Arc::new(MockRuntime::new());
        let runner = runner_with(mock.clone(), LanguageRegistry::default().without(Language::Java));

        let err = runner
            .execute_code(Language::Java, "class Main {}", "", 2000)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedLanguage(Language::Java)));
        assert_eq!(mock.created(), 0);
    }

    #[tokio::test]
    async fn test_create_failure_becomes_error_result() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| b.fail_create = Some("no such image".to_string()));
        let result = runner(mock.clone())
            .execute_code(Language::Go, "package main", "", 2000)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stdout, "");
        assert!(result.stderr.contains("no such image"));
        assert_eq!(result.memory, 0);
        assert_eq!(mock.created(), 0);
        assert_eq!(mock.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_slow_create_is_bounded_and_leaves_nothing_behind() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| b.slow_create = Some(Duration::from_millis(300)));
        let settings = RunnerSettings {
            io_timeout: Duration::from_millis(50),
            cleanup_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let runner =
            SandboxRunner::new(mock.clone(), Arc::new(LanguageRegistry::default()), settings).unwrap();

        let result = runner
            .execute_code(Language::Python, "print(1)", "", 2000)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.stderr.contains("'create' timed out"), "{}", result.stderr);
        assert_eq!(mock.created(), 1);
        assert_eq!(mock.live_containers(), 0);
        assert_eq!(mock.removed().len(), 1);
    }

    #[tokio::test]
    async fn test_log_failure_becomes_error_and_still_cleans_up() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| b.fail_logs = Some("log driver unavailable".to_string()));
        let result = runner(mock.clone())
            .execute_code(Language::Javascript, "console.log(1)", "", 2000)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.stderr.contains("log driver unavailable"));
        assert_eq!(mock.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_change_result() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| {
            b.stdout = "ok".to_string();
            b.fail_stop = true;
            b.fail_remove = true;
        });
        let result = runner(mock.clone())
            .execute_code(Language::Python, "print('ok')", "", 2000)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "ok");
    }

    #[tokio::test]
    async fn test_hanging_cleanup_is_bounded() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| {
            b.stdout = "done".to_string();
            b.hang_stop = true;
        });
        let started = Instant::now();
        let result = runner(mock.clone())
            .execute_code(Language::Python, "print('done')", "", 2000)
            .await
            .unwrap();

        assert_eq!(result.stdout, "done");
        assert!(started.elapsed() < Duration::from_secs(2));
        // remove still runs after the stop call gave up
        assert_eq!(mock.live_containers(), 0);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered_only_when_present() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| b.echo_stdin = true);
        let runner = runner(mock.clone());

        let result = runner
            .execute_code(Language::Cpp, "int main(){}", "3 4\n", 2000)
            .await
            .unwrap();
        assert_eq!(result.stdout, "3 4");

        runner
            .execute_code(Language::Cpp, "int main(){}", "", 2000)
            .await
            .unwrap();
        assert_eq!(mock.stdin_seen(), vec![Some("3 4\n".to_string()), None]);
    }

    #[tokio::test]
    async fn test_executor_uses_default_timeout() {
        let mock = Arc::new(MockRuntime::new());
        mock.configure(|b| b.stdout = "x".to_string());
        let runner = runner(mock.clone());

        let request = ExecutionRequest::new(Language::Python, "print('x')");
        let result = runner.execute(&request).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success);

        let spec = mock.last_spec().unwrap();
        assert_eq!(spec.cmd, vec!["python3", "-c", "print('x')"]);
        assert!(spec.security_opt.contains(&"no-new-privileges:true".to_string()));
    }
}
