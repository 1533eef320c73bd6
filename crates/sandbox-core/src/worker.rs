//! Worker pool draining the execution queue.
//!
//! `concurrency` workers share one broker and one executor. Each worker holds
//! at most one job at a time, so at most `concurrency` sandboxes exist per
//! process. A shared limiter additionally caps job starts at `concurrency`
//! per `rate_limit_window`. A reaper task periodically fails jobs left active
//! by a worker process that died.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::ExecutionStatus;
use crate::queue::{Broker, Job};
use crate::sandbox::CodeExecutor;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub concurrency: usize,
    /// How long one `dequeue` call waits before the worker rechecks shutdown.
    pub poll_timeout: Duration,
    pub rate_limit_window: Duration,
    /// Pause after a broker error before polling again.
    pub error_backoff: Duration,
    /// How often active jobs are checked for a dead worker; zero disables it.
    pub stalled_check_interval: Duration,
    /// Time beyond a job's own timeout before it counts as stalled.
    pub stalled_grace: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_timeout: Duration::from_secs(1),
            rate_limit_window: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            stalled_check_interval: Duration::from_secs(30),
            stalled_grace: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Starts are spaced `rate_limit_window / concurrency` apart with no
    /// burst, so no rolling window admits more than `concurrency` of them.
    /// A zero window leaves starts unlimited.
    fn job_rate_limiter(&self) -> Option<DefaultDirectRateLimiter> {
        let starts = u32::try_from(self.concurrency.max(1)).unwrap_or(u32::MAX);
        Quota::with_period(self.rate_limit_window / starts).map(RateLimiter::direct)
    }
}

pub struct WorkerPool {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        broker: Arc<dyn Broker>,
        executor: Arc<dyn CodeExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let limiter = config.job_rate_limiter().map(Arc::new);
        let concurrency = config.concurrency.max(1);

        let workers = (0..concurrency)
            .map(|index| {
                let worker = Worker {
                    index,
                    broker: Arc::clone(&broker),
                    executor: Arc::clone(&executor),
                    limiter: limiter.clone(),
                    shutdown: shutdown.clone(),
                    config: config.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        let reaper = (!config.stalled_check_interval.is_zero()).then(|| {
            tokio::spawn(reap_stalled(
                broker,
                shutdown.clone(),
                config.stalled_check_interval,
                config.stalled_grace,
            ))
        });

        log::info!("Worker pool started with {} workers", concurrency);
        Self {
            shutdown,
            workers,
            reaper,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Stop taking new jobs and wait for in-flight ones to be recorded.
    pub async fn shutdown(self) {
        log::info!("Shutting down worker pool");
        self.shutdown.cancel();
        for worker in self.workers.into_iter().chain(self.reaper) {
            if let Err(e) = worker.await {
                log::error!("Worker task ended abnormally: {}", e);
            }
        }
        log::info!("Worker pool stopped");
    }
}

async fn reap_stalled(
    broker: Arc<dyn Broker>,
    shutdown: CancellationToken,
    interval: Duration,
    grace: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match broker.fail_stalled(grace).await {
            Ok(reaped) if !reaped.is_empty() => {
                log::warn!("Failed {} stalled job(s): {:?}", reaped.len(), reaped);
            }
            Ok(_) => {}
            Err(e) => log::error!("Failed to check for stalled jobs: {}", e),
        }
    }
}

struct Worker {
    index: usize,
    broker: Arc<dyn Broker>,
    executor: Arc<dyn CodeExecutor>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    shutdown: CancellationToken,
    config: WorkerPoolConfig,
}

impl Worker {
    async fn run(self) {
        log::debug!("Worker {} started", self.index);
        while !self.shutdown.is_cancelled() {
            // dequeue is not raced against shutdown; a job taken is always processed
            let job = match self.broker.dequeue(self.config.poll_timeout).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    log::error!("Worker {} failed to poll the queue: {}", self.index, e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            if let Some(limiter) = &self.limiter {
                limiter.until_ready().await;
            }
            self.process(job).await;
        }
        log::debug!("Worker {} stopped", self.index);
    }

    async fn process(&self, job: Job) {
        log::info!(
            "Worker {} processing job {} ({})",
            self.index,
            job.id,
            job.data.language
        );

        let executor = Arc::clone(&self.executor);
        let request = job.data.clone();
        // run on its own task so a panic is caught as a JoinError
        let outcome = tokio::spawn(async move { executor.execute(&request).await }).await;

        let recorded = match outcome {
            Ok(Ok(result)) => {
                match result.status {
                    ExecutionStatus::Success => {
                        log::info!("Job {} completed in {}ms", job.id, result.runtime)
                    }
                    ExecutionStatus::Timeout => log::warn!("Job {} timed out", job.id),
                    ExecutionStatus::Error => {
                        log::warn!("Job {} finished with error: {}", job.id, result.stderr)
                    }
                }
                self.broker.complete(job.id, &result).await
            }
            Ok(Err(e)) => {
                log::error!("Job {} failed: {}", job.id, e);
                self.broker.fail(job.id, &e.to_string()).await
            }
            Err(e) => {
                let reason = if e.is_panic() {
                    "executor panicked"
                } else {
                    "executor task was cancelled"
                };
                log::error!("Job {} failed: {}", job.id, reason);
                self.broker.fail(job.id, reason).await
            }
        };

        if let Err(e) = recorded {
            log::error!("Failed to record outcome of job {}: {}", job.id, e);
        }
    }
}
