//! Durable job queue between the API boundary and the worker pool.
//!
//! A `Broker` owns every job from submission until it is pruned. Workers take
//! jobs through `Broker::dequeue`, which hands each waiting job to exactly one
//! caller; the core adds no locking of its own on top of that. Jobs get a
//! single attempt: a failed job is recorded as failed and never re-queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::errors::QueueError;
use crate::languages::LanguageRegistry;
use crate::model::{ExecutionRequest, ExecutionResult, RequestLimits};

pub mod memory;
pub mod redis_broker;

pub use memory::MemoryBroker;
pub use redis_broker::RedisBroker;

pub const JOB_NAME: &str = "execute-code";

/// Failure reason recorded for a job whose worker never reported back.
pub const STALLED_REASON: &str = "job stalled: its worker stopped before recording a result";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// How long finished jobs are kept around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub count: usize,
    pub age_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub attempts: u32,
    pub remove_on_complete: RetentionPolicy,
    pub remove_on_fail: RetentionPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            remove_on_complete: RetentionPolicy {
                count: 100,
                age_secs: 3600,
            },
            remove_on_fail: RetentionPolicy {
                count: 500,
                age_secs: 7200,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub data: ExecutionRequest,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts_made: u32,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    #[serde(default)]
    pub failed_reason: Option<String>,
}

impl Job {
    pub fn new(data: ExecutionRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: JOB_NAME.to_string(),
            data,
            state: JobState::Waiting,
            created_at: Utc::now(),
            processed_at: None,
            finished_at: None,
            attempts_made: 0,
            result: None,
            failed_reason: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, JobState::Completed | JobState::Failed)
    }

    /// Active for longer than its own timeout plus `grace`.
    pub fn is_stalled(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        let (JobState::Active, Some(started)) = (self.state, self.processed_at) else {
            return false;
        };
        let budget = Duration::from_millis(self.data.timeout_ms.unwrap_or(0)) + grace;
        match chrono::Duration::from_std(budget) {
            Ok(budget) => now - started > budget,
            Err(_) => false,
        }
    }

    pub(crate) fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.processed_at = Some(Utc::now());
        self.attempts_made += 1;
    }

    pub(crate) fn mark_completed(&mut self, result: ExecutionResult) {
        self.state = JobState::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub(crate) fn mark_failed(&mut self, reason: &str) {
        self.state = JobState::Failed;
        self.finished_at = Some(Utc::now());
        self.failed_reason = Some(reason.to_string());
    }

    /// The terminal value of a finished job.
    pub fn outcome(&self) -> Option<Result<ExecutionResult, QueueError>> {
        match self.state {
            JobState::Completed => Some(
                self.result
                    .clone()
                    .ok_or_else(|| QueueError::JobFailed("completed without a result".to_string())),
            ),
            JobState::Failed => Some(Err(QueueError::JobFailed(
                self.failed_reason.clone().unwrap_or_else(|| "unknown failure".to_string()),
            ))),
            JobState::Waiting | JobState::Active => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl QueueCounts {
    pub fn new(waiting: u64, active: u64, completed: u64, failed: u64) -> Self {
        Self {
            waiting,
            active,
            completed,
            failed,
            total: waiting + active,
        }
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Move the oldest waiting job to active and return it, waiting up to
    /// `wait` for one to arrive.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError>;

    async fn complete(&self, id: Uuid, result: &ExecutionResult) -> Result<(), QueueError>;

    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError>;

    /// Wait up to `wait` for the job to finish. `None` when it is still pending.
    async fn wait_finished(&self, id: Uuid, wait: Duration) -> Result<Option<Job>, QueueError>;

    /// Fail every active job that has been running for longer than its
    /// timeout plus `grace`, which means its worker died mid-job. Returns the
    /// ids that were failed.
    async fn fail_stalled(&self, grace: Duration) -> Result<Vec<Uuid>, QueueError>;

    /// Point-in-time counts; never mutates state.
    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    async fn ping(&self) -> Result<(), QueueError>;
}

/// Submission side of the queue, used by the API boundary.
#[derive(Clone)]
pub struct ExecutionQueue {
    broker: Arc<dyn Broker>,
    registry: Arc<LanguageRegistry>,
    limits: RequestLimits,
}

impl ExecutionQueue {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<LanguageRegistry>,
        limits: RequestLimits,
    ) -> Self {
        Self {
            broker,
            registry,
            limits,
        }
    }

    pub fn limits(&self) -> &RequestLimits {
        &self.limits
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Validate and enqueue a request. Oversize or unsupported requests never
    /// reach the broker.
    pub async fn submit(&self, mut request: ExecutionRequest) -> Result<JobHandle, QueueError> {
        request.validate(&self.limits, &self.registry)?;
        request.timeout_ms = Some(request.effective_timeout_ms(&self.limits));

        let job = Job::new(request);
        self.broker.enqueue(&job).await?;
        log::info!("Job {} queued ({})", job.id, job.data.language);

        Ok(JobHandle {
            id: job.id,
            broker: Arc::clone(&self.broker),
        })
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        self.broker.counts().await
    }

    pub async fn ping(&self) -> Result<(), QueueError> {
        self.broker.ping().await
    }
}

/// Handle to one submitted job.
pub struct JobHandle {
    id: Uuid,
    broker: Arc<dyn Broker>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the job's result, failing with `WaitTimeout` after `deadline`.
    pub async fn wait(&self, deadline: Duration) -> Result<ExecutionResult, QueueError> {
        match self.broker.wait_finished(self.id, deadline).await? {
            Some(job) => job
                .outcome()
                .unwrap_or_else(|| Err(QueueError::WaitTimeout(self.id.to_string()))),
            None => Err(QueueError::WaitTimeout(self.id.to_string())),
        }
    }
}

/// Ids to drop from a finished set ordered oldest first, given each entry's
/// finish time in epoch milliseconds.
pub(crate) fn expired_entries(
    finished: &[(Uuid, i64)],
    policy: RetentionPolicy,
    now_ms: i64,
) -> Vec<Uuid> {
    let cutoff = now_ms - (policy.age_secs as i64) * 1000;
    let excess = finished.len().saturating_sub(policy.count);
    finished
        .iter()
        .enumerate()
        .filter(|(idx, (_, finished_ms))| *idx < excess || *finished_ms < cutoff)
        .map(|(_, (id, _))| *id)
        .collect()
}
