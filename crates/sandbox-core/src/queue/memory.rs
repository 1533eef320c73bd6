//! In-process broker.
//!
//! Jobs live only as long as the process. Used when the service runs as a
//! single process and in tests; the hand-off guarantee comes from popping the
//! waiting queue under one mutex.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    expired_entries, Broker, Job, JobOptions, JobState, QueueCounts, RetentionPolicy, STALLED_REASON,
};
use crate::errors::QueueError;
use crate::model::ExecutionResult;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    waiting: VecDeque<Uuid>,
    active: usize,
    /// Finished ids with their finish time in epoch millis, oldest first.
    completed: VecDeque<(Uuid, i64)>,
    failed: VecDeque<(Uuid, i64)>,
}

pub struct MemoryBroker {
    inner: Mutex<Inner>,
    job_added: Notify,
    job_finished: Notify,
    options: JobOptions,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(JobOptions::default())
    }
}

impl MemoryBroker {
    pub fn new(options: JobOptions) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            job_added: Notify::new(),
            job_finished: Notify::new(),
            options,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // a panic while holding the lock leaves plain data behind; keep serving
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn try_pop(&self) -> Option<Job> {
        let mut inner = self.lock();
        while let Some(id) = inner.waiting.pop_front() {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.mark_active();
                let job = job.clone();
                inner.active += 1;
                return Some(job);
            }
        }
        None
    }

    fn finish(&self, id: Uuid, apply: impl FnOnce(&mut Job)) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
            if job.state != JobState::Active {
                return Err(QueueError::JobNotFound(id.to_string()));
            }
            apply(job);
            let state = job.state;
            let finished_ms = job
                .finished_at
                .map(|t| t.timestamp_millis())
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

            inner.active = inner.active.saturating_sub(1);
            let policy = match state {
                JobState::Failed => {
                    inner.failed.push_back((id, finished_ms));
                    self.options.remove_on_fail
                }
                _ => {
                    inner.completed.push_back((id, finished_ms));
                    self.options.remove_on_complete
                }
            };
            Self::prune(&mut inner, state, policy);
        }
        self.job_finished.notify_waiters();
        Ok(())
    }

    fn prune(inner: &mut Inner, state: JobState, policy: RetentionPolicy) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let set = match state {
            JobState::Failed => &mut inner.failed,
            _ => &mut inner.completed,
        };
        let entries: Vec<(Uuid, i64)> = set.iter().copied().collect();
        let expired = expired_entries(&entries, policy, now_ms);
        if expired.is_empty() {
            return;
        }
        set.retain(|(id, _)| !expired.contains(id));
        for id in expired {
            inner.jobs.remove(&id);
        }
    }

    fn finished_job(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let inner = self.lock();
        match inner.jobs.get(&id) {
            Some(job) if job.is_finished() => Ok(Some(job.clone())),
            Some(_) => Ok(None),
            None => Err(QueueError::JobNotFound(id.to_string())),
        }
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.lock().jobs.get(&id).cloned()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        {
            let mut inner = self.lock();
            inner.jobs.insert(job.id, job.clone());
            inner.waiting.push_back(job.id);
        }
        self.job_added.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_pop() {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.job_added.notified())
                .await
                .is_err()
            {
                return Ok(self.try_pop());
            }
        }
    }

    async fn complete(&self, id: Uuid, result: &ExecutionResult) -> Result<(), QueueError> {
        self.finish(id, |job| job.mark_completed(result.clone()))
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        self.finish(id, |job| job.mark_failed(reason))
    }

    async fn wait_finished(&self, id: Uuid, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.job_finished.notified();
            tokio::pin!(notified);
            // register before checking so a finish in between is not missed
            notified.as_mut().enable();

            if let Some(job) = self.finished_job(id)? {
                return Ok(Some(job));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn fail_stalled(&self, grace: Duration) -> Result<Vec<Uuid>, QueueError> {
        let now = chrono::Utc::now();
        let stalled: Vec<Uuid> = self
            .lock()
            .jobs
            .values()
            .filter(|job| job.is_stalled(grace, now))
            .map(|job| job.id)
            .collect();

        let mut reaped = Vec::with_capacity(stalled.len());
        for id in stalled {
            match self.finish(id, |job| job.mark_failed(STALLED_REASON)) {
                Ok(()) => reaped.push(id),
                // finished by its worker in the meantime
                Err(QueueError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reaped)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.lock();
        Ok(QueueCounts::new(
            inner.waiting.len() as u64,
            inner.active as u64,
            inner.completed.len() as u64,
            inner.failed.len() as u64,
        ))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
