//! Redis-backed broker shared by every API and worker process.
//!
//! Key layout under `sandbox:{queue}`:
//! - `:wait` and `:active` are lists of job ids; new ids are pushed on the
//!   left and taken from the right, so the list is FIFO.
//! - `:completed` and `:failed` are sorted sets scored by finish time (ms).
//! - `:job:{id}` holds the job as JSON.
//!
//! `LMOVE` from `:wait` to `:active` is atomic on the server, which is what
//! gives each job to exactly one worker. An id left in `:active` by a worker
//! process that died is failed by `fail_stalled`.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    expired_entries, Broker, Job, JobOptions, JobState, QueueCounts, RetentionPolicy, STALLED_REASON,
};
use crate::errors::QueueError;
use crate::model::ExecutionResult;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub struct RedisBroker {
    manager: ConnectionManager,
    prefix: String,
    options: JobOptions,
    poll_interval: Duration,
}

impl RedisBroker {
    pub async fn connect(
        url: &str,
        queue_name: &str,
        options: JobOptions,
        poll_interval: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        log::info!("Connected to Redis at {} (queue '{}')", url, queue_name);

        Ok(Self {
            manager,
            prefix: format!("sandbox:{}", queue_name),
            options,
            poll_interval,
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    async fn load(&self, id: Uuid) -> Result<Option<Job>, QueueError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(self.job_key(&id.to_string())).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn try_pop(&self) -> Result<Option<Job>, QueueError> {
        let mut conn = self.manager.clone();
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(self.key("wait"))
                .arg(self.key("active"))
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            let Some(id) = moved else {
                return Ok(None);
            };

            let raw: Option<String> = conn.get(self.job_key(&id)).await?;
            let Some(raw) = raw else {
                // job record was pruned or never written; drop the dangling id
                let _: () = conn.lrem(self.key("active"), 1, &id).await?;
                log::warn!("Dropped queue entry {} with no job record", id);
                continue;
            };

            let mut job: Job = serde_json::from_str(&raw)?;
            job.mark_active();
            let encoded = serde_json::to_string(&job)?;
            let _: () = conn.set(self.job_key(&id), encoded).await?;
            return Ok(Some(job));
        }
    }

    async fn finish(&self, id: Uuid, apply: impl FnOnce(&mut Job)) -> Result<(), QueueError> {
        let mut job = self
            .load(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        if job.state != JobState::Active {
            return Err(QueueError::JobNotFound(id.to_string()));
        }
        apply(&mut job);

        let (set_key, policy) = match job.state {
            JobState::Failed => (self.key("failed"), self.options.remove_on_fail),
            _ => (self.key("completed"), self.options.remove_on_complete),
        };
        let finished_ms = job
            .finished_at
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let id_str = id.to_string();
        let encoded = serde_json::to_string(&job)?;

        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&id_str), encoded)
            .ignore()
            .lrem(self.key("active"), 1, &id_str)
            .ignore()
            .zadd(&set_key, &id_str, finished_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        self.prune(&set_key, policy).await
    }

    async fn prune(&self, set_key: &str, policy: RetentionPolicy) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let scored: Vec<(String, f64)> = conn.zrange_withscores(set_key, 0, -1).await?;
        let entries: Vec<(Uuid, i64)> = scored
            .iter()
            .filter_map(|(id, score)| Uuid::parse_str(id).ok().map(|id| (id, *score as i64)))
            .collect();

        let expired = expired_entries(&entries, policy, chrono::Utc::now().timestamp_millis());
        if expired.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &expired {
            let id = id.to_string();
            pipe.del(self.job_key(&id)).ignore();
            pipe.zrem(set_key, id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        log::debug!("Pruned {} finished jobs from {}", expired.len(), set_key);
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let id = job.id.to_string();
        let encoded = serde_json::to_string(job)?;
        let mut conn = self.manager.clone();
        let _: () = redis::pipe()
            .atomic()
            .set(self.job_key(&id), encoded)
            .ignore()
            .lpush(self.key("wait"), &id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(job) = self.try_pop().await? {
                return Ok(Some(job));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((Instant::now() + self.poll_interval).min(deadline)).await;
        }
    }

    async fn complete(&self, id: Uuid, result: &ExecutionResult) -> Result<(), QueueError> {
        self.finish(id, |job| job.mark_completed(result.clone())).await
    }

    async fn fail(&self, id: Uuid, reason: &str) -> Result<(), QueueError> {
        self.finish(id, |job| job.mark_failed(reason)).await
    }

    async fn wait_finished(&self, id: Uuid, wait: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            match self.load(id).await? {
                Some(job) if job.is_finished() => return Ok(Some(job)),
                Some(_) => {}
                None => return Err(QueueError::JobNotFound(id.to_string())),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep_until((Instant::now() + self.poll_interval).min(deadline)).await;
        }
    }

    async fn fail_stalled(&self, grace: Duration) -> Result<Vec<Uuid>, QueueError> {
        let mut conn = self.manager.clone();
        let active: Vec<String> = conn.lrange(self.key("active"), 0, -1).await?;
        let now = chrono::Utc::now();

        let mut reaped = Vec::new();
        for raw_id in active {
            let Ok(id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            match self.load(id).await? {
                Some(job) if job.is_stalled(grace, now) => {
                    match self.finish(id, |job| job.mark_failed(STALLED_REASON)).await {
                        Ok(()) => reaped.push(id),
                        // finished by its worker in the meantime
                        Err(QueueError::JobNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Some(_) => {}
                None => {
                    let _: () = conn.lrem(self.key("active"), 1, &raw_id).await?;
                    log::warn!("Dropped active entry {} with no job record", raw_id);
                }
            }
        }
        Ok(reaped)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.manager.clone();
        let (waiting, active, completed, failed): (u64, u64, u64, u64) = redis::pipe()
            .llen(self.key("wait"))
            .llen(self.key("active"))
            .zcard(self.key("completed"))
            .zcard(self.key("failed"))
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts::new(waiting, active, completed, failed))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionRequest, Language};

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn broker(name: &str) -> RedisBroker {
        let queue = format!("test-{}-{}", name, Uuid::new_v4());
        RedisBroker::connect(&redis_url(), &queue, JobOptions::default(), Duration::from_millis(10))
            .await
            .expect("Redis should be reachable")
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_round_trip_through_redis() {
        let broker = broker("round-trip").await;
        broker.ping().await.unwrap();

        let job = Job::new(ExecutionRequest::new(Language::Go, "package main"));
        broker.enqueue(&job).await.unwrap();
        assert_eq!(broker.counts().await.unwrap(), QueueCounts::new(1, 0, 0, 0));

        let taken = broker.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(taken.id, job.id);
        assert_eq!(broker.counts().await.unwrap(), QueueCounts::new(0, 1, 0, 0));

        let result = ExecutionResult::success("ok".into(), String::new(), 40, 2);
        broker.complete(taken.id, &result).await.unwrap();
        let finished = broker
            .wait_finished(job.id, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(finished.result, Some(result));
        assert_eq!(broker.counts().await.unwrap(), QueueCounts::new(0, 0, 1, 0));
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_abandoned_active_job_is_failed() {
        let broker = broker("stalled").await;

        let job = Job::new(ExecutionRequest::new(Language::Python, "print(1)").with_timeout_ms(20));
        broker.enqueue(&job).await.unwrap();
        // taken by a worker that then disappears
        broker.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();

        let fresh = Job::new(ExecutionRequest::new(Language::Python, "print(2)").with_timeout_ms(5000));
        broker.enqueue(&fresh).await.unwrap();
        broker.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reaped = broker.fail_stalled(Duration::from_millis(10)).await.unwrap();
        assert_eq!(reaped, vec![job.id]);
        assert_eq!(broker.counts().await.unwrap(), QueueCounts::new(0, 1, 0, 1));

        let finished = broker.wait_finished(job.id, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(finished.failed_reason.as_deref(), Some(STALLED_REASON));
        assert!(broker.fail_stalled(Duration::from_millis(10)).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_empty_queue_dequeue_returns_none() {
        let broker = broker("empty").await;
        let taken = broker.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(taken.is_none());
    }
}
