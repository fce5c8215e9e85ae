use std::time::Duration;

use chrono::{DateTime, Utc};
use fred::interfaces::{HashesInterface, ListInterface, SortedSetsInterface};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Redis key layout. A hash keyed by release id gives idempotent enqueue; a
/// list carries FIFO ready order; sorted sets hold leases and delayed retries
/// scored by their expiry/due time in epoch millis.
pub const JOBS: &str = "enclii:queue:jobs";
pub const READY: &str = "enclii:queue:ready";
pub const LEASED: &str = "enclii:queue:leased";
pub const DELAYED: &str = "enclii:queue:delayed";
pub const DEAD: &str = "enclii:queue:dead";

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(#[from] fred::error::Error),

    #[error("malformed job for release {0}")]
    Malformed(Uuid),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildJob {
    pub release_id: Uuid,
    pub service_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

impl BuildJob {
    pub fn new(release_id: Uuid, service_id: Uuid) -> Self {
        Self {
            release_id,
            service_id,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// Outcome of an ack attempt. A late ack after the lease expired is rejected
/// so a second worker's takeover cannot be double-advanced.
#[derive(Debug, PartialEq, Eq)]
pub enum AckOutcome {
    Acked,
    RejectedLate,
}

/// Durable at-least-once FIFO of build jobs, keyed by release id.
#[derive(Clone)]
pub struct WorkQueue {
    valkey: fred::clients::Pool,
}

impl WorkQueue {
    pub fn new(valkey: fred::clients::Pool) -> Self {
        Self { valkey }
    }

    /// Idempotent enqueue: re-enqueuing an already-queued release is a no-op.
    /// Returns true when the job was newly queued.
    #[tracing::instrument(skip(self, job), fields(release_id = %job.release_id), err)]
    pub async fn enqueue(&self, job: &BuildJob) -> Result<bool, QueueError> {
        let json = serde_json::to_string(job).expect("job serializes");
        let field = job.release_id.to_string();

        let inserted: bool = self
            .valkey
            .hsetnx(JOBS, field.as_str(), json.as_str())
            .await?;
        if inserted {
            let _: i64 = self.valkey.lpush(READY, vec![field]).await?;
        }
        Ok(inserted)
    }

    /// Pop the oldest ready job and lease it for `visibility_timeout`.
    /// Bumps `attempt` on every reserve.
    pub async fn reserve(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<BuildJob>, QueueError> {
        loop {
            let popped: Option<String> = self.valkey.rpop(READY, None).await?;
            let Some(field) = popped else {
                return Ok(None);
            };

            let json: Option<String> = self.valkey.hget(JOBS, field.as_str()).await?;
            let Some(json) = json else {
                // Job was acked or dead-lettered while still in the ready
                // list; skip the stale entry.
                continue;
            };

            let mut job: BuildJob = serde_json::from_str(&json)
                .map_err(|_| QueueError::Malformed(field.parse().unwrap_or(Uuid::nil())))?;
            job.attempt += 1;

            let updated = serde_json::to_string(&job).expect("job serializes");
            let _: () = self.valkey.hset(JOBS, (field.as_str(), updated.as_str())).await?;

            let expires = epoch_ms(Utc::now()) + visibility_timeout.as_millis() as i64;
            let _: () = self
                .valkey
                .zadd(LEASED, None, None, false, false, (expires as f64, field.as_str()))
                .await?;

            return Ok(Some(job));
        }
    }

    /// Idempotent ack. Only accepted while the lease is still held.
    #[tracing::instrument(skip(self, job), fields(release_id = %job.release_id), err)]
    pub async fn ack(&self, job: &BuildJob) -> Result<AckOutcome, QueueError> {
        let field = job.release_id.to_string();

        let leased: Option<f64> = self.valkey.zscore(LEASED, field.as_str()).await?;
        if leased.is_none() {
            tracing::warn!(release_id = %job.release_id, "late ack rejected");
            return Ok(AckOutcome::RejectedLate);
        }

        let _: () = self.valkey.zrem(LEASED, field.as_str()).await?;
        let _: () = self.valkey.hdel(JOBS, field.as_str()).await?;
        Ok(AckOutcome::Acked)
    }

    /// Return a leased job for a delayed retry.
    #[tracing::instrument(skip(self, job), fields(release_id = %job.release_id), err)]
    pub async fn nack(&self, job: &BuildJob, retry_after: Duration) -> Result<(), QueueError> {
        let field = job.release_id.to_string();

        let removed: i64 = self.valkey.zrem(LEASED, field.as_str()).await?;
        if removed == 0 {
            // Lease already expired and the sweeper requeued it.
            return Ok(());
        }

        let due = epoch_ms(Utc::now()) + retry_after.as_millis() as i64;
        let _: () = self
            .valkey
            .zadd(DELAYED, None, None, false, false, (due as f64, field.as_str()))
            .await?;
        Ok(())
    }

    /// Return a job whose turn simply hasn't come (the service's
    /// single-flight key is held) without consuming retry budget: the
    /// reserve's attempt bump is undone before the delayed requeue.
    pub async fn defer(&self, job: &BuildJob, retry_after: Duration) -> Result<(), QueueError> {
        let field = job.release_id.to_string();

        let removed: i64 = self.valkey.zrem(LEASED, field.as_str()).await?;
        if removed == 0 {
            return Ok(());
        }

        let mut unbumped = job.clone();
        unbumped.attempt = unbumped.attempt.saturating_sub(1);
        let json = serde_json::to_string(&unbumped).expect("job serializes");
        let _: () = self
            .valkey
            .hset(JOBS, (field.as_str(), json.as_str()))
            .await?;

        let due = epoch_ms(Utc::now()) + retry_after.as_millis() as i64;
        let _: () = self
            .valkey
            .zadd(DELAYED, None, None, false, false, (due as f64, field.as_str()))
            .await?;
        Ok(())
    }

    /// Move a job to the dead-letter list. The caller records the audit event
    /// and fails the release.
    #[tracing::instrument(skip(self, job), fields(release_id = %job.release_id, reason), err)]
    pub async fn dead_letter(&self, job: &BuildJob, reason: &str) -> Result<(), QueueError> {
        let field = job.release_id.to_string();

        let entry = serde_json::json!({
            "job": job,
            "reason": reason,
            "dead_lettered_at": Utc::now(),
        })
        .to_string();

        let _: () = self.valkey.zrem(LEASED, field.as_str()).await?;
        let _: () = self.valkey.hdel(JOBS, field.as_str()).await?;
        let _: i64 = self.valkey.lpush(DEAD, vec![entry]).await?;
        Ok(())
    }

    /// Requeue expired leases and due delayed retries. Expired-lease recovery
    /// bounds crash-recovery latency to the visibility timeout.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let now_ms = epoch_ms(now) as f64;
        let mut moved = 0;

        moved += self.drain_due(LEASED, now_ms).await?;
        moved += self.drain_due(DELAYED, now_ms).await?;

        Ok(moved)
    }

    async fn drain_due(&self, zset: &str, now_ms: f64) -> Result<u64, QueueError> {
        let mut moved = 0;
        loop {
            let popped: Vec<(String, f64)> = self.valkey.zpopmin(zset, Some(1)).await?;
            let Some((field, score)) = popped.into_iter().next() else {
                break;
            };

            if score > now_ms {
                // Not due yet; put it back and stop.
                let _: () = self
                    .valkey
                    .zadd(zset, None, None, false, false, (score, field.as_str()))
                    .await?;
                break;
            }

            let exists: bool = self.valkey.hexists(JOBS, field.as_str()).await?;
            if exists {
                // Requeue at the consuming end so recovered jobs run next.
                let _: i64 = self.valkey.rpush(READY, vec![field.as_str()]).await?;
                moved += 1;
                tracing::info!(release_id = %field, set = zset, "job requeued");
            }
        }
        Ok(moved)
    }

    /// Depth of the ready list, for health reporting.
    pub async fn ready_depth(&self) -> Result<i64, QueueError> {
        Ok(self.valkey.llen(READY).await?)
    }
}

/// Background sweeper: returns expired leases and due retries to the ready
/// list until shutdown.
pub async fn run_sweeper(queue: WorkQueue, mut shutdown: tokio::sync::watch::Receiver<()>) {
    tracing::info!("queue sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::info!("queue sweeper shutting down");
                break;
            }
            () = tokio::time::sleep(Duration::from_secs(5)) => {
                match queue.sweep(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(requeued = n, "queue sweep requeued jobs"),
                    Err(e) => tracing::error!(error = %e, "queue sweep failed"),
                }
            }
        }
    }
}

fn epoch_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_round_trips_through_json() {
        let job = BuildJob::new(Uuid::new_v4(), Uuid::new_v4());
        let json = serde_json::to_string(&job).unwrap();
        let back: BuildJob = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }

    #[test]
    fn new_job_starts_at_attempt_zero() {
        let job = BuildJob::new(Uuid::new_v4(), Uuid::new_v4());
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn key_layout_is_namespaced() {
        for key in [JOBS, READY, LEASED, DELAYED, DEAD] {
            assert!(key.starts_with("enclii:queue:"));
        }
    }
}
