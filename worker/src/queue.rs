// ==============================================================================
// queue.rs - Reliable Redis Job Queue (Worker Side)
// ==============================================================================
// Description: BLMOVE-based consumption with a processing list, delayed
//              retries, dead-lettering and per-lab-result locks
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use labs_ingest::{IngestionJob, INGEST_QUEUE_KEY};

/// Messages currently being worked on; survives a worker crash
pub const PROCESSING_KEY: &str = "labs:ingest:processing";
/// Messages that exhausted their attempts or could not be decoded
pub const DEAD_LETTER_KEY: &str = "labs:ingest:dead";
/// Retries waiting out their backoff, scored by due time in epoch millis
pub const DELAYED_KEY: &str = "labs:ingest:delayed";

const LOCK_PREFIX: &str = "labs:ingest:lock";

/// Seconds BLMOVE blocks before returning nothing
const DEQUEUE_TIMEOUT_SECS: f64 = 1.0;

/// Most delayed retries promoted per call
const PROMOTE_BATCH: usize = 100;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

// Due entries leave the delayed set and join the queue in one step
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
for _, payload in ipairs(due) do
    redis.call("ZREM", KEYS[1], payload)
    redis.call("LPUSH", KEYS[2], payload)
end
return #due
"#;

/// Delayed-set score for a retry due `delay` after `now_ms`
pub fn retry_score(now_ms: i64, delay: Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_add(delay_ms)
}

/// Serialized payload and score for a delayed retry of `job`
pub fn retry_entry(job: &IngestionJob, now_ms: i64, delay: Duration) -> Result<(String, i64)> {
    let payload = serde_json::to_string(job).context("Failed to serialize job payload")?;
    Ok((payload, retry_score(now_ms, delay)))
}

pub fn lock_key(lab_result_id: Uuid) -> String {
    format!("{}:{}", LOCK_PREFIX, lab_result_id)
}

/// A message moved into the processing list
///
/// `raw` is kept byte-for-byte so that `LREM` removes exactly this entry.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub raw: String,
    pub job: IngestionJob,
}

/// Held lock on one lab result; release it with [`JobQueue::release_lock`]
#[derive(Debug)]
pub struct LabLock {
    key: String,
    token: String,
}

/// Entry counts per queue key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDepth {
    pub queued: usize,
    pub processing: usize,
    pub delayed: usize,
    pub dead: usize,
}

/// Job queue manager
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Move the oldest queued message into the processing list
    ///
    /// Undecodable messages are dead-lettered and reported as `None`.
    pub async fn dequeue(&mut self) -> Result<Option<Delivery>> {
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(INGEST_QUEUE_KEY)
            .arg(PROCESSING_KEY)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(DEQUEUE_TIMEOUT_SECS)
            .query_async(&mut self.conn)
            .await
            .context("Failed to move job from queue")?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match serde_json::from_str::<IngestionJob>(&raw) {
            Ok(job) => Ok(Some(Delivery { raw, job })),
            Err(e) => {
                error!("Dead-lettering undecodable job payload: {}", e);
                self.move_to(&raw, DEAD_LETTER_KEY, &raw).await?;
                Ok(None)
            }
        }
    }

    /// Done with a delivery, whatever its outcome
    pub async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.conn
            .lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.raw)
            .await
            .context("Failed to ack job")?;
        Ok(())
    }

    /// Atomically swap a delivery for `job` in the delayed set, due after `delay`
    ///
    /// The replacement is durable before any waiting starts, so a crash during
    /// the backoff loses nothing; [`JobQueue::promote_due`] releases it later.
    pub async fn schedule_retry(
        &mut self,
        delivery: &Delivery,
        job: &IngestionJob,
        delay: Duration,
    ) -> Result<()> {
        let (payload, due_at) = retry_entry(job, Utc::now().timestamp_millis(), delay)?;
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.raw)
            .ignore()
            .zadd(DELAYED_KEY, &payload, due_at)
            .ignore()
            .query_async::<()>(&mut self.conn)
            .await
            .context("Failed to schedule job retry")
    }

    /// Move delayed retries whose time has come onto the queue
    pub async fn promote_due(&mut self) -> Result<usize> {
        let promoted: usize = redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(DELAYED_KEY)
            .key(INGEST_QUEUE_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut self.conn)
            .await
            .context("Failed to promote delayed jobs")?;
        Ok(promoted)
    }

    pub async fn dead_letter(&mut self, delivery: &Delivery) -> Result<()> {
        warn!(
            lab_result_id = %delivery.job.lab_result_id,
            attempt = delivery.job.attempt,
            "Moving job to dead-letter list"
        );
        self.move_to(&delivery.raw, DEAD_LETTER_KEY, &delivery.raw).await
    }

    async fn move_to(&mut self, raw: &str, list: &str, payload: &str) -> Result<()> {
        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, raw)
            .ignore()
            .lpush(list, payload)
            .ignore()
            .query_async::<()>(&mut self.conn)
            .await
            .with_context(|| format!("Failed to move job to {}", list))
    }

    /// Put every message left in the processing list back on the queue,
    /// oldest at the consuming end
    ///
    /// Only safe while no other worker is consuming.
    pub async fn recover_processing(&mut self) -> Result<usize> {
        let mut recovered = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(PROCESSING_KEY)
                .arg(INGEST_QUEUE_KEY)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut self.conn)
                .await
                .context("Failed to recover processing list")?;

            match moved {
                Some(_) => recovered += 1,
                None => return Ok(recovered),
            }
        }
    }

    /// `SET NX PX` lock so only one job touches a lab result at a time
    pub async fn try_lock(&mut self, lab_result_id: Uuid, ttl: Duration) -> Result<Option<LabLock>> {
        let key = lock_key(lab_result_id);
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut self.conn)
            .await
            .context("Failed to acquire lab result lock")?;

        Ok(acquired.map(|_| LabLock { key, token }))
    }

    /// Release a lock only if it is still ours
    pub async fn release_lock(&mut self, lock: LabLock) -> Result<bool> {
        let released: i32 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&lock.key)
            .arg(&lock.token)
            .invoke_async(&mut self.conn)
            .await
            .context("Failed to release lab result lock")?;
        Ok(released == 1)
    }

    pub async fn depth(&mut self) -> Result<QueueDepth> {
        let (queued, processing, delayed, dead): (usize, usize, usize, usize) = redis::pipe()
            .llen(INGEST_QUEUE_KEY)
            .llen(PROCESSING_KEY)
            .zcard(DELAYED_KEY)
            .llen(DEAD_LETTER_KEY)
            .query_async(&mut self.conn)
            .await
            .context("Failed to read queue depth")?;
        Ok(QueueDepth {
            queued,
            processing,
            delayed,
            dead,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_key() {
        let id = Uuid::nil();
        assert_eq!(
            lock_key(id),
            "labs:ingest:lock:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn test_keys_share_prefix() {
        for key in [
            INGEST_QUEUE_KEY,
            PROCESSING_KEY,
            DEAD_LETTER_KEY,
            DELAYED_KEY,
            LOCK_PREFIX,
        ] {
            assert!(key.starts_with("labs:ingest:"));
        }
    }

    #[test]
    fn test_retry_score() {
        assert_eq!(retry_score(1_000, Duration::from_millis(2_500)), 3_500);
        assert_eq!(retry_score(1_000, Duration::ZERO), 1_000);
        assert_eq!(retry_score(i64::MAX - 1, Duration::from_secs(300)), i64::MAX);
        assert_eq!(retry_score(0, Duration::MAX), i64::MAX);
    }

    #[test]
    fn test_retry_entry_carries_next_attempt() {
        let job = IngestionJob::new(Uuid::new_v4(), "labs/s/u/1-a.pdf");
        let next = job.next_attempt();

        let (payload, due_at) = retry_entry(&next, 10_000, Duration::from_secs(4)).unwrap();

        let stored: IngestionJob = serde_json::from_str(&payload).unwrap();
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.job_id, job.job_id);
        assert_eq!(due_at, 14_000);
    }
}
