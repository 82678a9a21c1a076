// ==============================================================================
// queue.rs - Redis Job Queue (Producer Side)
// ==============================================================================
// Description: Enqueues ingestion jobs for the worker
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::info;

use labs_ingest::{IngestionJob, INGEST_QUEUE_KEY};

use crate::intake::JobSink;

/// Job queue manager
#[derive(Clone)]
pub struct JobQueue {
    conn: ConnectionManager,
}

impl JobQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// LPUSH onto the queue; the worker consumes from the right
    pub async fn enqueue(&self, job: &IngestionJob) -> Result<()> {
        let payload = serde_json::to_string(job).context("Failed to serialize job payload")?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(INGEST_QUEUE_KEY, &payload)
            .await
            .context("Failed to push job to queue")?;

        info!(
            lab_result_id = %job.lab_result_id,
            job_id = %job.job_id,
            "Enqueued ingestion job"
        );
        Ok(())
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }

    pub async fn queue_length(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        conn.llen(INGEST_QUEUE_KEY)
            .await
            .context("Failed to get queue length")
    }
}

#[async_trait]
impl JobSink for JobQueue {
    async fn enqueue(&self, job: &IngestionJob) -> Result<()> {
        JobQueue::enqueue(self, job).await
    }
}
