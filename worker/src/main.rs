// ==============================================================================
// main.rs - Lab Ingestion Worker
// ==============================================================================
// Description: Consumes the ingestion queue and runs the ingestion pipeline
//              for each job with bounded concurrency
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use labs_ingest::audit::{log_event, AuditEvent, AuditEventType};
use labs_ingest::config::{ExtractionConfig, StorageConfig};
use labs_ingest::extraction::SniffingExtractor;
use labs_ingest::logging::init_tracing;
use labs_ingest::repository::{LabResultStore, PgLabResultStore};
use labs_ingest::schema::ensure_schema;
use labs_ingest::storage::FilesystemObjectStore;
use labs_ingest::{IngestionError, IngestionJob, IngestionPipeline, JobOutcome};

mod config;
mod queue;

use config::WorkerConfig;
use queue::{Delivery, JobQueue, QueueDepth};

/// How often due retries are moved from the delayed set onto the queue
const PROMOTE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("labs_worker=info,labs_ingest=info");

    info!("Starting Lab Ingestion Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let db_pool = PgPoolOptions::new()
        .max_connections(config.concurrency as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("Connected to PostgreSQL");

    ensure_schema(&db_pool)
        .await
        .context("Failed to prepare database schema")?;

    let redis_client = RedisClient::open(config.redis_url.as_str())
        .context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;

    info!("Connected to Redis");

    let storage_config = StorageConfig::from_env().context("Invalid storage configuration")?;
    let objects = FilesystemObjectStore::new(&storage_config)
        .context("Failed to initialize object store")?;
    if !objects.check_root().await {
        anyhow::bail!("Storage root not accessible: {:?}", storage_config.root);
    }

    let extraction_config = ExtractionConfig::from_env().context("Invalid extraction configuration")?;
    if extraction_config.ocr_service_url.is_none() {
        warn!("OCR_SERVICE_URL not set; only plain-text documents can be ingested");
    }
    let extractor = SniffingExtractor::from_config(&extraction_config)
        .context("Failed to initialize text extractor")?;

    let pipeline = IngestionPipeline::new(
        Arc::new(objects),
        Arc::new(extractor),
        Arc::new(PgLabResultStore::new(db_pool.clone())),
        config.ingestion.clone(),
    );

    let worker = Worker::new(db_pool, redis_conn, pipeline, config);

    info!("Returning interrupted deliveries to the queue...");
    match worker.queue.clone().recover_processing().await {
        Ok(0) => info!("No interrupted deliveries found"),
        Ok(n) => warn!("Re-queued {} interrupted deliveries", n),
        Err(e) => error!("Failed to recover interrupted deliveries: {}", e),
    }

    let monitor = worker.clone();
    tokio::spawn(async move {
        monitor.monitor_loop().await;
    });

    let promoter = worker.clone();
    tokio::spawn(async move {
        promoter.promote_loop().await;
    });

    info!(
        concurrency = worker.config.concurrency,
        "Worker ready, waiting for jobs..."
    );
    worker.run().await
}

/// What to do with a delivery once its handler has finished
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    Ack,
    Retry(IngestionJob),
    DeadLetter,
}

/// Retry transient failures until `max_attempts` deliveries have been made
fn retry_or_dead_letter(job: &IngestionJob, max_attempts: u32) -> Disposition {
    let next = job.next_attempt();
    if next.attempt >= max_attempts {
        Disposition::DeadLetter
    } else {
        Disposition::Retry(next)
    }
}

fn disposition(result: &Result<JobOutcome, IngestionError>, job: &IngestionJob, max_attempts: u32) -> Disposition {
    match result {
        Ok(_) => Disposition::Ack,
        Err(e) if e.is_retryable() => retry_or_dead_letter(job, max_attempts),
        Err(_) => Disposition::Ack,
    }
}

#[derive(Clone)]
struct Worker {
    db_pool: PgPool,
    queue: JobQueue,
    pipeline: Arc<IngestionPipeline>,
    config: Arc<WorkerConfig>,
    permits: Arc<Semaphore>,
}

impl Worker {
    fn new(
        db_pool: PgPool,
        redis_conn: ConnectionManager,
        pipeline: IngestionPipeline,
        config: WorkerConfig,
    ) -> Self {
        Self {
            db_pool,
            queue: JobQueue::new(redis_conn),
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(config.concurrency)),
            config: Arc::new(config),
        }
    }

    /// Main loop: one permit per in-flight job, stop on Ctrl-C
    async fn run(&self) -> Result<()> {
        let mut queue = self.queue.clone();
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.permits.clone().acquire_owned() => {
                    permit.context("Worker semaphore closed")?
                }
            };

            let dequeued = tokio::select! {
                _ = &mut shutdown => break,
                dequeued = queue.dequeue() => dequeued,
            };

            match dequeued {
                Ok(Some(delivery)) => {
                    info!(
                        lab_result_id = %delivery.job.lab_result_id,
                        attempt = delivery.job.attempt,
                        "Received job"
                    );

                    let worker = self.clone();
                    tokio::spawn(async move {
                        worker.handle(delivery).await;
                        drop(permit);
                    });
                }
                // BLMOVE already waited for its timeout
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to dequeue job: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }

        info!("Shutdown requested, waiting for in-flight jobs...");
        let _ = self
            .permits
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("Worker stopped");
        Ok(())
    }

    async fn handle(&self, delivery: Delivery) {
        let job = &delivery.job;
        let id = job.lab_result_id;
        let mut queue = self.queue.clone();

        let lock = match queue.try_lock(id, self.config.lock_ttl()).await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!(lab_result_id = %id, "Lab result busy in another job, re-queueing");
                self.schedule_retry(&mut queue, &delivery, job, self.config.lock_retry_delay)
                    .await;
                return;
            }
            Err(e) => {
                error!(lab_result_id = %id, "Lock unavailable, re-queueing: {:#}", e);
                self.schedule_retry(&mut queue, &delivery, job, self.config.lock_retry_delay)
                    .await;
                return;
            }
        };

        self.audit(AuditEventType::IngestionStarted, job, serde_json::json!({})).await;

        let result = match tokio::time::timeout(self.config.job_timeout, self.pipeline.run(job)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(lab_result_id = %id, timeout = ?self.config.job_timeout, "Job timed out");
                if let Err(e) = self.pipeline.store().mark_failed(id).await {
                    warn!(lab_result_id = %id, "Could not mark timed-out job failed: {}", e);
                }
                Err(IngestionError::JobTimeout {
                    after: self.config.job_timeout,
                })
            }
        };

        match &result {
            Ok(JobOutcome::Completed { biomarkers }) => {
                self.audit(
                    AuditEventType::IngestionCompleted,
                    job,
                    serde_json::json!({ "biomarkers": biomarkers }),
                )
                .await;
            }
            Ok(JobOutcome::Skipped(outcome)) => {
                info!(lab_result_id = %id, ?outcome, "Delivery skipped");
            }
            Err(e) => {
                error!(lab_result_id = %id, attempt = job.attempt, retryable = e.is_retryable(), "Job failed: {}", e);
                self.audit(
                    AuditEventType::IngestionFailed,
                    job,
                    serde_json::json!({ "error": e.to_string(), "retryable": e.is_retryable() }),
                )
                .await;
            }
        }

        if let Err(e) = queue.release_lock(lock).await {
            warn!(lab_result_id = %id, "Failed to release lock: {:#}", e);
        }

        match disposition(&result, job, self.config.max_attempts) {
            Disposition::Ack => {
                if let Err(e) = queue.ack(&delivery).await {
                    error!(lab_result_id = %id, "Failed to ack job: {:#}", e);
                }
            }
            Disposition::Retry(next) => {
                let delay = self.config.backoff(next.attempt);
                info!(lab_result_id = %id, next_attempt = next.attempt, ?delay, "Scheduling retry");
                self.schedule_retry(&mut queue, &delivery, &next, delay).await;
            }
            Disposition::DeadLetter => {
                if let Err(e) = queue.dead_letter(&delivery).await {
                    error!(lab_result_id = %id, "Failed to dead-letter job: {:#}", e);
                }
            }
        }
    }

    /// Park `job` in the delayed set in place of `delivery`
    async fn schedule_retry(
        &self,
        queue: &mut JobQueue,
        delivery: &Delivery,
        job: &IngestionJob,
        delay: Duration,
    ) {
        if let Err(e) = queue.schedule_retry(delivery, job, delay).await {
            // Still in the processing list; startup recovery picks it up
            error!(lab_result_id = %job.lab_result_id, "Failed to schedule retry: {:#}", e);
        }
    }

    async fn audit(&self, event_type: AuditEventType, job: &IngestionJob, mut details: serde_json::Value) {
        details["attempt"] = job.attempt.into();
        details["job_id"] = job.job_id.to_string().into();
        let event = AuditEvent::new(event_type, None, Some(job.lab_result_id), details);
        log_event(&self.db_pool, event).await;
    }

    /// Log queue depth every minute
    async fn monitor_loop(&self) {
        let mut queue = self.queue.clone();
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;

            match queue.depth().await {
                Ok(QueueDepth {
                    queued,
                    processing,
                    delayed,
                    dead,
                }) => {
                    info!(queued, processing, delayed, dead, "Queue depth");
                }
                Err(e) => error!("Failed to read queue depth: {:#}", e),
            }
        }
    }

    /// Release delayed retries once their backoff has elapsed
    async fn promote_loop(&self) {
        let mut queue = self.queue.clone();
        loop {
            match queue.promote_due().await {
                Ok(0) => {}
                Ok(n) => info!(promoted = n, "Released delayed retries"),
                Err(e) => error!("Failed to promote delayed retries: {:#}", e),
            }
            tokio::time::sleep(PROMOTE_INTERVAL).await;
        }
    }
}
