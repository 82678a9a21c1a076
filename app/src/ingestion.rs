// ==============================================================================
// ingestion.rs - Lab Document Ingestion Job
// ==============================================================================
// Description: Job message contract and the fetch -> extract -> parse -> store
//              state machine run for every queued lab document
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::IngestionConfig;
use crate::extraction::{ExtractionError, TextExtractor};
use crate::models::ProcessingStatus;
use crate::parsers::BiomarkerParser;
use crate::repository::{ClaimOutcome, LabResultStore, StoreError};
use crate::storage::{ObjectStore, StorageError};

/// Redis list the gateway pushes new jobs onto and the worker pops from
pub const INGEST_QUEUE_KEY: &str = "labs:ingest:queue";

/// Queue message for one ingestion attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: Uuid,
    pub lab_result_id: Uuid,
    pub storage_key: String,
    pub enqueued_at: DateTime<Utc>,
    /// Delivery/retry count, starting at 0
    #[serde(default)]
    pub attempt: u32,
}

impl IngestionJob {
    pub fn new(lab_result_id: Uuid, storage_key: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            lab_result_id,
            storage_key: storage_key.into(),
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }

    /// The same job, re-enqueued for its next attempt
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("Failed to fetch document: {0}")]
    Fetch(#[source] StorageError),

    #[error("Text extraction failed: {0}")]
    Extraction(#[source] ExtractionError),

    #[error("Text extraction timed out after {after:?}")]
    ExtractionTimeout { after: Duration },

    #[error("Persistence failed: {0}")]
    Persistence(#[source] StoreError),

    /// The whole job exceeded the worker's time budget
    #[error("Job timed out after {after:?}")]
    JobTimeout { after: Duration },

    #[error("Lab result {0} no longer exists")]
    NotFound(Uuid),

    #[error("Lab result {id} is {found}, expected {expected}")]
    StaleState {
        id: Uuid,
        expected: ProcessingStatus,
        found: ProcessingStatus,
    },
}

impl IngestionError {
    /// Transient failures are retried by the worker; structural ones are acked
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Fetch(_)
            | IngestionError::Extraction(_)
            | IngestionError::ExtractionTimeout { .. }
            | IngestionError::Persistence(_)
            | IngestionError::JobTimeout { .. } => true,
            IngestionError::NotFound(_) | IngestionError::StaleState { .. } => false,
        }
    }
}

impl From<StoreError> for IngestionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => IngestionError::NotFound(id),
            StoreError::StaleState {
                id,
                expected,
                found,
            } => IngestionError::StaleState {
                id,
                expected,
                found,
            },
            other => IngestionError::Persistence(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { biomarkers: usize },
    /// Stale or duplicate delivery; nothing was changed
    Skipped(ClaimOutcome),
}

/// Drives one lab result from `pending` to `completed` or `failed`
///
/// Holds no queue types; the worker decides what to do with the returned
/// error via [`IngestionError::is_retryable`].
pub struct IngestionPipeline {
    objects: Arc<dyn ObjectStore>,
    extractor: Arc<dyn TextExtractor>,
    store: Arc<dyn LabResultStore>,
    parser: BiomarkerParser,
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        extractor: Arc<dyn TextExtractor>,
        store: Arc<dyn LabResultStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            objects,
            extractor,
            store,
            parser: BiomarkerParser::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn LabResultStore> {
        &self.store
    }

    #[instrument(
        skip(self, job),
        fields(lab_result_id = %job.lab_result_id, attempt = job.attempt, job_id = %job.job_id)
    )]
    pub async fn run(&self, job: &IngestionJob) -> Result<JobOutcome, IngestionError> {
        let id = job.lab_result_id;

        // A claim failure has no side effects to undo
        match self.store.claim(id, job.attempt).await? {
            ClaimOutcome::Claimed { previous } => {
                info!(previous = %previous, "Claimed lab result for ingestion");
            }
            skipped => {
                info!(outcome = ?skipped, "Skipping stale or duplicate delivery");
                return Ok(JobOutcome::Skipped(skipped));
            }
        }

        match self.process(job).await {
            Ok(biomarkers) => {
                info!(biomarkers, status = %ProcessingStatus::Completed, "Ingestion completed");
                Ok(JobOutcome::Completed { biomarkers })
            }
            Err(err) => {
                self.fail(id, &err).await;
                Err(err)
            }
        }
    }

    async fn process(&self, job: &IngestionJob) -> Result<usize, IngestionError> {
        let id = job.lab_result_id;

        let url = self
            .objects
            .read_url(&job.storage_key, self.config.read_url_ttl)
            .await
            .map_err(IngestionError::Fetch)?;
        let bytes = self
            .objects
            .fetch_url(&url)
            .await
            .map_err(IngestionError::Fetch)?;
        debug!(storage_key = %job.storage_key, size = bytes.len(), "Fetched document");

        let after = self.config.extraction_timeout;
        let extracted = tokio::time::timeout(after, self.extractor.extract(&bytes))
            .await
            .map_err(|_| IngestionError::ExtractionTimeout { after })?
            .map_err(IngestionError::Extraction)?;
        debug!(
            extractor = self.extractor.name(),
            lines = extracted.lines.len(),
            mean_confidence = ?extracted.mean_confidence(),
            "Extracted text"
        );

        self.store.record_extracted_text(id, &extracted.text).await?;

        let (parsed, stats) = self.parser.parse_with_stats(&extracted.text);
        info!(
            total_lines = stats.total_lines,
            considered = stats.considered_lines,
            matched = stats.matched_lines,
            dropped = stats.dropped_lines(),
            "Parsed biomarkers"
        );

        let candidates: Vec<_> = parsed.into_iter().map(|p| p.candidate).collect();
        let stored = self.store.replace_biomarkers(id, &candidates).await?;

        self.store.mark_completed(id).await?;
        Ok(stored)
    }

    /// Best-effort `failed` transition; never masks the original error
    async fn fail(&self, id: Uuid, err: &IngestionError) {
        if matches!(err, IngestionError::NotFound(_)) {
            warn!("Lab result deleted during ingestion: {}", err);
            return;
        }

        match self.store.mark_failed(id).await {
            Ok(true) => warn!(status = %ProcessingStatus::Failed, "Ingestion failed: {}", err),
            Ok(false) => warn!("Ingestion failed on an already terminal record: {}", err),
            Err(mark_err) => warn!(
                "Ingestion failed: {} (could not mark failed: {})",
                err, mark_err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BiomarkerCandidate;
    use crate::testing::{FakeExtractor, FakeStep, InMemoryLabStore, MemoryObjectStore};
    use std::sync::atomic::Ordering;
    use ProcessingStatus::*;

    const KEY: &str = "labs/system-1/user-1/1700000000000-report.txt";
    const REPORT: &str = "Glucose: 95 mg/dL (Reference: 70-100)\nhsCRP 0.8 mg/L < 1.0\nxyz";

    struct Harness {
        objects: Arc<MemoryObjectStore>,
        extractor: Arc<FakeExtractor>,
        store: Arc<InMemoryLabStore>,
        pipeline: IngestionPipeline,
    }

    fn harness(extractor: FakeExtractor, extraction_timeout: Duration) -> Harness {
        let objects = Arc::new(MemoryObjectStore::with_object(KEY, b"document bytes"));
        let extractor = Arc::new(extractor);
        let store = Arc::new(InMemoryLabStore::new());
        let pipeline = IngestionPipeline::new(
            objects.clone(),
            extractor.clone(),
            store.clone(),
            IngestionConfig {
                read_url_ttl: Duration::from_secs(60),
                extraction_timeout,
            },
        );
        Harness {
            objects,
            extractor,
            store,
            pipeline,
        }
    }

    fn default_harness(text: &str) -> Harness {
        harness(FakeExtractor::text(text), Duration::from_secs(5))
    }

    fn job(id: Uuid, attempt: u32) -> IngestionJob {
        IngestionJob {
            attempt,
            ..IngestionJob::new(id, KEY)
        }
    }

    #[tokio::test]
    async fn test_happy_path_completes() {
        let h = default_harness(REPORT);
        let id = h.store.insert_pending(KEY);

        let outcome = h.pipeline.run(&job(id, 0)).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed { biomarkers: 2 });
        assert_eq!(h.store.status(id), Some(Completed));
        assert_eq!(h.store.history(id), vec![Processing, Parsing, Completed]);
        assert_eq!(h.store.get(id).unwrap().raw_text.as_deref(), Some(REPORT));

        let names: Vec<_> = h.store.biomarkers(id).into_iter().map(|b| b.test_name).collect();
        assert_eq!(names, vec!["Glucose", "hsCRP"]);
    }

    #[tokio::test]
    async fn test_fetch_failure_marks_failed_and_returns_error() {
        let h = default_harness(REPORT);
        let id = h.store.insert_pending(KEY);
        h.objects.fail_fetch.store(true, Ordering::SeqCst);

        let err = h.pipeline.run(&job(id, 0)).await.unwrap_err();

        assert!(matches!(err, IngestionError::Fetch(StorageError::Unavailable(_))));
        assert!(err.is_retryable());
        assert_eq!(h.store.status(id), Some(Failed));
        assert_eq!(h.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_biomarkers_still_completes() {
        let h = default_harness("PATIENT REPORT\nNo numeric results on this page\nxyz");
        let id = h.store.insert_pending(KEY);

        let outcome = h.pipeline.run(&job(id, 0)).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed { biomarkers: 0 });
        assert_eq!(h.store.status(id), Some(Completed));
        assert!(h.store.biomarkers(id).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_after_completion_is_noop() {
        let h = default_harness(REPORT);
        let id = h.store.insert_pending(KEY);
        h.pipeline.run(&job(id, 0)).await.unwrap();
        let history_before = h.store.history(id);

        h.extractor.set_text("Sodium 140 mmol/L");
        let outcome = h.pipeline.run(&job(id, 0)).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Skipped(ClaimOutcome::AlreadyTerminal(Completed))
        );
        assert_eq!(h.store.history(id), history_before);
        assert_eq!(h.store.biomarkers(id).len(), 2);
        assert_eq!(h.extractor.calls(), 1);

        // A later attempt never reopens a completed record either
        let outcome = h.pipeline.run(&job(id, 4)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Skipped(_)));
        assert_eq!(h.store.status(id), Some(Completed));
    }

    #[tokio::test]
    async fn test_redelivery_replaces_biomarkers() {
        let h = default_harness(REPORT);
        // Previous attempt crashed after writing a partial batch
        let id = h.store.insert(Parsing, 0, KEY);
        h.store.set_biomarkers(
            id,
            vec![
                BiomarkerCandidate {
                    test_name: "Glucose".to_string(),
                    value: "95".to_string(),
                    unit: None,
                    reference_range_low: None,
                    reference_range_high: None,
                };
                3
            ],
        );

        let outcome = h.pipeline.run(&job(id, 0)).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed { biomarkers: 2 });
        assert_eq!(h.store.biomarkers(id).len(), 2);
        assert_eq!(h.store.history(id), vec![Processing, Parsing, Completed]);
    }

    #[tokio::test]
    async fn test_retry_after_failure_restarts_and_stale_attempt_is_skipped() {
        let h = harness(FakeExtractor::failing(), Duration::from_secs(5));
        let id = h.store.insert_pending(KEY);

        let err = h.pipeline.run(&job(id, 0)).await.unwrap_err();
        assert!(matches!(err, IngestionError::Extraction(_)));
        assert_eq!(h.store.status(id), Some(Failed));

        // A duplicate of the failed attempt stays a no-op
        let outcome = h.pipeline.run(&job(id, 0)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(ClaimOutcome::AlreadyTerminal(Failed)));

        h.extractor.set_text(REPORT);
        let outcome = h.pipeline.run(&job(id, 1)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { biomarkers: 2 });
        assert_eq!(
            h.store.history(id),
            vec![Processing, Failed, Processing, Parsing, Completed]
        );
    }

    #[tokio::test]
    async fn test_persisted_retry_payload_completes_after_restart() {
        let h = harness(FakeExtractor::failing(), Duration::from_secs(5));
        let id = h.store.insert_pending(KEY);
        let first = job(id, 0);

        h.pipeline.run(&first).await.unwrap_err();
        assert_eq!(h.store.status(id), Some(Failed));

        // The worker stores the next attempt before backing off; a restarted
        // worker only ever sees that stored payload
        let stored = serde_json::to_string(&first.next_attempt()).unwrap();

        h.extractor.set_text(REPORT);
        let recovered: IngestionJob = serde_json::from_str(&stored).unwrap();
        let outcome = h.pipeline.run(&recovered).await.unwrap();

        assert_eq!(outcome, JobOutcome::Completed { biomarkers: 2 });
        assert_eq!(h.store.status(id), Some(Completed));
        assert_eq!(h.store.get(id).unwrap().ingestion_attempt, 1);

        // The original payload would have been skipped
        let outcome = h.pipeline.run(&first).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped(ClaimOutcome::AlreadyTerminal(Completed)));
    }

    #[tokio::test]
    async fn test_older_attempt_is_superseded() {
        let h = default_harness(REPORT);
        let id = h.store.insert(Processing, 3, KEY);

        let outcome = h.pipeline.run(&job(id, 1)).await.unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Skipped(ClaimOutcome::Superseded { current_attempt: 3 })
        );
        assert!(h.store.history(id).is_empty());
    }

    #[tokio::test]
    async fn test_delete_mid_job_aborts_without_resurrecting() {
        for step in [FakeStep::RecordText, FakeStep::ReplaceBiomarkers, FakeStep::Complete] {
            let h = default_harness(REPORT);
            let id = h.store.insert_pending(KEY);
            h.store.delete_during(step);

            let err = h.pipeline.run(&job(id, 0)).await.unwrap_err();

            assert!(matches!(err, IngestionError::NotFound(found) if found == id));
            assert!(!err.is_retryable());
            assert!(h.store.get(id).is_none(), "record resurrected at {:?}", step);
            assert!(h.store.biomarkers(id).is_empty());
        }
    }

    #[tokio::test]
    async fn test_missing_record_at_claim() {
        let h = default_harness(REPORT);

        let err = h.pipeline.run(&job(Uuid::new_v4(), 0)).await.unwrap_err();

        assert!(matches!(err, IngestionError::NotFound(_)));
        assert_eq!(h.extractor.calls(), 0);
    }

    #[tokio::test]
    async fn test_extraction_timeout_marks_failed() {
        let h = harness(
            FakeExtractor::slow(Duration::from_millis(500), REPORT),
            Duration::from_millis(20),
        );
        let id = h.store.insert_pending(KEY);

        let err = h.pipeline.run(&job(id, 0)).await.unwrap_err();

        assert!(matches!(err, IngestionError::ExtractionTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(h.store.status(id), Some(Failed));
        assert!(h.store.get(id).unwrap().raw_text.is_none());
    }

    #[test]
    fn test_store_error_mapping() {
        let id = Uuid::new_v4();
        assert!(matches!(
            IngestionError::from(StoreError::NotFound(id)),
            IngestionError::NotFound(found) if found == id
        ));
        let stale = IngestionError::from(StoreError::StaleState {
            id,
            expected: Parsing,
            found: Failed,
        });
        assert!(!stale.is_retryable());
        assert!(IngestionError::from(StoreError::CorruptRow("x".into())).is_retryable());
    }

    #[test]
    fn test_job_serialization() {
        let job = IngestionJob::new(Uuid::new_v4(), KEY);
        let json = serde_json::to_string(&job).unwrap();
        let back: IngestionJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);

        let retry = job.next_attempt();
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.job_id, job.job_id);
    }
}
