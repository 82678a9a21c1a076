// ==============================================================================
// intake.rs - Lab Document Intake
// ==============================================================================
// Description: Validate, store, record and enqueue an uploaded lab document,
//              cleaning up after whichever step fails
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use labs_ingest::models::{LabResult, NewLabResult};
use labs_ingest::repository::{LabResultStore, PgLabResultStore, StoreError};
use labs_ingest::storage::{storage_key, ObjectStore, StorageError};
use labs_ingest::validator::{DocumentValidator, ValidatedDocument, ValidationError};
use labs_ingest::IngestionJob;

/// Record operations the upload path needs
#[async_trait]
pub trait PendingRecords: Send + Sync {
    async fn create_pending(&self, new: &NewLabResult) -> Result<LabResult, StoreError>;
    async fn mark_failed(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
impl PendingRecords for PgLabResultStore {
    async fn create_pending(&self, new: &NewLabResult) -> Result<LabResult, StoreError> {
        PgLabResultStore::create_pending(self, new).await
    }

    async fn mark_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        LabResultStore::mark_failed(self, id).await
    }
}

#[async_trait]
pub trait JobSink: Send + Sync {
    async fn enqueue(&self, job: &IngestionJob) -> anyhow::Result<()>;
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to store document: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to record lab result: {0}")]
    Record(#[from] StoreError),

    #[error("Failed to enqueue ingestion for {lab_result_id}: {cause:#}")]
    Enqueue {
        lab_result_id: Uuid,
        cause: anyhow::Error,
    },
}

/// A document that made it onto the queue
#[derive(Debug)]
pub struct Accepted {
    pub lab_result: LabResult,
    pub document: ValidatedDocument,
}

pub struct Intake<'a> {
    pub validator: &'a DocumentValidator,
    pub objects: &'a dyn ObjectStore,
    pub records: &'a dyn PendingRecords,
    pub jobs: &'a dyn JobSink,
}

impl Intake<'_> {
    /// Runs validate, store, record and enqueue in that order
    ///
    /// No extraction or parsing happens here. A failed step leaves nothing
    /// behind: no object without a row, and no pending row without a job.
    pub async fn accept(
        &self,
        user_id: &str,
        system_id: &str,
        filename: &str,
        data: Vec<u8>,
    ) -> Result<Accepted, IntakeError> {
        let document = self.validator.validate_upload(filename, &data)?;

        let key = storage_key(system_id, user_id, &document.safe_name, Utc::now());
        let stored = self.objects.put(data, &key).await?;

        let new = NewLabResult {
            user_id: user_id.to_string(),
            system_id: system_id.to_string(),
            file_name: document.safe_name.clone(),
            storage_key: stored.key.clone(),
            file_url: Some(stored.url),
        };

        let lab_result = match self.records.create_pending(&new).await {
            Ok(lab) => lab,
            Err(e) => {
                self.discard(&stored.key).await;
                return Err(e.into());
            }
        };

        let job = IngestionJob::new(lab_result.id, &lab_result.storage_key);
        if let Err(cause) = self.jobs.enqueue(&job).await {
            if let Err(e) = self.records.mark_failed(lab_result.id).await {
                error!(
                    lab_result_id = %lab_result.id,
                    "Failed to mark unqueued lab result failed: {}", e
                );
            }
            self.discard(&stored.key).await;
            return Err(IntakeError::Enqueue {
                lab_result_id: lab_result.id,
                cause,
            });
        }

        Ok(Accepted {
            lab_result,
            document,
        })
    }

    async fn discard(&self, key: &str) {
        if let Err(e) = self.objects.delete(key).await {
            warn!(storage_key = %key, "Failed to remove stranded object: {}", e);
        }
    }
}
