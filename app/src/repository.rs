// ==============================================================================
// repository.rs - Lab Result Persistence
// ==============================================================================
// Description: LabResultStore trait (conditional status transitions) and its
//              Postgres implementation
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{Biomarker, BiomarkerCandidate, LabResult, NewLabResult, ProcessingStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Lab result not found: {0}")]
    NotFound(Uuid),

    #[error("Lab result {id} is {found}, expected {expected}")]
    StaleState {
        id: Uuid,
        expected: ProcessingStatus,
        found: ProcessingStatus,
    },

    #[error("Corrupt lab result row: {0}")]
    CorruptRow(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result of trying to claim a lab result for an ingestion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Now `processing` under this attempt
    Claimed { previous: ProcessingStatus },
    /// Already `completed`, or `failed` by this or a later attempt
    AlreadyTerminal(ProcessingStatus),
    /// A later attempt has already claimed the record
    Superseded { current_attempt: u32 },
}

/// Whether delivery `attempt` may claim a record in `status` last claimed by
/// `stored_attempt`
///
/// Non-terminal records can be resumed by the same or a newer attempt. A
/// `failed` record can only be picked up again by a strictly newer attempt,
/// which is how queue retries restart a job that marked its record failed.
/// `completed` is never claimed again.
pub fn claim_allowed(status: ProcessingStatus, stored_attempt: u32, attempt: u32) -> bool {
    match status {
        ProcessingStatus::Pending | ProcessingStatus::Processing | ProcessingStatus::Parsing => {
            stored_attempt <= attempt
        }
        ProcessingStatus::Failed => stored_attempt < attempt,
        ProcessingStatus::Completed => false,
    }
}

/// Conditional transitions driven by the ingestion job
///
/// Every mutation is a compare-and-set on the current status; a missing row
/// is always reported as [`StoreError::NotFound`] so a concurrent delete
/// aborts the job instead of recreating data.
#[async_trait]
pub trait LabResultStore: Send + Sync {
    async fn claim(&self, id: Uuid, attempt: u32) -> Result<ClaimOutcome, StoreError>;

    /// `processing -> parsing`, storing the extracted text in the same update
    async fn record_extracted_text(&self, id: Uuid, raw_text: &str) -> Result<(), StoreError>;

    /// Replace all biomarkers of a `parsing` record in one transaction
    async fn replace_biomarkers(
        &self,
        id: Uuid,
        candidates: &[BiomarkerCandidate],
    ) -> Result<usize, StoreError>;

    /// `parsing -> completed`
    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError>;

    /// Any non-terminal status -> `failed`. Returns false when the record was
    /// already terminal.
    async fn mark_failed(&self, id: Uuid) -> Result<bool, StoreError>;
}

const LAB_RESULT_COLUMNS: &str = "id, user_id, system_id, file_name, storage_key, file_url, \
     raw_text, processing_status, ingestion_attempt, created_at, updated_at";

const BIOMARKER_COLUMNS: &str = "b.id, b.lab_result_id, b.test_name, b.value, b.unit, \
     b.reference_range_low, b.reference_range_high, b.test_date, b.notes, b.created_at";

fn attempt_param(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

fn parse_status(raw: &str) -> Result<ProcessingStatus, StoreError> {
    raw.parse()
        .map_err(|e: crate::models::UnknownStatus| StoreError::CorruptRow(e.to_string()))
}

fn lab_result_from_row(row: &PgRow) -> Result<LabResult, StoreError> {
    let status: String = row.try_get("processing_status")?;
    let attempt: i32 = row.try_get("ingestion_attempt")?;

    Ok(LabResult {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        system_id: row.try_get("system_id")?,
        file_name: row.try_get("file_name")?,
        storage_key: row.try_get("storage_key")?,
        file_url: row.try_get("file_url")?,
        raw_text: row.try_get("raw_text")?,
        processing_status: parse_status(&status)?,
        ingestion_attempt: u32::try_from(attempt)
            .map_err(|_| StoreError::CorruptRow(format!("negative ingestion_attempt {}", attempt)))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn biomarker_from_row(row: &PgRow) -> Result<Biomarker, StoreError> {
    Ok(Biomarker {
        id: row.try_get("id")?,
        lab_result_id: row.try_get("lab_result_id")?,
        test_name: row.try_get("test_name")?,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        reference_range_low: row.try_get("reference_range_low")?,
        reference_range_high: row.try_get("reference_range_high")?,
        test_date: row.try_get("test_date")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgLabResultStore {
    pool: PgPool,
}

impl PgLabResultStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Current `(status, ingestion_attempt)`, used to explain a failed
    /// conditional update
    async fn current_state(&self, id: Uuid) -> Result<(ProcessingStatus, u32), StoreError> {
        let row = sqlx::query(
            "SELECT processing_status, ingestion_attempt FROM lab_results WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(id))?;

        let status: String = row.try_get("processing_status")?;
        let attempt: i32 = row.try_get("ingestion_attempt")?;
        Ok((parse_status(&status)?, attempt.max(0) as u32))
    }

    /// Conditional single-step transition; explains a miss as NotFound or StaleState
    async fn transition(
        &self,
        id: Uuid,
        expected: ProcessingStatus,
        next: ProcessingStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lab_results
            SET processing_status = $3, updated_at = NOW()
            WHERE id = $1 AND processing_status = $2
            "#,
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!(lab_result_id = %id, from = %expected, to = %next, "Status transition");
            return Ok(());
        }

        let (found, _) = self.current_state(id).await?;
        Err(StoreError::StaleState {
            id,
            expected,
            found,
        })
    }

    // ---------------------------------------------------------------------
    // User-scoped operations used by the gateway
    // ---------------------------------------------------------------------

    pub async fn create_pending(&self, new: &NewLabResult) -> Result<LabResult, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO lab_results (
                id, user_id, system_id, file_name, storage_key, file_url,
                processing_status, ingestion_attempt, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, NOW(), NOW())
            RETURNING {}
            "#,
            LAB_RESULT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&new.user_id)
        .bind(&new.system_id)
        .bind(&new.file_name)
        .bind(&new.storage_key)
        .bind(&new.file_url)
        .fetch_one(&self.pool)
        .await?;

        let lab = lab_result_from_row(&row)?;
        info!(lab_result_id = %lab.id, storage_key = %lab.storage_key, "Created pending lab result");
        Ok(lab)
    }

    pub async fn find_for_owner(
        &self,
        id: Uuid,
        user_id: &str,
        system_id: &str,
    ) -> Result<Option<LabResult>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM lab_results WHERE id = $1 AND user_id = $2 AND system_id = $3",
            LAB_RESULT_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .bind(system_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lab_result_from_row).transpose()
    }

    /// Newest first
    pub async fn list_for_owner(
        &self,
        user_id: &str,
        system_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LabResult>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM lab_results
            WHERE user_id = $1 AND system_id = $2
            ORDER BY created_at DESC, id
            LIMIT $3 OFFSET $4
            "#,
            LAB_RESULT_COLUMNS
        ))
        .bind(user_id)
        .bind(system_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lab_result_from_row).collect()
    }

    /// Biomarkers in source line order, or `None` when the caller does not own the record
    pub async fn biomarkers_for_owner(
        &self,
        id: Uuid,
        user_id: &str,
        system_id: &str,
    ) -> Result<Option<(LabResult, Vec<Biomarker>)>, StoreError> {
        let Some(lab) = self.find_for_owner(id, user_id, system_id).await? else {
            return Ok(None);
        };

        let rows = sqlx::query(&format!(
            "SELECT {} FROM biomarkers b WHERE b.lab_result_id = $1 ORDER BY b.position",
            BIOMARKER_COLUMNS
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let biomarkers = rows
            .iter()
            .map(biomarker_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some((lab, biomarkers)))
    }

    /// Delete a caller's record (biomarkers cascade), returning its storage key
    pub async fn delete_for_owner(
        &self,
        id: Uuid,
        user_id: &str,
        system_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM lab_results
            WHERE id = $1 AND user_id = $2 AND system_id = $3
            RETURNING storage_key
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(system_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|r| r.try_get::<String, _>("storage_key"))
            .transpose()?)
    }
}

#[async_trait]
impl LabResultStore for PgLabResultStore {
    async fn claim(&self, id: Uuid, attempt: u32) -> Result<ClaimOutcome, StoreError> {
        // Mirrors claim_allowed; `prev` captures the status before the update
        let row = sqlx::query(
            r#"
            WITH prev AS (
                SELECT id, processing_status FROM lab_results WHERE id = $1 FOR UPDATE
            )
            UPDATE lab_results l
            SET processing_status = 'processing', ingestion_attempt = $2, updated_at = NOW()
            FROM prev
            WHERE l.id = prev.id
              AND (
                (l.processing_status IN ('pending', 'processing', 'parsing')
                    AND l.ingestion_attempt <= $2)
                OR (l.processing_status = 'failed' AND l.ingestion_attempt < $2)
              )
            RETURNING prev.processing_status
            "#,
        )
        .bind(id)
        .bind(attempt_param(attempt))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let previous: String = row.try_get("processing_status")?;
            return Ok(ClaimOutcome::Claimed {
                previous: parse_status(&previous)?,
            });
        }

        let (status, current_attempt) = self.current_state(id).await?;
        if status.is_terminal() {
            Ok(ClaimOutcome::AlreadyTerminal(status))
        } else {
            Ok(ClaimOutcome::Superseded { current_attempt })
        }
    }

    async fn record_extracted_text(&self, id: Uuid, raw_text: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lab_results
            SET raw_text = $2, processing_status = 'parsing', updated_at = NOW()
            WHERE id = $1 AND processing_status = 'processing'
            "#,
        )
        .bind(id)
        .bind(raw_text)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let (found, _) = self.current_state(id).await?;
        Err(StoreError::StaleState {
            id,
            expected: ProcessingStatus::Processing,
            found,
        })
    }

    async fn replace_biomarkers(
        &self,
        id: Uuid,
        candidates: &[BiomarkerCandidate],
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock keeps a concurrent delete from interleaving with the replace
        let row = sqlx::query("SELECT processing_status FROM lab_results WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::NotFound(id))?;

        let status: String = row.try_get("processing_status")?;
        let found = parse_status(&status)?;
        if found != ProcessingStatus::Parsing {
            return Err(StoreError::StaleState {
                id,
                expected: ProcessingStatus::Parsing,
                found,
            });
        }

        let deleted = sqlx::query("DELETE FROM biomarkers WHERE lab_result_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for (position, candidate) in candidates.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO biomarkers (
                    id, lab_result_id, position, test_name, value, unit,
                    reference_range_low, reference_range_high, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(position as i32)
            .bind(&candidate.test_name)
            .bind(&candidate.value)
            .bind(&candidate.unit)
            .bind(&candidate.reference_range_low)
            .bind(&candidate.reference_range_high)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            lab_result_id = %id,
            replaced = deleted,
            inserted = candidates.len(),
            "Replaced biomarkers"
        );
        Ok(candidates.len())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        self.transition(id, ProcessingStatus::Parsing, ProcessingStatus::Completed)
            .await
    }

    async fn mark_failed(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE lab_results
            SET processing_status = 'failed', updated_at = NOW()
            WHERE id = $1 AND processing_status IN ('pending', 'processing', 'parsing')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "already terminal" from "deleted"
        self.current_state(id).await?;
        Ok(false)
    }
}
