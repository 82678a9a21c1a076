// ==============================================================================
// schema.rs - PostgreSQL Schema
// ==============================================================================
// Description: Tables for lab results, biomarkers and the audit log, created
//              idempotently at service start
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use sqlx::PgPool;
use tracing::info;

/// Safe to run on every boot
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS lab_results (
    id                 UUID PRIMARY KEY,
    user_id            TEXT NOT NULL,
    system_id          TEXT NOT NULL,
    file_name          TEXT NOT NULL,
    storage_key        TEXT NOT NULL,
    file_url           TEXT,
    raw_text           TEXT,
    processing_status  TEXT NOT NULL DEFAULT 'pending'
        CHECK (processing_status IN ('pending', 'processing', 'parsing', 'completed', 'failed')),
    ingestion_attempt  INT NOT NULL DEFAULT 0 CHECK (ingestion_attempt >= 0),
    created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_lab_results_owner
    ON lab_results (user_id, system_id, created_at DESC);

CREATE TABLE IF NOT EXISTS biomarkers (
    id                    UUID PRIMARY KEY,
    lab_result_id         UUID NOT NULL REFERENCES lab_results (id) ON DELETE CASCADE,
    position              INT NOT NULL,
    test_name             TEXT NOT NULL,
    value                 TEXT NOT NULL,
    unit                  TEXT,
    reference_range_low   TEXT,
    reference_range_high  TEXT,
    test_date             TIMESTAMPTZ,
    notes                 TEXT,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (lab_result_id, position)
);

CREATE TABLE IF NOT EXISTS audit_log (
    id             UUID PRIMARY KEY,
    timestamp      TIMESTAMPTZ NOT NULL,
    event_type     TEXT NOT NULL,
    user_id        TEXT,
    system_id      TEXT,
    lab_result_id  UUID,
    result         TEXT NOT NULL,
    details        JSONB NOT NULL DEFAULT '{}'::jsonb,
    severity       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_log_lab_result ON audit_log (lab_result_id, timestamp);
"#;

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    info!("Database schema ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatus;

    #[test]
    fn test_status_check_lists_every_status() {
        for status in ProcessingStatus::NON_TERMINAL
            .into_iter()
            .chain([ProcessingStatus::Completed, ProcessingStatus::Failed])
        {
            assert!(
                SCHEMA_SQL.contains(&format!("'{}'", status.as_str())),
                "status {} missing from CHECK constraint",
                status
            );
        }
    }

    #[test]
    fn test_biomarkers_cascade_with_lab_result() {
        assert!(SCHEMA_SQL.contains("REFERENCES lab_results (id) ON DELETE CASCADE"));
    }
}
