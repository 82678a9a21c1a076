// ==============================================================================
// audit.rs - Audit Logging for Lab Result Operations
// ==============================================================================
// Description: Audit trail for uploads, deletions and ingestion outcomes
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Upload path
    LabUploaded,
    UploadRejected,
    LabDeleted,

    // Ingestion
    IngestionStarted,
    IngestionCompleted,
    IngestionFailed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::LabUploaded => "lab_uploaded",
            AuditEventType::UploadRejected => "upload_rejected",
            AuditEventType::LabDeleted => "lab_deleted",
            AuditEventType::IngestionStarted => "ingestion_started",
            AuditEventType::IngestionCompleted => "ingestion_completed",
            AuditEventType::IngestionFailed => "ingestion_failed",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSeverity::Info => "info",
            LogSeverity::Warning => "warning",
            LogSeverity::Error => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub user_id: Option<String>,
    pub system_id: Option<String>,
    /// Lab result the event concerns, when one exists
    pub lab_result_id: Option<Uuid>,
    pub result: String,
    pub details: serde_json::Value,
    pub severity: LogSeverity,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        user_id: Option<String>,
        lab_result_id: Option<Uuid>,
        details: serde_json::Value,
    ) -> Self {
        let (severity, result) = match event_type {
            AuditEventType::UploadRejected => (LogSeverity::Warning, "rejected"),
            AuditEventType::IngestionFailed => (LogSeverity::Error, "failure"),
            _ => (LogSeverity::Info, "success"),
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            user_id,
            system_id: None,
            lab_result_id,
            result: result.to_string(),
            details,
            severity,
        }
    }

    pub fn with_system(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    pub async fn log(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, timestamp, event_type, user_id, system_id,
                lab_result_id, result, details, severity
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(self.id)
        .bind(self.timestamp)
        .bind(self.event_type.as_str())
        .bind(&self.user_id)
        .bind(&self.system_id)
        .bind(self.lab_result_id)
        .bind(&self.result)
        .bind(&self.details)
        .bind(self.severity.as_str())
        .execute(pool)
        .await?;

        Ok(())
    }
}

/// Record an audit event, logging rather than propagating storage failures
///
/// Audit writes never decide the outcome of the operation being audited.
pub async fn log_event(pool: &PgPool, event: AuditEvent) {
    if let Err(e) = event.log(pool).await {
        tracing::warn!(
            event_type = event.event_type.as_str(),
            lab_result_id = ?event.lab_result_id,
            "Failed to write audit event: {}",
            e
        );
    }
}
