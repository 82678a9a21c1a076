// ==============================================================================
// models.rs - Lab Result & Biomarker Data Models
// ==============================================================================
// Description: Persisted entities and the processing status state machine
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Processing status of a lab result document
///
/// `pending -> processing -> parsing -> completed`, with `failed` reachable
/// from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Parsing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const NON_TERMINAL: [ProcessingStatus; 3] = [
        ProcessingStatus::Pending,
        ProcessingStatus::Processing,
        ProcessingStatus::Parsing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Pending => "pending",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Parsing => "parsing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown processing status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ProcessingStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProcessingStatus::Pending),
            "processing" => Ok(ProcessingStatus::Processing),
            "parsing" => Ok(ProcessingStatus::Parsing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One uploaded lab document and its processing lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabResult {
    pub id: Uuid,
    pub user_id: String,
    /// Tenant ("system") that owns the record
    pub system_id: String,
    pub file_name: String,
    pub storage_key: String,
    pub file_url: Option<String>,
    /// Raw extracted text, set once extraction succeeds
    pub raw_text: Option<String>,
    pub processing_status: ProcessingStatus,
    /// Delivery attempt that last claimed this record
    pub ingestion_attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the upload path when creating a lab result
#[derive(Debug, Clone)]
pub struct NewLabResult {
    pub user_id: String,
    pub system_id: String,
    pub file_name: String,
    pub storage_key: String,
    pub file_url: Option<String>,
}

/// Parser output for a single line of extracted text
///
/// Numeric fields keep the source representation; see [`Biomarker`] for the
/// on-demand numeric accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BiomarkerCandidate {
    pub test_name: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range_low: Option<String>,
    pub reference_range_high: Option<String>,
}

/// A persisted biomarker row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Biomarker {
    pub id: Uuid,
    pub lab_result_id: Uuid,
    pub test_name: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range_low: Option<String>,
    pub reference_range_high: Option<String>,
    pub test_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Position of a value relative to its reference range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeFlag {
    Low,
    Normal,
    High,
    Unknown,
}

impl Biomarker {
    /// Lower-cased, whitespace-collapsed test name used for classification
    pub fn normalized_name(&self) -> String {
        self.test_name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }

    pub fn numeric_value(&self) -> Option<f64> {
        parse_decimal(&self.value)
    }

    pub fn numeric_range(&self) -> (Option<f64>, Option<f64>) {
        (
            self.reference_range_low.as_deref().and_then(parse_decimal),
            self.reference_range_high.as_deref().and_then(parse_decimal),
        )
    }

    pub fn range_flag(&self) -> RangeFlag {
        let Some(value) = self.numeric_value() else {
            return RangeFlag::Unknown;
        };

        match self.numeric_range() {
            (None, None) => RangeFlag::Unknown,
            (Some(low), _) if value < low => RangeFlag::Low,
            (_, Some(high)) if value > high => RangeFlag::High,
            _ => RangeFlag::Normal,
        }
    }
}

fn parse_decimal(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}
