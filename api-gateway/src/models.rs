// ==============================================================================
// models.rs - API Request/Response Models
// ==============================================================================
// Description: JSON bodies for the lab results API
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use labs_ingest::models::{Biomarker, LabResult, ProcessingStatus, RangeFlag};

/// Upload accepted; ingestion continues in the background
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub lab_result_id: Uuid,
    pub status: ProcessingStatus,
    pub file_name: String,
    pub size: usize,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
    pub message: String,
}

/// A lab result as shown to its owner (extracted text omitted)
#[derive(Debug, Serialize)]
pub struct LabResultView {
    pub id: Uuid,
    pub file_name: String,
    pub status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Signed, short-lived link to the original document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<LabResult> for LabResultView {
    fn from(lab: LabResult) -> Self {
        Self {
            id: lab.id,
            file_name: lab.file_name,
            status: lab.processing_status,
            created_at: lab.created_at,
            updated_at: lab.updated_at,
            download_url: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LabResultList {
    pub results: Vec<LabResultView>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: i64 = 20;
    pub const MAX_LIMIT: i64 = 100;

    /// `(limit, offset)` clamped to sane bounds
    pub fn bounds(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Serialize)]
pub struct BiomarkerView {
    pub id: Uuid,
    pub test_name: String,
    pub value: String,
    pub unit: Option<String>,
    pub reference_range_low: Option<String>,
    pub reference_range_high: Option<String>,
    pub range_flag: RangeFlag,
}

impl From<Biomarker> for BiomarkerView {
    fn from(b: Biomarker) -> Self {
        let range_flag = b.range_flag();
        Self {
            id: b.id,
            test_name: b.test_name,
            value: b.value,
            unit: b.unit,
            reference_range_low: b.reference_range_low,
            reference_range_high: b.reference_range_high,
            range_flag,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BiomarkersResponse {
    pub lab_result_id: Uuid,
    pub status: ProcessingStatus,
    /// Only a completed result has a final biomarker set
    pub is_final: bool,
    pub biomarkers: Vec<BiomarkerView>,
}

impl BiomarkersResponse {
    pub fn new(lab: &LabResult, biomarkers: Vec<Biomarker>) -> Self {
        Self {
            lab_result_id: lab.id,
            status: lab.processing_status,
            is_final: lab.processing_status == ProcessingStatus::Completed,
            biomarkers: biomarkers.into_iter().map(BiomarkerView::from).collect(),
        }
    }
}

/// Signed read parameters for `/files/{*key}`
#[derive(Debug, Deserialize)]
pub struct SignedFileQuery {
    pub expires: i64,
    pub signature: String,
}

/// API information response
#[derive(Debug, Serialize)]
pub struct ApiInfoResponse {
    pub service: &'static str,
    pub version: &'static str,
    pub endpoints: Vec<&'static str>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub database: bool,
    pub redis: bool,
    pub storage: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lab(status: ProcessingStatus) -> LabResult {
        LabResult {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            system_id: "clinic-a".to_string(),
            file_name: "cbc.pdf".to_string(),
            storage_key: "labs/clinic-a/alice/1-cbc.pdf".to_string(),
            file_url: None,
            raw_text: Some("Hemoglobin 14.2 g/dL 13.5-17.5".to_string()),
            processing_status: status,
            ingestion_attempt: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn biomarker(value: &str, low: Option<&str>, high: Option<&str>) -> Biomarker {
        Biomarker {
            id: Uuid::new_v4(),
            lab_result_id: Uuid::nil(),
            test_name: "Hemoglobin".to_string(),
            value: value.to_string(),
            unit: Some("g/dL".to_string()),
            reference_range_low: low.map(String::from),
            reference_range_high: high.map(String::from),
            test_date: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_view_omits_raw_text() {
        let json = serde_json::to_value(LabResultView::from(lab(ProcessingStatus::Completed))).unwrap();
        assert!(json.get("raw_text").is_none());
        assert!(json.get("storage_key").is_none());
        assert!(json.get("download_url").is_none());
        assert_eq!(json["status"], "completed");
    }

    #[test]
    fn test_biomarkers_final_only_when_completed() {
        let processing = lab(ProcessingStatus::Processing);
        assert!(!BiomarkersResponse::new(&processing, vec![]).is_final);

        let completed = lab(ProcessingStatus::Completed);
        let response = BiomarkersResponse::new(
            &completed,
            vec![biomarker("18.0", Some("13.5"), Some("17.5"))],
        );
        assert!(response.is_final);
        assert_eq!(response.biomarkers[0].range_flag, RangeFlag::High);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["biomarkers"][0]["range_flag"], "high");
    }

    #[test]
    fn test_list_query_bounds() {
        let q = ListQuery { limit: None, offset: None };
        assert_eq!(q.bounds(), (ListQuery::DEFAULT_LIMIT, 0));

        let q = ListQuery { limit: Some(10_000), offset: Some(-5) };
        assert_eq!(q.bounds(), (ListQuery::MAX_LIMIT, 0));

        let q = ListQuery { limit: Some(0), offset: Some(40) };
        assert_eq!(q.bounds(), (1, 40));
    }
}
