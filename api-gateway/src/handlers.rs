// ==============================================================================
// handlers.rs - API Request Handlers
// ==============================================================================
// Description: HTTP request handlers for the lab results API
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use labs_ingest::audit::{log_event, AuditEvent, AuditEventType};
use labs_ingest::repository::StoreError;
use labs_ingest::storage::{ObjectStore, StorageError};
use labs_ingest::validator::{DocumentKind, ValidationError};

use crate::{
    intake::IntakeError,
    middleware::TenantUser,
    models::*,
    state::AppState,
};

/// Multipart field carrying the document
const FILE_FIELD: &str = "file";

/// Root endpoint - API information
pub async fn root() -> Json<ApiInfoResponse> {
    Json(ApiInfoResponse {
        service: "Lab Results API Gateway",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: vec![
            "/health - Health check",
            "/ready - Readiness check",
            "/api/labs/results - Upload a lab document (POST) or list results (GET)",
            "/api/labs/results/{id} - Get status (GET) or delete (DELETE)",
            "/api/labs/results/{id}/biomarkers - Extracted biomarkers (GET)",
            "/api/labs/files/{key} - Signed document download (GET)",
        ],
    })
}

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store().ping().await.is_ok();
    let redis = state.queue().ping().await;
    let storage = state.objects().check_root().await;

    let queue_depth = if redis {
        state.queue().queue_length().await.ok()
    } else {
        None
    };

    let ready = database && redis && storage;
    let response = ReadinessResponse {
        ready,
        database,
        redis,
        storage,
        queue_depth,
    };

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// Upload a lab document and queue it for ingestion
pub async fn upload_lab_result(
    State(state): State<AppState>,
    caller: TenantUser,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut upload: Option<(String, Vec<u8>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(format!("Malformed multipart body: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::BadRequest("File field has no filename".to_string()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(format!("Failed to read upload: {}", e)))?;

        upload = Some((filename, data.to_vec()));
        break;
    }

    let (filename, data) = upload
        .ok_or_else(|| AppError::BadRequest(format!("Missing '{}' field", FILE_FIELD)))?;

    info!(
        user_id = %caller.user_id,
        system_id = %caller.system_id,
        size = data.len(),
        "Received lab document upload"
    );

    let accepted = match state
        .intake()
        .accept(&caller.user_id, &caller.system_id, &filename, data)
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            if let IntakeError::Validation(reason) = &e {
                audit(
                    &state,
                    &caller,
                    AuditEventType::UploadRejected,
                    None,
                    json!({ "filename": filename, "reason": reason.to_string() }),
                )
                .await;
            }
            return Err(e.into());
        }
    };

    let lab = accepted.lab_result;
    let document = accepted.document;

    audit(
        &state,
        &caller,
        AuditEventType::LabUploaded,
        Some(lab.id),
        json!({
            "file_name": lab.file_name,
            "size": document.size,
            "kind": document.kind.content_type(),
            "sha256": document.hash_sha256,
        }),
    )
    .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            lab_result_id: lab.id,
            status: lab.processing_status,
            file_name: lab.file_name,
            size: document.size,
            sha256: document.hash_sha256,
            created_at: lab.created_at,
            message: "Lab document accepted; biomarkers will be available once ingestion completes"
                .to_string(),
        }),
    ))
}

/// List the caller's lab results, newest first
pub async fn list_lab_results(
    State(state): State<AppState>,
    caller: TenantUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<LabResultList>, AppError> {
    let (limit, offset) = query.bounds();
    let results = state
        .store()
        .list_for_owner(&caller.user_id, &caller.system_id, limit, offset)
        .await?;

    Ok(Json(LabResultList {
        results: results.into_iter().map(LabResultView::from).collect(),
        limit,
        offset,
    }))
}

/// Status polling for one lab result
pub async fn get_lab_result(
    State(state): State<AppState>,
    caller: TenantUser,
    Path(id): Path<Uuid>,
) -> Result<Json<LabResultView>, AppError> {
    let lab = state
        .store()
        .find_for_owner(id, &caller.user_id, &caller.system_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let download_url = match state
        .objects()
        .read_url(&lab.storage_key, state.download_url_ttl())
        .await
    {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(lab_result_id = %lab.id, "No download link for lab result: {}", e);
            None
        }
    };

    let mut view = LabResultView::from(lab);
    view.download_url = download_url;
    Ok(Json(view))
}

/// Biomarkers extracted so far; `is_final` once ingestion has completed
pub async fn get_biomarkers(
    State(state): State<AppState>,
    caller: TenantUser,
    Path(id): Path<Uuid>,
) -> Result<Json<BiomarkersResponse>, AppError> {
    let (lab, biomarkers) = state
        .store()
        .biomarkers_for_owner(id, &caller.user_id, &caller.system_id)
        .await?
        .ok_or(AppError::NotFound)?;

    Ok(Json(BiomarkersResponse::new(&lab, biomarkers)))
}

/// Delete a lab result, its biomarkers and the stored document
pub async fn delete_lab_result(
    State(state): State<AppState>,
    caller: TenantUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    info!(lab_result_id = %id, "Deleting lab result");

    // Row first: an in-flight ingestion job sees NotFound and stops
    let storage_key = state
        .store()
        .delete_for_owner(id, &caller.user_id, &caller.system_id)
        .await?
        .ok_or(AppError::NotFound)?;

    let object_deleted = match state.objects().delete(&storage_key).await {
        Ok(()) => true,
        Err(e) => {
            error!(
                lab_result_id = %id,
                storage_key = %storage_key,
                "Lab result deleted but document removal failed: {}", e
            );
            false
        }
    };

    audit(
        &state,
        &caller,
        AuditEventType::LabDeleted,
        Some(id),
        json!({ "storage_key": storage_key, "object_deleted": object_deleted }),
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Serve a document through a signed, time-limited URL
pub async fn download_file(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedFileQuery>,
) -> Result<Response, AppError> {
    let key = key.trim_start_matches('/');
    let path = state
        .objects()
        .resolve_signed(key, query.expires, &query.signature)
        .await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::Internal(format!("Failed to open {}: {}", key, e)))?;

    let content_type = key
        .rsplit_once('.')
        .and_then(|(_, ext)| DocumentKind::from_extension(ext))
        .map(|kind| kind.content_type())
        .unwrap_or("application/octet-stream");

    let filename = key.rsplit('/').next().unwrap_or(key);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .header(header::CACHE_CONTROL, "private, no-store")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(format!("Failed to build response: {}", e)))
}

async fn audit(
    state: &AppState,
    caller: &TenantUser,
    event_type: AuditEventType,
    lab_result_id: Option<Uuid>,
    details: serde_json::Value,
) {
    let event = AuditEvent::new(
        event_type,
        Some(caller.user_id.clone()),
        lab_result_id,
        details,
    )
    .with_system(caller.system_id.clone());
    log_event(state.db_pool(), event).await;
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    NotFound,
    BadRequest(String),
    PayloadTooLarge(String),
    Forbidden(String),
    Unavailable(String),
    Internal(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::NotFound,
            other => AppError::Internal(format!("Database error: {}", other)),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(_) | StorageError::InvalidKey(_) => AppError::NotFound,
            StorageError::Expired => AppError::Forbidden("Link expired".to_string()),
            StorageError::BadSignature => AppError::Forbidden("Invalid signature".to_string()),
            StorageError::Unavailable(msg) => AppError::Unavailable(msg),
            other => AppError::Internal(format!("Storage error: {}", other)),
        }
    }
}

impl From<IntakeError> for AppError {
    fn from(e: IntakeError) -> Self {
        match e {
            IntakeError::Validation(ValidationError::TooLarge { .. }) => {
                AppError::PayloadTooLarge(e.to_string())
            }
            IntakeError::Validation(reason) => AppError::BadRequest(reason.to_string()),
            IntakeError::Enqueue { .. } => AppError::Unavailable(e.to_string()),
            IntakeError::Storage(_) | IntakeError::Record(_) => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorResponse::new("Resource not found"),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, ErrorResponse::new(msg))
            }
            AppError::Forbidden(msg) => (
                StatusCode::FORBIDDEN,
                ErrorResponse::with_details("Access denied", msg),
            ),
            AppError::Unavailable(msg) => {
                error!("Service unavailable: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ErrorResponse::new("Service temporarily unavailable, please retry"),
                )
            }
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}
