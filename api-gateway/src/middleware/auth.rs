// ==============================================================================
// middleware/auth.rs - Forward-Auth Caller Identity
// ==============================================================================
// Description: Extract the caller's user and tenant from proxy-set headers
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================
//
// The upstream proxy authenticates the caller and sets X-User-Id and
// X-System-Id. Requests without both are rejected with 401. Both values end
// up in storage keys, so they are restricted to a path-safe alphabet.
//
// ==============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::models::ErrorResponse;

pub const USER_ID_HEADER: &str = "X-User-Id";
pub const SYSTEM_ID_HEADER: &str = "X-System-Id";

const MAX_IDENTITY_LEN: usize = 128;

/// Caller identity; every lab result query is scoped by both fields
///
/// # Example
/// ```rust,ignore
/// async fn my_handler(caller: TenantUser) -> impl IntoResponse {
///     format!("Hello, {} of {}!", caller.user_id, caller.system_id)
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantUser {
    pub user_id: String,
    pub system_id: String,
}

fn is_valid_identity(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_IDENTITY_LEN
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
}

fn identity_header(parts: &Parts, name: &'static str) -> Result<String, Response> {
    match parts.headers.get(name).and_then(|v| v.to_str().ok()) {
        Some(value) if is_valid_identity(value) => Ok(value.to_string()),
        Some(_) => Err(unauthorized(format!("Invalid {} header", name))),
        None => Err(unauthorized(format!("Missing {} header", name))),
    }
}

fn unauthorized(message: String) -> Response {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message))).into_response()
}

impl<S> FromRequestParts<S> for TenantUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(TenantUser {
            user_id: identity_header(parts, USER_ID_HEADER)?,
            system_id: identity_header(parts, SYSTEM_ID_HEADER)?,
        })
    }
}
