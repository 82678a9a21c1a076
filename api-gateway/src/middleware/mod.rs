// ==============================================================================
// middleware/mod.rs - API Gateway Middleware Modules
// ==============================================================================
// Description: Request extractors shared by the lab results handlers
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

pub mod auth;

pub use auth::TenantUser;
