// ==============================================================================
// config.rs - API Gateway Configuration
// ==============================================================================
// Description: Listener, connection and CORS settings for the lab results API
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use std::time::Duration;

use labs_ingest::config::DEFAULT_READ_URL_TTL_SECS;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub port: u16,
    /// Origins allowed by CORS (CORS_ALLOWED_ORIGINS, comma-separated)
    pub cors_origins: Vec<String>,
    /// Lifetime of the signed download links handed out by the status endpoint
    pub download_url_ttl: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = match lookup("GATEWAY_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("GATEWAY_PORT must be a port number, got {:?}", raw))?,
            None => 8099,
        };

        let download_url_ttl = match lookup("READ_URL_TTL_SECS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("READ_URL_TTL_SECS must be a number, got {:?}", raw))?,
            None => DEFAULT_READ_URL_TTL_SECS,
        };

        let cors_origins = lookup("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            port,
            cors_origins,
            download_url_ttl: Duration::from_secs(download_url_ttl),
        })
    }
}
