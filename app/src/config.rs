// ==============================================================================
// config.rs - Environment Configuration
// ==============================================================================
// Description: Storage, extraction and ingestion settings read from the environment
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_READ_URL_TTL_SECS: u64 = 300;

/// Filesystem object store settings
#[derive(Clone)]
pub struct StorageConfig {
    /// Directory objects are written under
    pub root: PathBuf,
    /// Base URL that signed read URLs are built on, e.g. `http://gateway:8090/api/labs/files`
    pub public_base_url: String,
    pub signing_secret: Vec<u8>,
}

impl std::fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageConfig")
            .field("root", &self.root)
            .field("public_base_url", &self.public_base_url)
            .field("signing_secret", &"<redacted>")
            .finish()
    }
}

impl StorageConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let signing_secret = match lookup("STORAGE_SIGNING_SECRET") {
            Some(secret) => secret,
            None => Self::read_signing_secret(&lookup)?,
        };

        if signing_secret.trim().len() < 16 {
            anyhow::bail!("STORAGE_SIGNING_SECRET must be at least 16 characters");
        }

        Ok(Self {
            root: lookup("STORAGE_ROOT")
                .unwrap_or_else(|| "/var/lib/labs/objects".to_string())
                .into(),
            public_base_url: lookup("STORAGE_PUBLIC_BASE_URL")
                .context("STORAGE_PUBLIC_BASE_URL not set")?
                .trim_end_matches('/')
                .to_string(),
            signing_secret: signing_secret.trim().as_bytes().to_vec(),
        })
    }

    /// Read the URL signing secret from a secret file
    fn read_signing_secret(lookup: &impl Fn(&str) -> Option<String>) -> Result<String> {
        let secret_file = lookup("STORAGE_SIGNING_SECRET_FILE")
            .context("STORAGE_SIGNING_SECRET or STORAGE_SIGNING_SECRET_FILE must be set")?;

        fs::read_to_string(&secret_file)
            .with_context(|| format!("Failed to read signing secret from {}", secret_file))
    }
}

/// Text extraction settings
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// OCR service base URL; without it only plain-text documents can be extracted
    pub ocr_service_url: Option<String>,
    pub timeout: Duration,
}

impl ExtractionConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let timeout_secs = match lookup("EXTRACTION_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse()
                .context("EXTRACTION_TIMEOUT_SECS must be a whole number of seconds")?,
            None => DEFAULT_EXTRACTION_TIMEOUT_SECS,
        };

        Ok(Self {
            ocr_service_url: lookup("OCR_SERVICE_URL")
                .filter(|url| !url.trim().is_empty())
                .map(|url| url.trim_end_matches('/').to_string()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Settings the ingestion pipeline itself needs
#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Lifetime of the read URL requested in the fetch step
    pub read_url_ttl: Duration,
    pub extraction_timeout: Duration,
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let read_url_ttl_secs = match lookup("READ_URL_TTL_SECS") {
            Some(raw) => raw
                .parse()
                .context("READ_URL_TTL_SECS must be a whole number of seconds")?,
            None => DEFAULT_READ_URL_TTL_SECS,
        };

        Ok(Self {
            read_url_ttl: Duration::from_secs(read_url_ttl_secs),
            extraction_timeout: ExtractionConfig::from_lookup(&lookup)?.timeout,
        })
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            read_url_ttl: Duration::from_secs(DEFAULT_READ_URL_TTL_SECS),
            extraction_timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS),
        }
    }
}
