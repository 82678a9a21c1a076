// ==============================================================================
// config.rs - Worker Configuration
// ==============================================================================
// Description: Concurrency, retry and timeout settings for the ingestion worker
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use labs_ingest::config::IngestionConfig;

/// Upper bound for the exponential retry backoff
const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub redis_url: String,
    /// Jobs processed at once
    pub concurrency: usize,
    /// Deliveries before a job is dead-lettered
    pub max_attempts: u32,
    /// Bound on a whole job, extraction included
    pub job_timeout: Duration,
    pub retry_base_delay: Duration,
    /// Delay before re-queueing a job whose lab result is locked by another worker
    pub lock_retry_delay: Duration,
    pub ingestion: IngestionConfig,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let concurrency: usize = parse_or(&lookup, "WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            anyhow::bail!("WORKER_CONCURRENCY must be at least 1");
        }

        let max_attempts: u32 = parse_or(&lookup, "MAX_ATTEMPTS", 5)?;
        if max_attempts == 0 {
            anyhow::bail!("MAX_ATTEMPTS must be at least 1");
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: lookup("REDIS_URL")
                .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            concurrency,
            max_attempts,
            job_timeout: Duration::from_secs(parse_or(&lookup, "JOB_TIMEOUT_SECS", 300)?),
            retry_base_delay: Duration::from_millis(parse_or(&lookup, "RETRY_BASE_DELAY_MS", 2000)?),
            lock_retry_delay: Duration::from_millis(parse_or(&lookup, "LOCK_RETRY_DELAY_MS", 5000)?),
            ingestion: IngestionConfig::from_lookup(&lookup)?,
        })
    }

    /// Lock lifetime: long enough to outlive a job that hits its timeout
    pub fn lock_ttl(&self) -> Duration {
        self.job_timeout + Duration::from_secs(30)
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt - 1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(default),
    }
}
