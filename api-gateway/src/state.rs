// ==============================================================================
// state.rs - Application State Management
// ==============================================================================
// Description: Shared application state for the lab results API
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::Client as RedisClient;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use labs_ingest::config::StorageConfig;
use labs_ingest::repository::PgLabResultStore;
use labs_ingest::schema::ensure_schema;
use labs_ingest::storage::FilesystemObjectStore;
use labs_ingest::validator::DocumentValidator;

use crate::config::GatewayConfig;
use crate::intake::Intake;
use crate::queue::JobQueue;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    /// PostgreSQL connection pool (also used for audit events)
    db_pool: PgPool,

    /// Lab result records
    store: PgLabResultStore,

    /// Uploaded documents
    objects: FilesystemObjectStore,

    /// Producer side of the ingestion queue
    queue: JobQueue,

    validator: DocumentValidator,

    download_url_ttl: Duration,
}

impl AppState {
    /// Connect to PostgreSQL, Redis and the object store
    pub async fn connect(config: &GatewayConfig) -> Result<Self> {
        let db_pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL");

        ensure_schema(&db_pool)
            .await
            .context("Failed to prepare database schema")?;

        let redis_client = RedisClient::open(config.redis_url.as_str())
            .context("Failed to create Redis client")?;
        let redis_conn = ConnectionManager::new(redis_client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis");

        let storage_config = StorageConfig::from_env().context("Invalid storage configuration")?;
        let objects = FilesystemObjectStore::new(&storage_config)
            .context("Failed to initialize object store")?;
        if !objects.check_root().await {
            anyhow::bail!("Storage root not accessible: {:?}", storage_config.root);
        }

        Ok(Self {
            inner: Arc::new(AppStateInner {
                store: PgLabResultStore::new(db_pool.clone()),
                db_pool,
                objects,
                queue: JobQueue::new(redis_conn),
                validator: DocumentValidator::new(),
                download_url_ttl: config.download_url_ttl,
            }),
        })
    }

    pub fn db_pool(&self) -> &PgPool {
        &self.inner.db_pool
    }

    pub fn store(&self) -> &PgLabResultStore {
        &self.inner.store
    }

    pub fn objects(&self) -> &FilesystemObjectStore {
        &self.inner.objects
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn validator(&self) -> &DocumentValidator {
        &self.inner.validator
    }

    pub fn download_url_ttl(&self) -> Duration {
        self.inner.download_url_ttl
    }

    /// The upload pipeline wired to this state's collaborators
    pub fn intake(&self) -> Intake<'_> {
        Intake {
            validator: &self.inner.validator,
            objects: &self.inner.objects,
            records: &self.inner.store,
            jobs: &self.inner.queue,
        }
    }
}
