// ==============================================================================
// storage.rs - Object Storage
// ==============================================================================
// Description: ObjectStore trait and a filesystem implementation with signed,
//              time-limited read URLs
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::secure_delete::secure_delete_file;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object URL: {0}")]
    InvalidUrl(String),

    #[error("Read URL has expired")]
    Expired,

    #[error("Read URL signature mismatch")]
    BadSignature,

    #[error("URL signing failed: {0}")]
    Signing(String),

    #[error("Storage I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete {key}: {message}")]
    Delete { key: String, message: String },

    #[error("Object store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a successful `put`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    /// Canonical (unsigned) location of the object
    pub url: String,
}

/// Blob storage for uploaded documents
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<StoredObject, StorageError>;

    /// Time-limited URL that `fetch_url` will accept until `ttl` elapses
    async fn read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, StorageError>;

    /// Remove an object; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Object key for an upload: `labs/{system}/{user}/{timestamp_millis}-{safe_name}`
pub fn storage_key(system_id: &str, user_id: &str, safe_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "labs/{}/{}/{}-{}",
        system_id,
        user_id,
        at.timestamp_millis(),
        safe_name
    )
}

/// Reject keys that could escape the storage root
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |reason: &str| Err(StorageError::InvalidKey(format!("{}: {:?}", reason, key)));

    if key.is_empty() {
        return invalid("empty key");
    }
    if key.starts_with('/') {
        return invalid("absolute key");
    }
    if key.contains(['\\', '\0', '?', '#', '%']) {
        return invalid("forbidden character");
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return invalid("empty or relative segment");
    }

    Ok(())
}

/// HMAC-SHA256 signer for read URLs
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, key: &str, expires: i64) -> Result<HmacSha256, StorageError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StorageError::Signing(e.to_string()))?;
        mac.update(key.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, key: &str, expires: i64) -> Result<String, StorageError> {
        let signature = self.mac(key, expires)?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(signature))
    }

    /// Check expiry (unix seconds) first, then the signature in constant time
    pub fn verify(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
        now: i64,
    ) -> Result<(), StorageError> {
        if now > expires {
            return Err(StorageError::Expired);
        }

        let provided = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| StorageError::BadSignature)?;

        self.mac(key, expires)?
            .verify_slice(&provided)
            .map_err(|_| StorageError::BadSignature)
    }
}

/// Object store rooted at a local directory
///
/// Read URLs point at the gateway's file route, which checks the signature
/// with [`FilesystemObjectStore::resolve_signed`].
pub struct FilesystemObjectStore {
    root: PathBuf,
    base_url: Url,
    signer: UrlSigner,
}

impl FilesystemObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        // Trailing slash so that Url::join appends to, rather than replaces, the last segment
        let base_url = Url::parse(&format!("{}/", config.public_base_url.trim_end_matches('/')))
            .map_err(|e| StorageError::InvalidUrl(format!("{}: {}", config.public_base_url, e)))?;

        Ok(Self {
            root: config.root.clone(),
            base_url,
            signer: UrlSigner::new(config.signing_secret.clone()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the storage root exists and is a directory
    pub async fn check_root(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn object_url(&self, key: &str) -> Result<Url, StorageError> {
        self.base_url
            .join(key)
            .map_err(|e| StorageError::InvalidUrl(format!("{}: {}", key, e)))
    }

    /// Verify a signed read request and return the object's path
    pub async fn resolve_signed(
        &self,
        key: &str,
        expires: i64,
        signature: &str,
    ) -> Result<PathBuf, StorageError> {
        let path = self.path_for(key)?;
        self.signer
            .verify(key, expires, signature, Utc::now().timestamp())?;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(StorageError::NotFound(key.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io {
                key: key.to_string(),
                source: e,
            }),
        }
    }

    /// Split one of this store's read URLs into `(key, expires, signature)`
    fn parse_read_url(&self, url: &str) -> Result<(String, i64, String), StorageError> {
        let url = Url::parse(url).map_err(|e| StorageError::InvalidUrl(e.to_string()))?;

        if url.origin() != self.base_url.origin() {
            return Err(StorageError::InvalidUrl(format!(
                "foreign origin: {}",
                url.origin().ascii_serialization()
            )));
        }

        let key = url
            .path()
            .strip_prefix(self.base_url.path())
            .ok_or_else(|| StorageError::InvalidUrl(format!("outside store: {}", url.path())))?
            .to_string();

        let mut expires = None;
        let mut signature = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "expires" => expires = value.parse::<i64>().ok(),
                "signature" => signature = Some(value.into_owned()),
                _ => {}
            }
        }

        match (expires, signature) {
            (Some(expires), Some(signature)) => Ok((key, expires, signature)),
            _ => Err(StorageError::InvalidUrl("missing expires or signature".to_string())),
        }
    }
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(&self, bytes: Vec<u8>, key: &str) -> Result<StoredObject, StorageError> {
        let path = self.path_for(key)?;
        let io_err = |source| StorageError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Write then rename so readers never observe a partial object
        let tmp_path = path.with_file_name(format!(".upload-{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &bytes).await.map_err(io_err)?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(io_err(e));
        }

        info!(storage_key = %key, size = bytes.len(), "Stored object");

        Ok(StoredObject {
            key: key.to_string(),
            url: self.object_url(key)?.to_string(),
        })
    }

    async fn read_url(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await.map_err(|source| StorageError::Io {
            key: key.to_string(),
            source,
        })? {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::Signing(format!("invalid ttl: {}", e)))?;
        let expires = (Utc::now() + ttl).timestamp();
        let signature = self.signer.sign(key, expires)?;

        let mut url = self.object_url(key)?;
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);

        debug!(storage_key = %key, expires, "Issued signed read URL");
        Ok(url.into())
    }

    async fn fetch_url(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let (key, expires, signature) = self.parse_read_url(url)?;
        let path = self.resolve_signed(&key, expires, &signature).await?;

        tokio::fs::read(&path).await.map_err(|source| StorageError::Io { key, source })
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        match tokio::fs::try_exists(&path).await {
            Ok(false) => {
                debug!(storage_key = %key, "Object already absent");
                return Ok(());
            }
            Ok(true) => {}
            Err(source) => {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    source,
                })
            }
        }

        secure_delete_file(&path).await.map_err(|e| {
            warn!(storage_key = %key, "Secure delete failed: {:#}", e);
            StorageError::Delete {
                key: key.to_string(),
                message: format!("{:#}", e),
            }
        })?;

        info!(storage_key = %key, "Deleted object");
        Ok(())
    }
}
