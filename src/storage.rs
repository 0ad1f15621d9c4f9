// src/storage.rs
//! Object-store collaborator.
//!
//! The pipeline only ever talks to the `ObjectStore` trait; the local-disk
//! implementation keeps generated assets under a configured media root and
//! hands out signed, expiring download URLs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes under a key and return the reference later stages use.
    async fn put(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<String, PipelineError>;

    /// Fetch the bytes behind a reference.
    async fn get(&self, reference: &str) -> Result<Vec<u8>, PipelineError>;

    /// Produce a signed URL valid for `ttl_secs` seconds.
    async fn presign(&self, reference: &str, ttl_secs: u64) -> Result<String, PipelineError>;
}

/// Local-filesystem store. References are relative keys under `root`.
pub struct LocalObjectStore {
    root: PathBuf,
    presign_secret: String,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, presign_secret: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            presign_secret: presign_secret.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, PipelineError> {
        // Keys are always relative and must not climb out of the root.
        if reference.starts_with('/') || reference.split('/').any(|part| part == "..") {
            return Err(PipelineError::Storage(format!(
                "invalid object key: {}",
                reference
            )));
        }
        Ok(self.root.join(reference))
    }

    fn signature(&self, reference: &str, expires: u64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.presign_secret.as_bytes());
        hasher.update(b":");
        hasher.update(reference.as_bytes());
        hasher.update(b":");
        hasher.update(expires.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Validate a signed URL produced by `presign`. Used by the media
    /// download route.
    pub fn verify_signature(&self, reference: &str, expires: u64, signature: &str, now: u64) -> bool {
        if now > expires {
            return false;
        }
        self.signature(reference, expires) == signature
    }

    pub fn path_for(&self, reference: &str) -> Result<PathBuf, PipelineError> {
        self.resolve(reference)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, bytes: &[u8], key: &str, content_type: &str) -> Result<String, PipelineError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::Storage(format!("create dir failed: {}", e)))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Storage(format!("write {} failed: {}", key, e)))?;

        tracing::debug!(
            "Stored object {} ({} bytes, {})",
            key,
            bytes.len(),
            content_type
        );
        Ok(key.to_string())
    }

    async fn get(&self, reference: &str) -> Result<Vec<u8>, PipelineError> {
        let path = self.resolve(reference)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::Storage(format!("read {} failed: {}", reference, e)))
    }

    async fn presign(&self, reference: &str, ttl_secs: u64) -> Result<String, PipelineError> {
        // Sanity check that the object exists before handing out a URL.
        let path = self.resolve(reference)?;
        if !path.exists() {
            return Err(PipelineError::Storage(format!(
                "object not found: {}",
                reference
            )));
        }

        let expires = now_unix() + ttl_secs;
        let sig = self.signature(reference, expires);
        Ok(format!("/media/{}?expires={}&sig={}", reference, expires, sig))
    }
}

pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Object key for a generated asset, grouped by session and kind.
pub fn asset_key(session_id: uuid::Uuid, kind: &str, position: usize, extension: &str) -> String {
    format!("sessions/{}/{}/{:03}.{}", session_id, kind, position, extension)
}
