//! Blob storage port.
//!
//! The filesystem adapter is content-addressed: `put` hashes the bytes and
//! returns the hex digest as the blob ref. Signed URLs are HMAC-SHA256 over
//! `ref|expiry` so a stateless frontend can hand them out without a DB trip.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes, returning an opaque blob ref.
    async fn put(&self, key: &str, bytes: &[u8]) -> AppResult<String>;

    async fn get(&self, blob_ref: &str) -> AppResult<Vec<u8>>;

    /// Time-limited URL for direct download. `expires_at` is a unix timestamp.
    fn signed_url(&self, blob_ref: &str, expires_at: i64) -> AppResult<String>;
}

/// Filesystem-backed store, sharded by the first two hex chars of the digest.
pub struct FsBlobStore {
    root: PathBuf,
    signing_key: Vec<u8>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, signing_key: &str) -> Self {
        Self {
            root: root.into(),
            signing_key: signing_key.as_bytes().to_vec(),
        }
    }

    fn path_for(&self, blob_ref: &str) -> AppResult<PathBuf> {
        if blob_ref.len() < 3 || !blob_ref.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::Validation(format!("bad blob ref: {blob_ref}")));
        }
        Ok(self.root.join(&blob_ref[..2]).join(blob_ref))
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.signing_key).expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Validate a signature produced by `signed_url`.
    pub fn verify_signature(&self, blob_ref: &str, expires_at: i64, sig: &str) -> bool {
        self.sign(&format!("{blob_ref}|{expires_at}")) == sig
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, _key: &str, bytes: &[u8]) -> AppResult<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        let path = self.path_for(&digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Internal(anyhow::Error::new(e)))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| AppError::Internal(anyhow::Error::new(e)))?;
        Ok(digest)
    }

    async fn get(&self, blob_ref: &str) -> AppResult<Vec<u8>> {
        let path = self.path_for(blob_ref)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AppError::NotFound(format!("blob {blob_ref}")))
            }
            Err(e) => Err(AppError::Internal(anyhow::Error::new(e))),
        }
    }

    fn signed_url(&self, blob_ref: &str, expires_at: i64) -> AppResult<String> {
        self.path_for(blob_ref)?;
        let sig = self.sign(&format!("{blob_ref}|{expires_at}"));
        Ok(format!("/blobs/{blob_ref}?exp={expires_at}&sig={sig}"))
    }
}

/// In-memory store for tests.
#[derive(Default, Clone)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, _key: &str, bytes: &[u8]) -> AppResult<String> {
        let digest = hex::encode(Sha256::digest(bytes));
        self.blobs.lock().insert(digest.clone(), bytes.to_vec());
        Ok(digest)
    }

    async fn get(&self, blob_ref: &str) -> AppResult<Vec<u8>> {
        self.blobs
            .lock()
            .get(blob_ref)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("blob {blob_ref}")))
    }

    fn signed_url(&self, blob_ref: &str, expires_at: i64) -> AppResult<String> {
        Ok(format!("memory://{blob_ref}?exp={expires_at}"))
    }
}
