//! Blob role: content-addressed binary attachments.

use super::{Storage, Timestamp};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key of a blob: lower-case hex SHA-256 of its bytes.
pub fn blob_key(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub mime: String,
    pub created_at: Timestamp,
}

impl BlobRecord {
    /// Record keyed by the hash of `data`.
    pub fn new(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            key: blob_key(&data),
            data,
            mime: mime.into(),
            created_at: super::now(),
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Fails with an integrity error unless the key is the hash of the data.
    pub fn verify(&self) -> Result<()> {
        let actual = blob_key(&self.data);
        if actual == self.key {
            Ok(())
        } else {
            Err(StoreError::Integrity(format!(
                "blob {} hashes to {}",
                self.key, actual
            )))
        }
    }
}

/// Listing entry without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedBlobRecord {
    pub key: String,
    pub mime: String,
    pub size: u64,
    pub created_at: Timestamp,
}

#[async_trait]
pub trait BlobStorage: Storage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>>;

    /// Store a blob. Re-setting a soft-deleted key revives it.
    async fn set(&self, blob: BlobRecord) -> Result<()>;

    /// Soft delete, or remove the bytes immediately when `permanently`.
    async fn delete(&self, key: &str, permanently: bool) -> Result<()>;

    /// Permanently remove every soft-deleted blob. Idempotent.
    async fn release(&self) -> Result<()>;

    /// Live blobs, sorted by key.
    async fn list(&self) -> Result<Vec<ListedBlobRecord>>;

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|b| b.key == key))
    }
}
