use super::{NativeFileDb, write_atomic};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    BlobRecord, BlobStorage, BlobSyncStorage, ListedBlobRecord, Storage, StorageType, Timestamp,
    now,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Sidecar metadata stored next to the blob bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobMeta {
    mime: String,
    size: u64,
    created_at: Timestamp,
    #[serde(default)]
    deleted_at: Option<Timestamp>,
}

pub struct NativeBlobStorage {
    db: Arc<NativeFileDb>,
}

impl NativeBlobStorage {
    pub fn new(db: Arc<NativeFileDb>) -> Self {
        Self { db }
    }

    async fn meta(&self, key: &str) -> Result<Option<BlobMeta>> {
        match tokio::fs::read(self.db.blob_path(key, "json")?).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_meta(&self, key: &str, meta: &BlobMeta) -> Result<()> {
        write_atomic(&self.db.blob_path(key, "json")?, &serde_json::to_vec(meta)?).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        for extension in ["bin", "json"] {
            match tokio::fs::remove_file(self.db.blob_path(key, extension)?).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Every key with metadata, live or soft-deleted.
    async fn all(&self) -> Result<Vec<(String, BlobMeta)>> {
        // Connecting creates the directory; reading before that sees nothing.
        let mut entries = match tokio::fs::read_dir(self.db.dir().join("blobs")).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut blobs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.meta(key).await {
                Ok(Some(meta)) => blobs.push((key.to_string(), meta)),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable blob metadata {}: {}", key, e),
            }
        }
        blobs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(blobs)
    }
}

impl Storage for NativeBlobStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Blob
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl BlobStorage for NativeBlobStorage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>> {
        let Some(meta) = self.meta(key).await? else {
            return Ok(None);
        };
        if meta.deleted_at.is_some() {
            return Ok(None);
        }
        let data = match tokio::fs::read(self.db.blob_path(key, "bin")?).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(BlobRecord {
            key: key.to_string(),
            data,
            mime: meta.mime,
            created_at: meta.created_at,
        }))
    }

    async fn set(&self, blob: BlobRecord) -> Result<()> {
        blob.verify()?;
        match self.meta(&blob.key).await? {
            Some(mut meta) => {
                meta.deleted_at = None;
                meta.mime = blob.mime;
                self.write_meta(&blob.key, &meta).await
            }
            None => {
                // Bytes first: metadata marks the blob as present.
                write_atomic(&self.db.blob_path(&blob.key, "bin")?, &blob.data).await?;
                let meta = BlobMeta {
                    size: blob.size(),
                    mime: blob.mime,
                    created_at: blob.created_at,
                    deleted_at: None,
                };
                self.write_meta(&blob.key, &meta).await
            }
        }
    }

    async fn delete(&self, key: &str, permanently: bool) -> Result<()> {
        if permanently {
            return self.remove(key).await;
        }
        if let Some(mut meta) = self.meta(key).await? {
            if meta.deleted_at.is_none() {
                meta.deleted_at = Some(now());
                self.write_meta(key, &meta).await?;
            }
        }
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let mut released = 0;
        for (key, meta) in self.all().await? {
            if meta.deleted_at.is_some() {
                self.remove(&key).await?;
                released += 1;
            }
        }
        if released > 0 {
            debug!("{}: released {} blobs", self.db.universal_id(), released);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedBlobRecord>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|(_, meta)| meta.deleted_at.is_none())
            .map(|(key, meta)| ListedBlobRecord {
                key,
                mime: meta.mime,
                size: meta.size,
                created_at: meta.created_at,
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self
            .meta(key)
            .await?
            .is_some_and(|meta| meta.deleted_at.is_none()))
    }
}

pub struct NativeBlobSyncStorage {
    db: Arc<NativeFileDb>,
}

impl NativeBlobSyncStorage {
    pub fn new(db: Arc<NativeFileDb>) -> Self {
        Self { db }
    }
}

impl Storage for NativeBlobSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::BlobSync
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl BlobSyncStorage for NativeBlobSyncStorage {
    async fn get_blob_uploaded_at(&self, peer: &str, key: &str) -> Result<Option<Timestamp>> {
        let state = self.db.state().await?;
        Ok(state
            .sync
            .blob_uploads
            .get(peer)
            .and_then(|uploads| uploads.get(key))
            .copied())
    }

    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<Timestamp>,
    ) -> Result<()> {
        let mut state = self.db.state().await?;
        let uploads = state.sync.blob_uploads.entry(peer.to_string()).or_default();
        match uploaded_at {
            Some(at) => {
                uploads.insert(key.to_string(), at);
            }
            None => {
                uploads.remove(key);
            }
        }
        self.db.save_sync(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::impls::native::{NativeFileOptions, NativeFilePool};
    use crate::storage::blob_key;
    use std::path::Path;

    fn open(root: &Path) -> Arc<NativeFileDb> {
        NativeFilePool::new()
            .ensure_storage(&NativeFileOptions {
                root: root.to_path_buf(),
                universal_id: "local".into(),
                space_id: "ws".into(),
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_blob_lifecycle_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = NativeBlobStorage::new(open(dir.path()));

        let blob = BlobRecord::new(b"png bytes".to_vec(), "image/png");
        blobs.set(blob.clone()).await.unwrap();
        assert_eq!(blobs.get(&blob.key).await.unwrap().unwrap().data, blob.data);
        assert_eq!(blobs.list().await.unwrap()[0].size, 9);

        blobs.delete(&blob.key, false).await.unwrap();
        assert!(!blobs.exists(&blob.key).await.unwrap());
        assert!(blobs.get(&blob.key).await.unwrap().is_none());

        blobs.release().await.unwrap();
        assert!(blobs.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_hash_and_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = NativeBlobStorage::new(open(dir.path()));

        let mut blob = BlobRecord::new(b"data".to_vec(), "a/b");
        blob.key = blob_key(b"different");
        assert!(matches!(blobs.set(blob).await, Err(StoreError::Integrity(_))));
        assert!(blobs.get("../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = NativeBlobStorage::new(open(dir.path()));
        for data in [b"c".as_slice(), b"a", b"b"] {
            blobs.set(BlobRecord::new(data.to_vec(), "a/b")).await.unwrap();
        }
        let keys: Vec<String> = blobs.list().await.unwrap().into_iter().map(|b| b.key).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert_eq!(keys.len(), 3);
    }

    #[tokio::test]
    async fn test_upload_bookkeeping_persists() {
        let dir = tempfile::tempdir().unwrap();
        let at = now();
        NativeBlobSyncStorage::new(open(dir.path()))
            .set_blob_uploaded_at("cloud", "k", Some(at))
            .await
            .unwrap();
        let sync = NativeBlobSyncStorage::new(open(dir.path()));
        assert_eq!(sync.get_blob_uploaded_at("cloud", "k").await.unwrap(), Some(at));
    }
}
