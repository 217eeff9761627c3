use super::{EmbeddedDb, from_micros, to_micros};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    BlobRecord, BlobStorage, BlobSyncStorage, ListedBlobRecord, Storage, StorageType, Timestamp,
    now,
};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;
use tracing::debug;

pub struct EmbeddedBlobStorage {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedBlobStorage {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }
}

impl Storage for EmbeddedBlobStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Blob
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl BlobStorage for EmbeddedBlobStorage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT data, mime, created_at FROM blobs WHERE key = ?1 AND deleted_at IS NULL",
                    params![key],
                    |row| {
                        Ok(BlobRecord {
                            key: key.to_string(),
                            data: row.get(0)?,
                            mime: row.get(1)?,
                            created_at: from_micros(row.get(2)?)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn set(&self, blob: BlobRecord) -> Result<()> {
        blob.verify()?;
        self.db.transact(|tx| {
            // Same key means same bytes: only revive and refresh metadata.
            tx.execute(
                "INSERT INTO blobs (key, data, mime, size, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL)
                 ON CONFLICT(key) DO UPDATE SET mime = excluded.mime, deleted_at = NULL",
                params![
                    blob.key,
                    blob.data,
                    blob.mime,
                    blob.data.len() as i64,
                    to_micros(blob.created_at)
                ],
            )?;
            Ok(())
        })
    }

    async fn delete(&self, key: &str, permanently: bool) -> Result<()> {
        self.db.transact(|tx| {
            if permanently {
                tx.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
            } else {
                tx.execute(
                    "UPDATE blobs SET deleted_at = ?2 WHERE key = ?1 AND deleted_at IS NULL",
                    params![key, to_micros(now())],
                )?;
            }
            Ok(())
        })
    }

    async fn release(&self) -> Result<()> {
        let released = self
            .db
            .transact(|tx| Ok(tx.execute("DELETE FROM blobs WHERE deleted_at IS NOT NULL", [])?))?;
        if released > 0 {
            debug!("{}: released {} blobs", self.db.name(), released);
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedBlobRecord>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, mime, size, created_at FROM blobs
                 WHERE deleted_at IS NULL ORDER BY key ASC",
            )?;
            let listed = stmt
                .query_map([], |row| {
                    Ok(ListedBlobRecord {
                        key: row.get(0)?,
                        mime: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        created_at: from_micros(row.get(3)?)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(listed)
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM blobs WHERE key = ?1 AND deleted_at IS NULL)",
                params![key],
                |row| row.get(0),
            )?)
        })
    }
}

pub struct EmbeddedBlobSyncStorage {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedBlobSyncStorage {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }
}

impl Storage for EmbeddedBlobSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::BlobSync
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl BlobSyncStorage for EmbeddedBlobSyncStorage {
    async fn get_blob_uploaded_at(&self, peer: &str, key: &str) -> Result<Option<Timestamp>> {
        self.db.read(|conn| {
            let micros: Option<i64> = conn
                .query_row(
                    "SELECT uploaded_at FROM blob_uploads WHERE peer = ?1 AND key = ?2",
                    params![peer, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(micros.map(from_micros).transpose()?)
        })
    }

    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<Timestamp>,
    ) -> Result<()> {
        self.db.transact(|tx| {
            match uploaded_at {
                Some(at) => tx.execute(
                    "INSERT INTO blob_uploads (peer, key, uploaded_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(peer, key) DO UPDATE SET uploaded_at = excluded.uploaded_at",
                    params![peer, key, to_micros(at)],
                )?,
                None => tx.execute(
                    "DELETE FROM blob_uploads WHERE peer = ?1 AND key = ?2",
                    params![peer, key],
                )?,
            };
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::impls::embedded::EmbeddedOptions;
    use crate::storage::blob_key;

    /// Rows in the blob table, soft-deleted ones included.
    fn stored_rows(db: &EmbeddedDb) -> i64 {
        db.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM blobs", [], |row| row.get(0))?))
            .unwrap()
    }

    fn open() -> (Arc<EmbeddedDb>, EmbeddedBlobStorage) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("blobs")).unwrap();
        let blobs = EmbeddedBlobStorage::new(Arc::clone(&db));
        (db, blobs)
    }

    #[tokio::test]
    async fn test_set_then_get_by_hash() {
        let (_db, blobs) = open();
        let blob = BlobRecord::new(b"image bytes".to_vec(), "image/png");
        blobs.set(blob.clone()).await.unwrap();

        let fetched = blobs.get(&blob_key(b"image bytes")).await.unwrap().unwrap();
        assert_eq!(blob_key(&fetched.data), fetched.key);
        assert_eq!(fetched.mime, "image/png");
    }

    #[tokio::test]
    async fn test_same_bytes_stored_once() {
        let (db, blobs) = open();
        blobs.set(BlobRecord::new(b"dup".to_vec(), "a/b")).await.unwrap();
        blobs.set(BlobRecord::new(b"dup".to_vec(), "a/b")).await.unwrap();
        assert_eq!(stored_rows(&db), 1);
        assert_eq!(blobs.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_key_rejected() {
        let (_db, blobs) = open();
        let mut blob = BlobRecord::new(b"real".to_vec(), "a/b");
        blob.key = blob_key(b"other");
        assert!(matches!(blobs.set(blob).await, Err(StoreError::Integrity(_))));
    }

    #[tokio::test]
    async fn test_soft_delete_then_release() {
        let (db, blobs) = open();
        let blob = BlobRecord::new(b"gone soon".to_vec(), "a/b");
        blobs.set(blob.clone()).await.unwrap();

        blobs.delete(&blob.key, false).await.unwrap();
        assert!(blobs.get(&blob.key).await.unwrap().is_none());
        assert!(blobs.list().await.unwrap().is_empty());
        assert!(!blobs.exists(&blob.key).await.unwrap());
        assert_eq!(stored_rows(&db), 1);

        blobs.release().await.unwrap();
        blobs.release().await.unwrap();
        assert_eq!(stored_rows(&db), 0);
    }

    #[tokio::test]
    async fn test_set_revives_soft_deleted() {
        let (_db, blobs) = open();
        let blob = BlobRecord::new(b"back".to_vec(), "a/b");
        blobs.set(blob.clone()).await.unwrap();
        blobs.delete(&blob.key, false).await.unwrap();
        blobs.set(blob.clone()).await.unwrap();
        blobs.release().await.unwrap();
        assert!(blobs.get(&blob.key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_upload_bookkeeping() {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("blobs")).unwrap();
        let sync = EmbeddedBlobSyncStorage::new(db);
        let at = now();

        sync.set_blob_uploaded_at("cloud", "k", Some(at)).await.unwrap();
        assert_eq!(sync.get_blob_uploaded_at("cloud", "k").await.unwrap(), Some(at));
        assert_eq!(sync.get_blob_uploaded_at("other", "k").await.unwrap(), None);

        sync.set_blob_uploaded_at("cloud", "k", None).await.unwrap();
        assert_eq!(sync.get_blob_uploaded_at("cloud", "k").await.unwrap(), None);
    }
}
