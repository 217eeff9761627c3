use super::RemoteSpace;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::{Request, SpaceType, WireBlob, WireListedBlob};
use crate::storage::{BlobRecord, BlobStorage, ListedBlobRecord, Storage, StorageType};
use async_trait::async_trait;
use std::sync::Arc;

pub struct RemoteBlobStorage {
    space: Arc<RemoteSpace>,
}

impl RemoteBlobStorage {
    pub fn new(space: Arc<RemoteSpace>) -> Self {
        Self { space }
    }

    fn scope(&self) -> (SpaceType, String) {
        let options = self.space.options();
        (options.space_type, options.space_id.clone())
    }
}

impl From<WireBlob> for BlobRecord {
    fn from(blob: WireBlob) -> Self {
        BlobRecord {
            key: blob.key,
            data: blob.data,
            mime: blob.mime,
            created_at: blob.created_at,
        }
    }
}

impl From<BlobRecord> for WireBlob {
    fn from(blob: BlobRecord) -> Self {
        WireBlob {
            key: blob.key,
            data: blob.data,
            mime: blob.mime,
            created_at: blob.created_at,
        }
    }
}

impl From<WireListedBlob> for ListedBlobRecord {
    fn from(blob: WireListedBlob) -> Self {
        ListedBlobRecord {
            key: blob.key,
            mime: blob.mime,
            size: blob.size,
            created_at: blob.created_at,
        }
    }
}

impl From<ListedBlobRecord> for WireListedBlob {
    fn from(blob: ListedBlobRecord) -> Self {
        WireListedBlob {
            key: blob.key,
            mime: blob.mime,
            size: blob.size,
            created_at: blob.created_at,
        }
    }
}

impl Storage for RemoteBlobStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Blob
    }

    fn connection(&self) -> &Arc<Connection> {
        self.space.connection()
    }

    fn readonly(&self) -> bool {
        self.space.options().readonly
    }
}

#[async_trait]
impl BlobStorage for RemoteBlobStorage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>> {
        let (space_type, space_id) = self.scope();
        let blob: Option<WireBlob> = self
            .space
            .request(Request::GetBlob {
                space_type,
                space_id,
                key: key.to_string(),
            })
            .await?;
        Ok(blob.map(BlobRecord::from))
    }

    async fn set(&self, blob: BlobRecord) -> Result<()> {
        blob.verify()?;
        let (space_type, space_id) = self.scope();
        self.space
            .request::<serde_json::Value>(Request::SetBlob {
                space_type,
                space_id,
                blob: blob.into(),
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str, permanently: bool) -> Result<()> {
        let (space_type, space_id) = self.scope();
        self.space
            .request::<serde_json::Value>(Request::DeleteBlob {
                space_type,
                space_id,
                key: key.to_string(),
                permanently,
            })
            .await?;
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        let (space_type, space_id) = self.scope();
        self.space
            .request::<serde_json::Value>(Request::ReleaseBlobs {
                space_type,
                space_id,
            })
            .await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ListedBlobRecord>> {
        let (space_type, space_id) = self.scope();
        let listed: Vec<WireListedBlob> = self
            .space
            .request(Request::ListBlobs {
                space_type,
                space_id,
            })
            .await?;
        Ok(listed.into_iter().map(ListedBlobRecord::from).collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let (space_type, space_id) = self.scope();
        self.space
            .request(Request::BlobExists {
                space_type,
                space_id,
                key: key.to_string(),
            })
            .await
    }
}
