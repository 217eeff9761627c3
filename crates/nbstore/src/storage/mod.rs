//! The storage contract.
//!
//! Each role (doc, blob, docSync, blobSync, awareness, index, indexSync) is a
//! trait; backends implement the roles they support and share one
//! `Connection` between them. A `SpaceStorage` is the set of roles opened for
//! one space on one backend.

pub mod awareness;
pub mod blob;
pub mod doc;
pub mod indexer;
pub mod sync;

pub use awareness::{AwarenessCallback, AwarenessRecord, AwarenessStorage};
pub use blob::{BlobRecord, BlobStorage, ListedBlobRecord, blob_key};
pub use doc::{
    DocBackend, DocClock, DocClocks, DocDiff, DocRecord, DocStorage, DocStore, DocUpdate,
    DocUpdateCallback, DocUpdateEvent,
};
pub use indexer::{
    AggregateOptions, AggregateResult, BLOCK_TABLE, DOC_PREVIEW_TABLE, DOC_TABLE, IndexDocument,
    IndexJob, IndexerStorage, IndexerSyncStorage, Query, SearchOptions, SearchResult,
};
pub use sync::{BlobSyncStorage, DocSyncStorage, PeerClock};

use crate::connection::Connection;
use crate::error::Result;
use crate::signal::AbortSignal;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Logical clock value. Microsecond precision end to end.
pub type Timestamp = DateTime<Utc>;

/// Current time truncated to microseconds.
pub fn now() -> Timestamp {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Next clock for a doc whose current clock is `last`: strictly greater.
pub fn next_clock(last: Option<Timestamp>) -> Timestamp {
    let now = now();
    match last {
        Some(last) if now <= last => last + ChronoDuration::microseconds(1),
        _ => now,
    }
}

pub fn timestamp_from_micros(micros: i64) -> Option<Timestamp> {
    DateTime::from_timestamp_micros(micros)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageType {
    Doc,
    Blob,
    DocSync,
    BlobSync,
    Awareness,
    Index,
    IndexSync,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageType::Doc => "doc",
            StorageType::Blob => "blob",
            StorageType::DocSync => "docSync",
            StorageType::BlobSync => "blobSync",
            StorageType::Awareness => "awareness",
            StorageType::Index => "index",
            StorageType::IndexSync => "indexSync",
        };
        f.write_str(name)
    }
}

/// Common surface of every storage role.
pub trait Storage: Send + Sync {
    fn storage_type(&self) -> StorageType;

    fn connection(&self) -> &Arc<Connection>;

    /// Readonly storages reject writes; sync engines only pull from them.
    fn readonly(&self) -> bool {
        false
    }
}

/// The roles opened for one space on one backend.
#[derive(Clone, Default)]
pub struct SpaceStorage {
    pub doc: Option<Arc<dyn DocStorage>>,
    pub blob: Option<Arc<dyn BlobStorage>>,
    pub doc_sync: Option<Arc<dyn DocSyncStorage>>,
    pub blob_sync: Option<Arc<dyn BlobSyncStorage>>,
    pub awareness: Option<Arc<dyn AwarenessStorage>>,
    pub indexer: Option<Arc<dyn IndexerStorage>>,
    pub index_sync: Option<Arc<dyn IndexerSyncStorage>>,
}

impl SpaceStorage {
    pub fn storage_types(&self) -> Vec<StorageType> {
        let mut types = Vec::new();
        if self.doc.is_some() {
            types.push(StorageType::Doc);
        }
        if self.blob.is_some() {
            types.push(StorageType::Blob);
        }
        if self.doc_sync.is_some() {
            types.push(StorageType::DocSync);
        }
        if self.blob_sync.is_some() {
            types.push(StorageType::BlobSync);
        }
        if self.awareness.is_some() {
            types.push(StorageType::Awareness);
        }
        if self.indexer.is_some() {
            types.push(StorageType::Index);
        }
        if self.index_sync.is_some() {
            types.push(StorageType::IndexSync);
        }
        types
    }

    /// One entry per role, so shared connections appear once per role.
    fn role_connections(&self) -> Vec<Arc<Connection>> {
        let mut connections = Vec::new();
        if let Some(s) = &self.doc {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.blob {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.doc_sync {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.blob_sync {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.awareness {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.indexer {
            connections.push(Arc::clone(s.connection()));
        }
        if let Some(s) = &self.index_sync {
            connections.push(Arc::clone(s.connection()));
        }
        connections
    }

    /// Distinct connections behind this set.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut unique: Vec<Arc<Connection>> = Vec::new();
        for connection in self.role_connections() {
            if !unique.iter().any(|c| Arc::ptr_eq(c, &connection)) {
                unique.push(connection);
            }
        }
        unique
    }

    /// Connect every role. Shared connections are reference counted.
    pub fn connect(&self) {
        for connection in self.role_connections() {
            connection.connect();
        }
    }

    pub async fn disconnect(&self) {
        for connection in self.role_connections() {
            connection.disconnect().await;
        }
    }

    pub async fn wait_for_connected(&self, signal: &AbortSignal) -> Result<()> {
        for connection in self.connections() {
            connection.wait_for_connected(signal).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_clock_is_strictly_increasing() {
        let mut last = None;
        for _ in 0..1_000 {
            let clock = next_clock(last);
            if let Some(prev) = last {
                assert!(clock > prev);
            }
            last = Some(clock);
        }
    }

    #[test]
    fn test_next_clock_handles_future_last() {
        let future = now() + ChronoDuration::seconds(10);
        assert_eq!(next_clock(Some(future)), future + ChronoDuration::microseconds(1));
    }

    #[test]
    fn test_timestamps_roundtrip_through_micros() {
        let t = now();
        assert_eq!(timestamp_from_micros(t.timestamp_micros()), Some(t));
    }

    #[test]
    fn test_storage_type_names() {
        assert_eq!(StorageType::DocSync.to_string(), "docSync");
        assert_eq!(serde_json::to_string(&StorageType::IndexSync).unwrap(), "\"indexSync\"");
    }
}
