//! Doc role: CRDT document records, clocks and diffs.
//!
//! `DocStorage` is the contract engines use. Durable backends implement the
//! smaller `DocBackend` (snapshot + pending updates + clocks) and get the rest
//! from `DocStore`, which merges updates on read, compacts opportunistically,
//! serializes pushes per doc and publishes update events.

use super::{Storage, StorageType, Timestamp};
use crate::connection::Connection;
use crate::crdt;
use crate::error::{Result, StoreError};
use crate::events::{EventBus, Subscription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocClock {
    pub doc_id: String,
    pub timestamp: Timestamp,
}

/// Clock per doc id.
pub type DocClocks = HashMap<String, Timestamp>;

/// An update or a compacted snapshot with its clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRecord {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub timestamp: Timestamp,
}

/// An update about to be pushed; the storage assigns the clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Vec<u8>,
}

impl DocUpdate {
    pub fn new(doc_id: impl Into<String>, bin: Vec<u8>) -> Self {
        Self {
            doc_id: doc_id.into(),
            bin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocDiff {
    pub doc_id: String,
    /// Update bytes the requester lacks
    pub missing: Vec<u8>,
    /// Responder's state vector
    pub state: Vec<u8>,
    /// Responder's clock for the doc
    pub timestamp: Timestamp,
}

/// Published after every successful push.
#[derive(Debug, Clone)]
pub struct DocUpdateEvent {
    pub record: DocRecord,
    pub origin: Option<String>,
}

pub type DocUpdateCallback = Box<dyn Fn(&DocUpdateEvent) + Send + Sync>;

#[async_trait]
pub trait DocStorage: Storage {
    /// Space this storage holds. The doc with the same id is the root doc.
    fn space_id(&self) -> &str;

    /// Merged document, or `None` if nothing was ever pushed.
    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>>;

    /// What a holder of `state_vector` is missing. Never mutates.
    async fn get_doc_diff(&self, doc_id: &str, state_vector: Option<&[u8]>)
    -> Result<Option<DocDiff>>;

    async fn push_doc_update(&self, update: DocUpdate, origin: Option<&str>) -> Result<DocClock>;

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>>;

    /// Clocks of every doc, or only those newer than `after`.
    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks>;

    async fn delete_doc(&self, doc_id: &str) -> Result<()>;

    fn subscribe_doc_update(&self, callback: DocUpdateCallback) -> Subscription;
}

/// Low-level table access for durable doc backends.
///
/// Implementations need not lock: `DocStore` serializes calls per doc id.
#[async_trait]
pub trait DocBackend: Send + Sync + 'static {
    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>>;

    /// Store a snapshot unless the stored one is newer. Returns whether it was written.
    async fn set_doc_snapshot(&self, snapshot: DocRecord) -> Result<bool>;

    /// Updates not yet folded into the snapshot, oldest first.
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>>;

    /// Drop the updates with the given clocks. Returns how many were removed.
    async fn mark_updates_merged(&self, doc_id: &str, timestamps: &[Timestamp]) -> Result<usize>;

    /// Append an update under a fresh, strictly increasing clock.
    async fn insert_update(&self, doc_id: &str, bin: Vec<u8>) -> Result<Timestamp>;

    async fn get_doc_clock(&self, doc_id: &str) -> Result<Option<Timestamp>>;

    async fn get_doc_clocks(&self, after: Option<Timestamp>) -> Result<DocClocks>;

    async fn delete_doc(&self, doc_id: &str) -> Result<()>;
}

/// `DocStorage` built on a `DocBackend`.
pub struct DocStore<B> {
    space_id: String,
    backend: B,
    connection: Arc<Connection>,
    readonly: bool,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    updates: Arc<EventBus<DocUpdateEvent>>,
}

impl<B: DocBackend> DocStore<B> {
    pub fn new(space_id: impl Into<String>, backend: B, connection: Arc<Connection>) -> Self {
        Self {
            space_id: space_id.into(),
            backend,
            connection,
            readonly: false,
            locks: Mutex::new(HashMap::new()),
            updates: Arc::new(EventBus::new()),
        }
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    async fn lock_doc(&self, doc_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(doc_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Snapshot plus pending updates, merged in memory.
    async fn read_merged(&self, doc_id: &str) -> Result<Option<(DocRecord, Vec<Timestamp>)>> {
        let snapshot = self.backend.get_doc_snapshot(doc_id).await?;
        let updates = self.backend.get_doc_updates(doc_id).await?;

        if updates.is_empty() {
            return Ok(snapshot.map(|s| (s, Vec::new())));
        }

        let merged_clocks: Vec<Timestamp> = updates.iter().map(|u| u.timestamp).collect();
        let mut timestamp = merged_clocks.iter().copied().max().unwrap_or_else(super::now);
        let mut bins = Vec::with_capacity(updates.len() + 1);
        if let Some(snapshot) = &snapshot {
            timestamp = timestamp.max(snapshot.timestamp);
            bins.push(snapshot.bin.clone());
        }
        bins.extend(updates.into_iter().map(|u| u.bin));

        let mut bin = crdt::merge_updates(&bins)?;
        // Updates the snapshot already holds leave its bytes untouched.
        if let Some(snapshot) = snapshot {
            if crdt::state_equals(&snapshot.bin, &bin)? {
                bin = snapshot.bin;
            }
        }
        Ok(Some((
            DocRecord {
                doc_id: doc_id.to_string(),
                bin,
                timestamp,
            },
            merged_clocks,
        )))
    }
}

impl<B: DocBackend> Storage for DocStore<B> {
    fn storage_type(&self) -> StorageType {
        StorageType::Doc
    }

    fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    fn readonly(&self) -> bool {
        self.readonly
    }
}

#[async_trait]
impl<B: DocBackend> DocStorage for DocStore<B> {
    fn space_id(&self) -> &str {
        &self.space_id
    }

    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let _guard = self.lock_doc(doc_id).await;
        let Some((record, merged)) = self.read_merged(doc_id).await? else {
            return Ok(None);
        };

        if !merged.is_empty() && !self.readonly {
            if self.backend.set_doc_snapshot(record.clone()).await? {
                let removed = self.backend.mark_updates_merged(doc_id, &merged).await?;
                debug!("compacted {} updates into snapshot of {}", removed, doc_id);
            }
        }

        Ok(Some(record))
    }

    async fn get_doc_diff(
        &self,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>> {
        // A concurrent compaction must not land between the snapshot and
        // update reads.
        let merged = {
            let _guard = self.lock_doc(doc_id).await;
            self.read_merged(doc_id).await?
        };
        let Some((record, _)) = merged else {
            return Ok(None);
        };
        let (missing, state) = crdt::diff_update(&record.bin, state_vector)?;
        Ok(Some(DocDiff {
            doc_id: doc_id.to_string(),
            missing,
            state,
            timestamp: record.timestamp,
        }))
    }

    async fn push_doc_update(&self, update: DocUpdate, origin: Option<&str>) -> Result<DocClock> {
        if self.readonly {
            return Err(StoreError::Readonly(format!("push to {}", update.doc_id)));
        }
        crdt::validate_update(&update.bin)?;

        let timestamp = {
            let _guard = self.lock_doc(&update.doc_id).await;
            self.backend
                .insert_update(&update.doc_id, update.bin.clone())
                .await?
        };
        trace!("pushed update for {} at {}", update.doc_id, timestamp);

        self.updates.emit(&DocUpdateEvent {
            record: DocRecord {
                doc_id: update.doc_id.clone(),
                bin: update.bin,
                timestamp,
            },
            origin: origin.map(str::to_string),
        });

        Ok(DocClock {
            doc_id: update.doc_id,
            timestamp,
        })
    }

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>> {
        Ok(self
            .backend
            .get_doc_clock(doc_id)
            .await?
            .map(|timestamp| DocClock {
                doc_id: doc_id.to_string(),
                timestamp,
            }))
    }

    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        self.backend.get_doc_clocks(after).await
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        if self.readonly {
            return Err(StoreError::Readonly(format!("delete {}", doc_id)));
        }
        let _guard = self.lock_doc(doc_id).await;
        self.backend.delete_doc(doc_id).await
    }

    fn subscribe_doc_update(&self, callback: DocUpdateCallback) -> Subscription {
        self.updates.subscribe(move |event| callback(event))
    }
}
