//! Sync engines and the facade that wires them to a local storage set and
//! its peers.

pub mod awareness;
pub mod blob;
pub mod doc;
pub mod indexer;

pub use awareness::{AwarenessSync, SharedAwarenessCallback};
pub use blob::{BlobSync, BlobSyncBlobState, BlobSyncState, SweepReport};
pub use doc::{DocSync, DocSyncDocState, DocSyncState, PeerStatus, PeerSyncState, PriorityGuard};
pub use indexer::{IndexPolicy, IndexSync, IndexSyncState, PrefixPolicy, QueryStream};

use crate::config::SyncConfig;
use crate::storage::SpaceStorage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// What the application shows for the space as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncHealth {
    Syncing,
    Synced,
    Error,
}

impl SyncHealth {
    pub fn from_doc_state(state: &DocSyncState) -> Self {
        if state.retrying || state.error_message.is_some() {
            SyncHealth::Error
        } else if state.synced {
            SyncHealth::Synced
        } else {
            SyncHealth::Syncing
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub doc: Option<DocSyncState>,
    pub blob: Option<BlobSyncState>,
    pub index: Option<IndexSyncState>,
}

/// One engine per role the local set provides. Peers contribute whatever
/// roles they have; a peer without a doc role is simply not a doc peer.
pub struct Sync {
    doc: Option<DocSync>,
    blob: Option<BlobSync>,
    awareness: Option<AwarenessSync>,
    indexer: Option<IndexSync>,
}

impl Sync {
    pub fn new(local: &SpaceStorage, peers: &[(String, SpaceStorage)], config: SyncConfig) -> Self {
        let doc = match (&local.doc, &local.doc_sync) {
            (Some(doc), Some(doc_sync)) => Some(DocSync::new(
                Arc::clone(doc),
                Arc::clone(doc_sync),
                peers
                    .iter()
                    .filter_map(|(id, p)| p.doc.as_ref().map(|d| (id.clone(), Arc::clone(d))))
                    .collect(),
                config.clone(),
            )),
            _ => None,
        };

        let blob = local.blob.as_ref().map(|blob| {
            BlobSync::new(
                Arc::clone(blob),
                local.blob_sync.clone(),
                peers
                    .iter()
                    .filter_map(|(id, p)| p.blob.as_ref().map(|b| (id.clone(), Arc::clone(b))))
                    .collect(),
                config.clone(),
            )
        });

        let awareness = local.awareness.as_ref().map(|awareness| {
            AwarenessSync::new(
                Arc::clone(awareness),
                peers
                    .iter()
                    .filter_map(|(id, p)| p.awareness.as_ref().map(|a| (id.clone(), Arc::clone(a))))
                    .collect(),
            )
        });

        let indexer = match (&local.doc, &local.indexer) {
            (Some(doc), Some(indexer)) => Some(IndexSync::new(
                Arc::clone(doc),
                Arc::clone(indexer),
                local.index_sync.clone(),
                config,
            )),
            _ => None,
        };

        Self {
            doc,
            blob,
            awareness,
            indexer,
        }
    }

    pub fn doc(&self) -> Option<&DocSync> {
        self.doc.as_ref()
    }

    pub fn blob(&self) -> Option<&BlobSync> {
        self.blob.as_ref()
    }

    pub fn awareness(&self) -> Option<&AwarenessSync> {
        self.awareness.as_ref()
    }

    pub fn indexer(&self) -> Option<&IndexSync> {
        self.indexer.as_ref()
    }

    pub fn start(&self) {
        if let Some(doc) = &self.doc {
            doc.start();
        }
        if let Some(blob) = &self.blob {
            blob.start();
        }
        if let Some(indexer) = &self.indexer {
            indexer.start();
        }
        info!("sync started");
    }

    pub async fn stop(&self) {
        if let Some(doc) = &self.doc {
            doc.stop().await;
        }
        if let Some(blob) = &self.blob {
            blob.stop().await;
        }
        if let Some(indexer) = &self.indexer {
            indexer.stop().await;
        }
        info!("sync stopped");
    }

    pub fn state(&self) -> SyncState {
        SyncState {
            doc: self.doc.as_ref().map(DocSync::state),
            blob: self.blob.as_ref().map(BlobSync::state),
            index: self.indexer.as_ref().map(IndexSync::state),
        }
    }

    /// Health follows the doc engine; without one there is nothing to sync.
    pub fn health(&self) -> SyncHealth {
        self.doc
            .as_ref()
            .map(|doc| SyncHealth::from_doc_state(&doc.state()))
            .unwrap_or(SyncHealth::Synced)
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SyncHealth> {
        let (tx, rx) = watch::channel(self.health());
        if let Some(engine) = &self.doc {
            let mut source = engine.subscribe_state();
            tokio::spawn(async move {
                while source.changed().await.is_ok() {
                    let health = SyncHealth::from_doc_state(&doc::aggregate(&source.borrow()));
                    tx.send_if_modified(|current| {
                        let changed = *current != health;
                        *current = health;
                        changed
                    });
                    if tx.is_closed() {
                        break;
                    }
                }
            });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::{EmbeddedDb, EmbeddedOptions};
    use crate::signal::AbortSignal;
    use std::time::Duration;

    #[test]
    fn test_health_from_doc_state() {
        let mut state = DocSyncState::default();
        assert_eq!(SyncHealth::from_doc_state(&state), SyncHealth::Syncing);
        state.synced = true;
        assert_eq!(SyncHealth::from_doc_state(&state), SyncHealth::Synced);
        state.error_message = Some("offline".into());
        assert_eq!(SyncHealth::from_doc_state(&state), SyncHealth::Error);
    }

    #[tokio::test]
    async fn test_engines_follow_local_roles() {
        let local_db = EmbeddedDb::open(EmbeddedOptions::in_memory("local")).unwrap();
        let remote_db = EmbeddedDb::open(EmbeddedOptions::in_memory("remote")).unwrap();
        let local = local_db.space("ws");
        let remote = remote_db.space("ws");
        local.connect();
        remote.connect();

        let sync = Sync::new(&local, &[("cloud".to_string(), remote)], SyncConfig::default());
        assert!(sync.doc().is_some());
        assert!(sync.blob().is_some());
        assert!(sync.awareness().is_some());
        assert!(sync.indexer().is_some());

        let mut health = sync.subscribe_health();
        sync.start();
        tokio::time::timeout(
            Duration::from_secs(10),
            sync.doc().unwrap().wait_for_synced(&AbortSignal::never()),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::timeout(Duration::from_secs(5), health.wait_for(|h| *h == SyncHealth::Synced))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sync.health(), SyncHealth::Synced);
        sync.stop().await;

        let doc_only = SpaceStorage {
            doc: local.doc.clone(),
            ..SpaceStorage::default()
        };
        let sync = Sync::new(&doc_only, &[], SyncConfig::default());
        assert!(sync.doc().is_none());
        assert!(sync.indexer().is_none());
        assert_eq!(sync.health(), SyncHealth::Synced);
    }
}
