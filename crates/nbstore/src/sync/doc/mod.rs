//! Doc sync engine.
//!
//! One loop per remote peer reconciles the local doc storage with that peer.
//! Each session waits for both connections, plans work from the stored
//! clocks (remote newer than pulled, local newer than pushed), drains a
//! per-doc job queue, then stays connected forwarding local writes and
//! applying remote broadcasts until the connection drops. Failed sessions
//! back off exponentially and start over.

mod peer;
mod queue;

use crate::config::SyncConfig;
use crate::error::{Result, StoreError};
use crate::signal::{AbortController, AbortSignal};
use crate::storage::{DocStorage, DocSyncStorage};
use peer::DocSyncPeer;
use queue::Priorities;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerStatus {
    #[default]
    Idle,
    Connecting,
    Syncing,
    Retrying,
}

/// Published state of one (local, peer) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSyncState {
    pub status: PeerStatus,
    /// Docs with queued or running jobs
    pub pending: BTreeSet<String>,
    /// Planned work drained and nothing pending
    pub synced: bool,
    /// Last session failure, cleared once a session connects
    pub error_message: Option<String>,
    /// Per-doc failures that did not end the session
    pub doc_errors: BTreeMap<String, String>,
}

/// Aggregate over every peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSyncState {
    pub total: usize,
    pub syncing: bool,
    pub synced: bool,
    pub retrying: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSyncDocState {
    pub syncing: bool,
    pub synced: bool,
    pub retrying: bool,
    pub error_message: Option<String>,
}

/// Distinguishes engines sharing one storage, so each only skips its own echoes.
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type StateBoard = watch::Sender<BTreeMap<String, PeerSyncState>>;

pub(super) fn aggregate(peers: &BTreeMap<String, PeerSyncState>) -> DocSyncState {
    DocSyncState {
        total: peers.values().map(|p| p.pending.len()).sum(),
        syncing: peers.values().any(|p| !p.synced),
        synced: !peers.is_empty() && peers.values().all(|p| p.synced),
        retrying: peers.values().any(|p| p.status == PeerStatus::Retrying),
        error_message: peers.values().find_map(|p| p.error_message.clone()),
    }
}

fn doc_state(peers: &BTreeMap<String, PeerSyncState>, doc_id: &str) -> DocSyncDocState {
    DocSyncDocState {
        syncing: peers
            .values()
            .any(|p| p.pending.contains(doc_id) || p.status != PeerStatus::Syncing),
        synced: !peers.is_empty()
            && peers
                .values()
                .all(|p| p.status == PeerStatus::Syncing && !p.pending.contains(doc_id)),
        retrying: peers.values().any(|p| p.status == PeerStatus::Retrying),
        error_message: peers
            .values()
            .find_map(|p| p.doc_errors.get(doc_id).cloned().or_else(|| p.error_message.clone())),
    }
}

/// Keeps a doc ahead in every peer queue until dropped.
#[must_use = "the priority is removed when the guard is dropped"]
pub struct PriorityGuard {
    priorities: Arc<Priorities>,
    doc_id: String,
    priority: i32,
}

impl Drop for PriorityGuard {
    fn drop(&mut self) {
        self.priorities.remove(&self.doc_id, self.priority);
    }
}

struct Running {
    controller: AbortController,
    tasks: Vec<JoinHandle<()>>,
}

pub struct DocSync {
    engine_id: u64,
    local: Arc<dyn DocStorage>,
    sync_storage: Arc<dyn DocSyncStorage>,
    peers: Vec<(String, Arc<dyn DocStorage>)>,
    config: SyncConfig,
    priorities: Arc<Priorities>,
    board: Arc<StateBoard>,
    running: Mutex<Option<Running>>,
}

impl DocSync {
    pub fn new(
        local: Arc<dyn DocStorage>,
        sync_storage: Arc<dyn DocSyncStorage>,
        peers: Vec<(String, Arc<dyn DocStorage>)>,
        config: SyncConfig,
    ) -> Self {
        let initial = peers
            .iter()
            .map(|(id, _)| (id.clone(), PeerSyncState::default()))
            .collect();
        let (board, _) = watch::channel(initial);
        Self {
            engine_id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            local,
            sync_storage,
            peers,
            config,
            priorities: Arc::new(Priorities::default()),
            board: Arc::new(board),
            running: Mutex::new(None),
        }
    }

    /// Spawn one loop per peer, replacing any running loops.
    pub fn start(&self) {
        let controller = AbortController::new();
        let tasks = self
            .peers
            .iter()
            .map(|(peer_id, remote)| {
                let peer = DocSyncPeer {
                    peer_id: peer_id.clone(),
                    origin: format!("sync:{}:{}", self.engine_id, peer_id),
                    local: Arc::clone(&self.local),
                    remote: Arc::clone(remote),
                    sync_storage: Arc::clone(&self.sync_storage),
                    priorities: Arc::clone(&self.priorities),
                    board: Arc::clone(&self.board),
                    config: self.config.clone(),
                };
                tokio::spawn(peer.run(controller.signal()))
            })
            .collect();

        let previous = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Running { controller, tasks });
        if let Some(previous) = previous {
            previous.controller.abort();
            for task in previous.tasks {
                task.abort();
            }
        }
        info!("doc sync started with {} peers", self.peers.len());
    }

    /// Abort every loop and wait until their subscriptions are dropped.
    /// Returns whether anything was running.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return false;
        };
        running.controller.abort();
        for task in running.tasks {
            task.abort();
            let _ = task.await;
        }
        self.board.send_modify(|peers| {
            for state in peers.values_mut() {
                state.status = PeerStatus::Idle;
                state.pending.clear();
                state.synced = false;
            }
        });
        info!("doc sync stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Raise `doc_id` in every peer queue while the guard lives.
    pub fn add_priority(&self, doc_id: &str, priority: i32) -> PriorityGuard {
        self.priorities.add(doc_id, priority);
        PriorityGuard {
            priorities: Arc::clone(&self.priorities),
            doc_id: doc_id.to_string(),
            priority,
        }
    }

    /// Forget every peer clock and resync from scratch.
    pub async fn reset_sync(&self) -> Result<()> {
        let was_running = self.stop().await;
        self.sync_storage.clear_clocks().await?;
        if was_running {
            self.start();
        }
        Ok(())
    }

    pub fn state(&self) -> DocSyncState {
        aggregate(&self.board.borrow())
    }

    pub fn peer_states(&self) -> BTreeMap<String, PeerSyncState> {
        self.board.borrow().clone()
    }

    pub fn doc_state(&self, doc_id: &str) -> DocSyncDocState {
        doc_state(&self.board.borrow(), doc_id)
    }

    /// Receiver over every peer state; starts with the current value.
    pub fn subscribe_state(&self) -> watch::Receiver<BTreeMap<String, PeerSyncState>> {
        self.board.subscribe()
    }

    /// Resolve once every peer has drained its work.
    pub async fn wait_for_synced(&self, signal: &AbortSignal) -> Result<()> {
        let mut rx = self.board.subscribe();
        signal
            .run(rx.wait_for(|peers| aggregate(peers).synced))
            .await?
            .map(|_| ())
            .map_err(|_| StoreError::Cancelled)
    }

    /// Resolve once `doc_id` has nothing pending on any connected peer.
    pub async fn wait_for_doc_synced(&self, doc_id: &str, signal: &AbortSignal) -> Result<()> {
        let mut rx = self.board.subscribe();
        signal
            .run(rx.wait_for(|peers| doc_state(peers, doc_id).synced))
            .await?
            .map(|_| ())
            .map_err(|_| StoreError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(status: PeerStatus, pending: &[&str], synced: bool) -> PeerSyncState {
        PeerSyncState {
            status,
            pending: pending.iter().map(|s| s.to_string()).collect(),
            synced,
            ..Default::default()
        }
    }

    #[test]
    fn test_aggregate_state() {
        let mut peers = BTreeMap::new();
        peers.insert("a".to_string(), peer(PeerStatus::Syncing, &[], true));
        peers.insert("b".to_string(), peer(PeerStatus::Syncing, &["d1", "d2"], false));

        let state = aggregate(&peers);
        assert_eq!(state.total, 2);
        assert!(state.syncing);
        assert!(!state.synced);

        let d1 = doc_state(&peers, "d1");
        assert!(d1.syncing);
        assert!(!d1.synced);
        assert!(doc_state(&peers, "d3").synced);
    }

    #[test]
    fn test_retrying_peer_reports_error() {
        let mut peers = BTreeMap::new();
        let mut failing = peer(PeerStatus::Retrying, &[], false);
        failing.error_message = Some("connection refused".into());
        peers.insert("cloud".to_string(), failing);

        let state = aggregate(&peers);
        assert!(state.retrying);
        assert_eq!(state.error_message.as_deref(), Some("connection refused"));
        assert!(!doc_state(&peers, "d1").synced);
    }
}
