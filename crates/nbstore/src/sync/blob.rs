//! Blob sync engine.
//!
//! Blobs are content addressed, so there is nothing to merge: a key is
//! either present on a backend or not. Uploads consult per-peer bookkeeping
//! before probing the remote, downloads verify the hash before anything is
//! stored locally, and `release` waits for in-flight transfers so a blob
//! being copied is never reclaimed underneath it.

use crate::config::{RetryState, SyncConfig};
use crate::error::{Result, StoreError};
use crate::signal::{AbortController, AbortSignal};
use crate::storage::{BlobRecord, BlobStorage, BlobSyncStorage, now};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transfer {
    Uploading,
    Downloading,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobSyncState {
    /// Live blobs in local storage as of the last sweep
    pub total: usize,
    pub uploading: usize,
    pub downloading: usize,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobSyncBlobState {
    pub uploading: bool,
    pub downloading: bool,
    pub error_message: Option<String>,
}

/// Outcome of one full sweep against one or more peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub transferred: usize,
    pub failed: usize,
    /// Last key handled, usable as `since_key` to resume
    pub last_key: Option<String>,
}

#[derive(Debug, Default)]
struct Board {
    total: usize,
    transfers: BTreeMap<String, Transfer>,
    errors: BTreeMap<String, String>,
    error_message: Option<String>,
}

impl Board {
    fn summary(&self) -> BlobSyncState {
        let count = |kind| self.transfers.values().filter(|t| **t == kind).count();
        BlobSyncState {
            total: self.total,
            uploading: count(Transfer::Uploading),
            downloading: count(Transfer::Downloading),
            error_message: self.error_message.clone(),
        }
    }
}

/// Clears the transfer marker for a key when the transfer ends.
struct TransferMark<'a> {
    board: &'a watch::Sender<Board>,
    key: String,
}

impl Drop for TransferMark<'_> {
    fn drop(&mut self) {
        self.board.send_modify(|b| {
            b.transfers.remove(&self.key);
        });
    }
}

struct Running {
    controller: AbortController,
    task: JoinHandle<()>,
}

struct Inner {
    local: Arc<dyn BlobStorage>,
    sync_storage: Option<Arc<dyn BlobSyncStorage>>,
    peers: Vec<(String, Arc<dyn BlobStorage>)>,
    config: SyncConfig,
    transfers: RwLock<()>,
    board: watch::Sender<Board>,
    cursors: Mutex<HashMap<String, String>>,
}

pub struct BlobSync {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl BlobSync {
    pub fn new(
        local: Arc<dyn BlobStorage>,
        sync_storage: Option<Arc<dyn BlobSyncStorage>>,
        peers: Vec<(String, Arc<dyn BlobStorage>)>,
        config: SyncConfig,
    ) -> Self {
        let (board, _) = watch::channel(Board::default());
        Self {
            inner: Arc::new(Inner {
                local,
                sync_storage,
                peers,
                config,
                transfers: RwLock::new(()),
                board,
                cursors: Mutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the background loop: one download and upload sweep per
    /// connected session, then periodic release.
    pub fn start(&self) {
        let controller = AbortController::new();
        let inner = Arc::clone(&self.inner);
        let signal = controller.signal();
        let task = tokio::spawn(async move { inner.run(signal).await });

        let previous = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(Running { controller, task });
        if let Some(previous) = previous {
            previous.controller.abort();
            previous.task.abort();
        }
    }

    pub async fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return false;
        };
        running.controller.abort();
        running.task.abort();
        let _ = running.task.await;
        true
    }

    pub async fn upload_blob(&self, blob: BlobRecord, force: bool) -> Result<()> {
        self.inner.upload_blob(blob, force).await
    }

    /// Fetch `key` from the first peer that has it and store it locally.
    pub async fn download_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        self.inner.download_blob(key).await
    }

    /// Copy every remote blob missing locally, in key order, starting after
    /// `since_key`.
    pub async fn full_download(
        &self,
        peer: Option<&str>,
        since_key: Option<&str>,
        signal: &AbortSignal,
    ) -> Result<SweepReport> {
        self.inner.full_download(peer, since_key, signal).await
    }

    pub async fn full_upload(&self, peer: Option<&str>, signal: &AbortSignal) -> Result<SweepReport> {
        self.inner.full_upload(peer, signal).await
    }

    /// Reclaim soft-deleted blobs everywhere writable, once in-flight
    /// transfers have finished.
    pub async fn release(&self) -> Result<()> {
        self.inner.release().await
    }

    /// Key the last download sweep against `peer` reached.
    pub fn download_cursor(&self, peer: &str) -> Option<String> {
        self.inner
            .cursors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    pub fn state(&self) -> BlobSyncState {
        self.inner.board.borrow().summary()
    }

    pub fn blob_state(&self, key: &str) -> BlobSyncBlobState {
        let board = self.inner.board.borrow();
        let transfer = board.transfers.get(key).copied();
        BlobSyncBlobState {
            uploading: transfer == Some(Transfer::Uploading),
            downloading: transfer == Some(Transfer::Downloading),
            error_message: board.errors.get(key).cloned(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<BlobSyncState> {
        let mut source = self.inner.board.subscribe();
        let (tx, rx) = watch::channel(source.borrow().summary());
        tokio::spawn(async move {
            while source.changed().await.is_ok() {
                let summary = source.borrow().summary();
                if tx.send(summary).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

impl Inner {
    fn writable_peers<'a>(
        &'a self,
        only: Option<&'a str>,
    ) -> impl Iterator<Item = &'a (String, Arc<dyn BlobStorage>)> + 'a {
        self.select_peers(only).filter(|(_, remote)| !remote.readonly())
    }

    fn select_peers<'a>(
        &'a self,
        only: Option<&'a str>,
    ) -> impl Iterator<Item = &'a (String, Arc<dyn BlobStorage>)> + 'a {
        self.peers
            .iter()
            .filter(move |(id, _)| only.is_none_or(|only| id.as_str() == only))
    }

    fn mark(&self, key: &str, transfer: Transfer) -> TransferMark<'_> {
        self.board.send_modify(|b| {
            b.transfers.insert(key.to_string(), transfer);
        });
        TransferMark {
            board: &self.board,
            key: key.to_string(),
        }
    }

    fn record_error(&self, key: &str, err: &StoreError) {
        self.board.send_modify(|b| {
            b.errors.insert(key.to_string(), err.to_string());
        });
    }

    fn clear_error(&self, key: &str) {
        self.board.send_if_modified(|b| b.errors.remove(key).is_some());
    }

    async fn uploaded_at(&self, peer: &str, key: &str) -> Result<bool> {
        match &self.sync_storage {
            Some(storage) => Ok(storage.get_blob_uploaded_at(peer, key).await?.is_some()),
            None => Ok(false),
        }
    }

    async fn set_uploaded(&self, peer: &str, key: &str) -> Result<()> {
        if let Some(storage) = &self.sync_storage {
            storage.set_blob_uploaded_at(peer, key, Some(now())).await?;
        }
        Ok(())
    }

    async fn upload_to(
        &self,
        peer: &str,
        remote: &Arc<dyn BlobStorage>,
        blob: &BlobRecord,
        force: bool,
    ) -> Result<bool> {
        if !force {
            if self.uploaded_at(peer, &blob.key).await? {
                return Ok(false);
            }
            if remote.exists(&blob.key).await? {
                self.set_uploaded(peer, &blob.key).await?;
                return Ok(false);
            }
        }
        remote.set(blob.clone()).await?;
        self.set_uploaded(peer, &blob.key).await?;
        debug!("uploaded blob {} to {}", blob.key, peer);
        Ok(true)
    }

    async fn upload_blob(&self, blob: BlobRecord, force: bool) -> Result<()> {
        blob.verify()?;
        let _transfer = self.transfers.read().await;
        let _mark = self.mark(&blob.key, Transfer::Uploading);

        let mut first_error = None;
        for (peer, remote) in self.writable_peers(None) {
            if let Err(e) = self.upload_to(peer, remote, &blob, force).await {
                warn!("upload of blob {} to {} failed: {}", blob.key, peer, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                self.record_error(&blob.key, &e);
                Err(e)
            }
            None => {
                self.clear_error(&blob.key);
                Ok(())
            }
        }
    }

    async fn download_from(
        &self,
        peer: &str,
        remote: &Arc<dyn BlobStorage>,
        key: &str,
    ) -> Result<Option<BlobRecord>> {
        let Some(blob) = remote.get(key).await? else {
            return Ok(None);
        };
        if blob.key != key {
            return Err(StoreError::Integrity(format!(
                "{} answered blob {} for {}",
                peer, blob.key, key
            )));
        }
        blob.verify()?;
        self.local.set(blob.clone()).await?;
        debug!("downloaded blob {} from {}", key, peer);
        Ok(Some(blob))
    }

    async fn download_blob(&self, key: &str) -> Result<Option<BlobRecord>> {
        let _transfer = self.transfers.read().await;
        let _mark = self.mark(key, Transfer::Downloading);

        let mut last_error = None;
        for (peer, remote) in self.select_peers(None) {
            match self.download_from(peer, remote, key).await {
                Ok(Some(blob)) => {
                    self.clear_error(key);
                    return Ok(Some(blob));
                }
                Ok(None) => {}
                Err(e @ StoreError::Integrity(_)) => {
                    error!("blob {} from {} failed verification: {}", key, peer, e);
                    self.record_error(key, &e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("download of blob {} from {} failed: {}", key, peer, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => {
                self.record_error(key, &e);
                Err(e)
            }
            None => Ok(None),
        }
    }

    async fn local_keys(&self) -> Result<BTreeSet<String>> {
        let keys: BTreeSet<String> = self.local.list().await?.into_iter().map(|b| b.key).collect();
        self.board.send_if_modified(|b| {
            let changed = b.total != keys.len();
            b.total = keys.len();
            changed
        });
        Ok(keys)
    }

    async fn full_download(
        &self,
        only: Option<&str>,
        since_key: Option<&str>,
        signal: &AbortSignal,
    ) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let mut local = self.local_keys().await?;

        for (peer, remote) in self.select_peers(only) {
            let mut keys: Vec<String> = remote.list().await?.into_iter().map(|b| b.key).collect();
            keys.sort();

            for key in keys {
                if since_key.is_some_and(|since| key.as_str() <= since) || local.contains(&key) {
                    continue;
                }
                signal.throw_if_aborted()?;

                let _transfer = self.transfers.read().await;
                let _mark = self.mark(&key, Transfer::Downloading);
                match self.download_from(peer, remote, &key).await {
                    Ok(Some(_)) => {
                        report.transferred += 1;
                        self.clear_error(&key);
                        local.insert(key.clone());
                    }
                    Ok(None) => {}
                    Err(e @ StoreError::Integrity(_)) => {
                        error!("skipping blob {} from {}: {}", key, peer, e);
                        self.record_error(&key, &e);
                        report.failed += 1;
                    }
                    Err(e) => return Err(e),
                }
                self.cursors
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(peer.clone(), key.clone());
                report.last_key = Some(key);
            }
        }
        self.board.send_if_modified(|b| {
            let changed = b.total != local.len();
            b.total = local.len();
            changed
        });
        Ok(report)
    }

    async fn full_upload(&self, only: Option<&str>, signal: &AbortSignal) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let keys = self.local_keys().await?;

        for (peer, remote) in self.writable_peers(only) {
            let remote_keys: BTreeSet<String> =
                remote.list().await?.into_iter().map(|b| b.key).collect();

            for key in &keys {
                if remote_keys.contains(key) || self.uploaded_at(peer, key).await? {
                    continue;
                }
                signal.throw_if_aborted()?;

                let _transfer = self.transfers.read().await;
                let Some(blob) = self.local.get(key).await? else {
                    continue;
                };
                let _mark = self.mark(key, Transfer::Uploading);
                match self.upload_to(peer, remote, &blob, true).await {
                    Ok(_) => {
                        report.transferred += 1;
                        self.clear_error(key);
                    }
                    Err(e) if e.is_retryable() => return Err(e),
                    Err(e) => {
                        warn!("skipping upload of blob {} to {}: {}", key, peer, e);
                        self.record_error(key, &e);
                        report.failed += 1;
                    }
                }
                report.last_key = Some(key.clone());
            }
        }
        Ok(report)
    }

    async fn release(&self) -> Result<()> {
        let _exclusive = self.transfers.write().await;
        self.local.release().await?;
        for (peer, remote) in self.writable_peers(None) {
            if let Err(e) = remote.release().await {
                warn!("release on {} failed: {}", peer, e);
            }
        }
        debug!("released deleted blobs");
        Ok(())
    }

    async fn session(&self, signal: &AbortSignal, retry_state: &mut RetryState) -> Result<()> {
        let timeout = self.config.connect_timeout();
        self.local
            .connection()
            .wait_for_connected_within(signal, timeout)
            .await?;
        for (_, remote) in &self.peers {
            remote
                .connection()
                .wait_for_connected_within(signal, timeout)
                .await?;
        }

        let downloaded = self.full_download(None, None, signal).await?;
        let uploaded = self.full_upload(None, signal).await?;
        retry_state.reset();
        self.board.send_modify(|b| b.error_message = None);
        info!(
            "blob sweep done: {} downloaded, {} uploaded",
            downloaded.transferred, uploaded.transferred
        );

        let interval = self.config.blob_release_interval();
        loop {
            signal.sleep(interval).await?;
            if let Err(e) = self.release().await {
                if e.is_retryable() {
                    return Err(e);
                }
                warn!("blob release failed: {}", e);
            }
        }
    }

    async fn run(&self, signal: AbortSignal) {
        let retry = self.config.retry();
        let mut retry_state = RetryState::default();
        loop {
            match self.session(&signal, &mut retry_state).await {
                Err(e) if e.is_cancelled() || signal.is_aborted() => {
                    debug!("blob sync cancelled");
                    return;
                }
                Err(e) => {
                    let delay = retry_state.next_delay(&retry);
                    warn!("blob sync failed, retrying in {:?}: {}", delay, e);
                    self.board.send_modify(|b| b.error_message = Some(e.to_string()));
                    if signal.sleep(delay).await.is_err() {
                        return;
                    }
                }
                Ok(()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ReadyConnector};
    use crate::impls::{EmbeddedDb, EmbeddedOptions};
    use crate::storage::{ListedBlobRecord, SpaceStorage, Storage, StorageType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn space(name: &str) -> (Arc<EmbeddedDb>, SpaceStorage) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory(name)).unwrap();
        let space = db.space("ws");
        space.connect();
        (db, space)
    }

    fn engine(local: &SpaceStorage, peers: Vec<(&str, Arc<dyn BlobStorage>)>) -> BlobSync {
        BlobSync::new(
            Arc::clone(local.blob.as_ref().unwrap()),
            local.blob_sync.clone(),
            peers.into_iter().map(|(id, b)| (id.to_string(), b)).collect(),
            SyncConfig::default(),
        )
    }

    /// Remote that answers every key with bytes that do not hash to it.
    struct Tampering {
        connection: Arc<Connection>,
        readonly: bool,
        sets: AtomicUsize,
    }

    impl Tampering {
        fn new(name: &str, readonly: bool) -> Arc<Self> {
            Arc::new(Self {
                connection: Connection::new(name, Arc::new(ReadyConnector)),
                readonly,
                sets: AtomicUsize::new(0),
            })
        }
    }

    impl Storage for Tampering {
        fn storage_type(&self) -> StorageType {
            StorageType::Blob
        }
        fn connection(&self) -> &Arc<Connection> {
            &self.connection
        }
        fn readonly(&self) -> bool {
            self.readonly
        }
    }

    #[async_trait]
    impl BlobStorage for Tampering {
        async fn get(&self, key: &str) -> Result<Option<BlobRecord>> {
            Ok(Some(BlobRecord {
                key: key.to_string(),
                data: b"not what you asked for".to_vec(),
                mime: "text/plain".into(),
                created_at: now(),
            }))
        }
        async fn set(&self, _blob: BlobRecord) -> Result<()> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete(&self, _key: &str, _permanently: bool) -> Result<()> {
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            Ok(())
        }
        async fn list(&self) -> Result<Vec<ListedBlobRecord>> {
            Ok(vec![ListedBlobRecord {
                key: "a".repeat(64),
                mime: "text/plain".into(),
                size: 3,
                created_at: now(),
            }])
        }
    }

    #[tokio::test]
    async fn test_upload_is_idempotent_and_bookkept() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let remote_blob = Arc::clone(remote.blob.as_ref().unwrap());
        let sync = engine(&local, vec![("cloud", Arc::clone(&remote_blob))]);

        let blob = BlobRecord::new(b"hello".to_vec(), "text/plain");
        sync.upload_blob(blob.clone(), false).await.unwrap();
        assert_eq!(remote_blob.get(&blob.key).await.unwrap().unwrap().data, b"hello");

        let uploaded = local
            .blob_sync
            .as_ref()
            .unwrap()
            .get_blob_uploaded_at("cloud", &blob.key)
            .await
            .unwrap();
        assert!(uploaded.is_some());

        sync.upload_blob(blob.clone(), false).await.unwrap();
        assert_eq!(remote_blob.list().await.unwrap().len(), 1);
        assert!(!sync.blob_state(&blob.key).uploading);
    }

    #[tokio::test]
    async fn test_download_stores_verified_blob() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let remote_blob = Arc::clone(remote.blob.as_ref().unwrap());
        let blob = BlobRecord::new(b"image bytes".to_vec(), "image/png");
        remote_blob.set(blob.clone()).await.unwrap();

        let sync = engine(&local, vec![("cloud", remote_blob)]);
        let fetched = sync.download_blob(&blob.key).await.unwrap().unwrap();
        assert_eq!(fetched.data, blob.data);
        assert!(local.blob.as_ref().unwrap().exists(&blob.key).await.unwrap());
        assert!(sync.download_blob(&"0".repeat(64)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tampered_download_is_rejected() {
        let (_l, local) = space("local");
        let sync = engine(&local, vec![("evil", Tampering::new("evil", false) as Arc<dyn BlobStorage>)]);
        let key = "a".repeat(64);

        let err = sync.download_blob(&key).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(!local.blob.as_ref().unwrap().exists(&key).await.unwrap());
        assert!(sync.blob_state(&key).error_message.is_some());

        let report = sync
            .full_download(None, None, &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(report.transferred, 0);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_full_download_resumes_after_key() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let remote_blob = Arc::clone(remote.blob.as_ref().unwrap());
        let mut keys = Vec::new();
        for data in ["one", "two", "three"] {
            let blob = BlobRecord::new(data.as_bytes().to_vec(), "text/plain");
            keys.push(blob.key.clone());
            remote_blob.set(blob).await.unwrap();
        }
        keys.sort();

        let sync = engine(&local, vec![("cloud", remote_blob)]);
        let report = sync
            .full_download(Some("cloud"), Some(&keys[0]), &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(report.transferred, 2);
        assert_eq!(report.last_key.as_deref(), Some(keys[2].as_str()));
        assert_eq!(sync.download_cursor("cloud").as_deref(), Some(keys[2].as_str()));

        let local_blob = local.blob.as_ref().unwrap();
        assert!(!local_blob.exists(&keys[0]).await.unwrap());
        assert!(local_blob.exists(&keys[1]).await.unwrap());

        let rest = sync
            .full_download(None, None, &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(rest.transferred, 1);
        assert_eq!(sync.state().total, 3);
    }

    #[tokio::test]
    async fn test_full_upload_skips_readonly_peers() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        local
            .blob
            .as_ref()
            .unwrap()
            .set(BlobRecord::new(b"local".to_vec(), "text/plain"))
            .await
            .unwrap();

        let readonly = Tampering::new("ro", true);
        let sync = engine(
            &local,
            vec![
                ("cloud", Arc::clone(remote.blob.as_ref().unwrap())),
                ("ro", Arc::clone(&readonly) as Arc<dyn BlobStorage>),
            ],
        );
        let report = sync.full_upload(None, &AbortSignal::never()).await.unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(remote.blob.as_ref().unwrap().list().await.unwrap().len(), 1);
        assert_eq!(readonly.sets.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_reclaims_soft_deleted() {
        let (db, local) = space("local");
        let local_blob = Arc::clone(local.blob.as_ref().unwrap());
        let blob = BlobRecord::new(b"gone".to_vec(), "text/plain");
        local_blob.set(blob.clone()).await.unwrap();
        local_blob.delete(&blob.key, false).await.unwrap();

        let stored = |key: &str| -> bool {
            db.read(|conn| {
                Ok(conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM blobs WHERE key = ?1)",
                    [key],
                    |row| row.get(0),
                )?)
            })
            .unwrap()
        };
        assert!(stored(&blob.key));

        let sync = engine(&local, vec![]);
        sync.release().await.unwrap();
        assert!(!stored(&blob.key));
    }

    #[tokio::test]
    async fn test_background_loop_syncs_both_ways() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let local_blob = Arc::clone(local.blob.as_ref().unwrap());
        let remote_blob = Arc::clone(remote.blob.as_ref().unwrap());
        local_blob
            .set(BlobRecord::new(b"up".to_vec(), "text/plain"))
            .await
            .unwrap();
        remote_blob
            .set(BlobRecord::new(b"down".to_vec(), "text/plain"))
            .await
            .unwrap();

        let sync = engine(&local, vec![("cloud", Arc::clone(&remote_blob))]);
        sync.start();
        tokio::time::timeout(Duration::from_secs(10), async {
            while local_blob.list().await.unwrap().len() < 2 || remote_blob.list().await.unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert!(sync.stop().await);
        assert_eq!(sync.state().uploading, 0);
    }
}
