//! Native-file backend.
//!
//! One directory per universal id:
//!
//! ```text
//! <root>/<universal_id>/
//!   clocks.json                 doc id -> clock
//!   sync.json                   peer clocks and blob upload bookkeeping
//!   docs/<hex doc id>/snapshot.bin
//!   docs/<hex doc id>/updates/<micros>.bin
//!   blobs/<key>.bin + blobs/<key>.json
//! ```
//!
//! Storages are pooled by universal id so every caller opening the same id
//! shares one `NativeFileDb` (and one connection).

mod blob;
mod doc;

pub use blob::{NativeBlobStorage, NativeBlobSyncStorage};
pub use doc::{NativeDocBackend, NativeDocSyncStorage};

use crate::connection::{Connection, Connector, StatusReporter};
use crate::error::{Result, StoreError};
use crate::storage::{DocClocks, DocStore, PeerClock, SpaceStorage, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::MutexGuard;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeFileOptions {
    /// Directory holding every universal id
    pub root: PathBuf,
    /// Pool key and directory name
    pub universal_id: String,
    pub space_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SyncFile {
    #[serde(default)]
    peer_clocks: HashMap<String, HashMap<String, PeerClock>>,
    #[serde(default)]
    blob_uploads: HashMap<String, HashMap<String, Timestamp>>,
}

#[derive(Debug, Default)]
pub(crate) struct NativeState {
    loaded: bool,
    clocks: DocClocks,
    sync: SyncFile,
}

pub struct NativeFileDb {
    universal_id: String,
    dir: PathBuf,
    connection: Arc<Connection>,
    state: Arc<tokio::sync::Mutex<NativeState>>,
}

struct NativeConnector {
    dir: PathBuf,
    state: Arc<tokio::sync::Mutex<NativeState>>,
}

#[async_trait]
impl Connector for NativeConnector {
    async fn do_connect(&self, _reporter: StatusReporter) -> Result<()> {
        let mut state = self.state.lock().await;
        load_state(&self.dir, &mut state).await
    }

    async fn do_disconnect(&self) {}
}

async fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Write via a temp file so readers never see a torn file.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_state(dir: &Path, state: &mut NativeState) -> Result<()> {
    if state.loaded {
        return Ok(());
    }
    tokio::fs::create_dir_all(dir.join("docs")).await?;
    tokio::fs::create_dir_all(dir.join("blobs")).await?;
    state.clocks = read_json(&dir.join("clocks.json")).await?;
    state.sync = read_json(&dir.join("sync.json")).await?;
    state.loaded = true;
    debug!("loaded {} doc clocks from {:?}", state.clocks.len(), dir);
    Ok(())
}

impl NativeFileDb {
    fn new(options: &NativeFileOptions) -> Result<Arc<Self>> {
        if options.universal_id.is_empty()
            || options.universal_id.contains(['/', '\\'])
            || options.universal_id.starts_with('.')
        {
            return Err(StoreError::Config(format!(
                "invalid universal id: {:?}",
                options.universal_id
            )));
        }
        let dir = options.root.join(&options.universal_id);
        let state = Arc::new(tokio::sync::Mutex::new(NativeState::default()));
        let connection = Connection::new(
            format!("native:{}", options.universal_id),
            Arc::new(NativeConnector {
                dir: dir.clone(),
                state: Arc::clone(&state),
            }),
        );
        Ok(Arc::new(Self {
            universal_id: options.universal_id.clone(),
            dir,
            connection,
            state,
        }))
    }

    pub fn universal_id(&self) -> &str {
        &self.universal_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Locked state, loaded from disk on first use.
    pub(crate) async fn state(&self) -> Result<MutexGuard<'_, NativeState>> {
        let mut state = self.state.lock().await;
        load_state(&self.dir, &mut state).await?;
        Ok(state)
    }

    pub(crate) async fn save_clocks(&self, state: &NativeState) -> Result<()> {
        write_atomic(&self.dir.join("clocks.json"), &serde_json::to_vec(&state.clocks)?).await
    }

    pub(crate) async fn save_sync(&self, state: &NativeState) -> Result<()> {
        write_atomic(&self.dir.join("sync.json"), &serde_json::to_vec(&state.sync)?).await
    }

    pub(crate) fn doc_dir(&self, doc_id: &str) -> PathBuf {
        self.dir.join("docs").join(hex::encode(doc_id.as_bytes()))
    }

    pub(crate) fn blob_path(&self, key: &str, extension: &str) -> Result<PathBuf> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(StoreError::Integrity(format!("invalid blob key: {:?}", key)));
        }
        Ok(self.dir.join("blobs").join(format!("{}.{}", key, extension)))
    }

    /// Doc, blob and sync roles for `space_id`.
    pub fn space(self: &Arc<Self>, space_id: &str) -> SpaceStorage {
        SpaceStorage {
            doc: Some(Arc::new(DocStore::new(
                space_id,
                NativeDocBackend::new(Arc::clone(self)),
                Arc::clone(&self.connection),
            ))),
            blob: Some(Arc::new(NativeBlobStorage::new(Arc::clone(self)))),
            doc_sync: Some(Arc::new(NativeDocSyncStorage::new(Arc::clone(self)))),
            blob_sync: Some(Arc::new(NativeBlobSyncStorage::new(Arc::clone(self)))),
            ..Default::default()
        }
    }
}

/// Native storages keyed by universal id.
#[derive(Default)]
pub struct NativeFilePool {
    storages: Mutex<HashMap<String, Arc<NativeFileDb>>>,
}

impl NativeFilePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide pool used by `open_space`.
    pub fn global() -> &'static NativeFilePool {
        static POOL: OnceLock<NativeFilePool> = OnceLock::new();
        POOL.get_or_init(NativeFilePool::new)
    }

    /// Existing storage for the id, or a new one.
    pub fn ensure_storage(&self, options: &NativeFileOptions) -> Result<Arc<NativeFileDb>> {
        let mut storages = self.storages.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(db) = storages.get(&options.universal_id) {
            return Ok(Arc::clone(db));
        }
        let db = NativeFileDb::new(options)?;
        info!("opened native storage {} at {:?}", options.universal_id, db.dir());
        storages.insert(options.universal_id.clone(), Arc::clone(&db));
        Ok(db)
    }

    pub fn get(&self, universal_id: &str) -> Option<Arc<NativeFileDb>> {
        self.storages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(universal_id)
            .cloned()
    }

    pub fn connect(&self, universal_id: &str) -> Result<()> {
        let db = self
            .get(universal_id)
            .ok_or_else(|| StoreError::NotFound(format!("native storage {}", universal_id)))?;
        db.connection().connect();
        Ok(())
    }

    pub async fn disconnect(&self, universal_id: &str) -> Result<()> {
        let db = self
            .get(universal_id)
            .ok_or_else(|| StoreError::NotFound(format!("native storage {}", universal_id)))?;
        db.connection().disconnect().await;
        Ok(())
    }

    /// Disconnect and forget the storage.
    pub async fn close(&self, universal_id: &str) {
        let removed = self
            .storages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(universal_id);
        if let Some(db) = removed {
            db.connection().disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::AbortSignal;

    fn options(root: &Path, id: &str) -> NativeFileOptions {
        NativeFileOptions {
            root: root.to_path_buf(),
            universal_id: id.to_string(),
            space_id: "ws".to_string(),
        }
    }

    #[tokio::test]
    async fn test_pool_shares_storage_per_id() {
        let dir = tempfile::tempdir().unwrap();
        let pool = NativeFilePool::new();

        let a = pool.ensure_storage(&options(dir.path(), "one")).unwrap();
        let b = pool.ensure_storage(&options(dir.path(), "one")).unwrap();
        let c = pool.ensure_storage(&options(dir.path(), "two")).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_pool_connect_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let pool = NativeFilePool::new();
        let db = pool.ensure_storage(&options(dir.path(), "one")).unwrap();

        pool.connect("one").unwrap();
        db.connection()
            .wait_for_connected(&AbortSignal::never())
            .await
            .unwrap();
        assert!(dir.path().join("one").join("docs").is_dir());
        assert!(dir.path().join("one").join("blobs").is_dir());

        pool.close("one").await;
        assert!(pool.get("one").is_none());
        assert!(pool.connect("one").is_err());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let pool = NativeFilePool::new();
        assert!(pool.ensure_storage(&options(dir.path(), "../escape")).is_err());
        assert!(pool.ensure_storage(&options(dir.path(), "")).is_err());
    }
}
