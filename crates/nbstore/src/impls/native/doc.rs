use super::{NativeFileDb, write_atomic};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    DocBackend, DocClock, DocClocks, DocRecord, DocSyncStorage, PeerClock, Storage, StorageType,
    Timestamp, next_clock, timestamp_from_micros,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

const SNAPSHOT_FILE: &str = "snapshot.bin";
const UPDATES_DIR: &str = "updates";

pub struct NativeDocBackend {
    db: Arc<NativeFileDb>,
}

impl NativeDocBackend {
    pub fn new(db: Arc<NativeFileDb>) -> Self {
        Self { db }
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn update_file_name(timestamp: Timestamp) -> String {
    format!("{}.bin", timestamp.timestamp_micros())
}

#[async_trait]
impl DocBackend for NativeDocBackend {
    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        let path = self.db.doc_dir(doc_id).join(SNAPSHOT_FILE);
        match read_optional(&path).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_doc_snapshot(&self, snapshot: DocRecord) -> Result<bool> {
        if let Some(existing) = self.get_doc_snapshot(&snapshot.doc_id).await? {
            if existing.timestamp > snapshot.timestamp {
                return Ok(false);
            }
        }
        let path = self.db.doc_dir(&snapshot.doc_id).join(SNAPSHOT_FILE);
        write_atomic(&path, &bincode::serialize(&snapshot)?).await?;
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>> {
        let dir = self.db.doc_dir(doc_id).join(UPDATES_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut updates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(timestamp) = name
                .strip_suffix(".bin")
                .and_then(|micros| micros.parse::<i64>().ok())
                .and_then(timestamp_from_micros)
            else {
                warn!("ignoring stray file {:?} in {:?}", name, dir);
                continue;
            };
            updates.push(DocRecord {
                doc_id: doc_id.to_string(),
                bin: tokio::fs::read(entry.path()).await?,
                timestamp,
            });
        }
        updates.sort_by_key(|u| u.timestamp);
        Ok(updates)
    }

    async fn mark_updates_merged(&self, doc_id: &str, timestamps: &[Timestamp]) -> Result<usize> {
        let dir = self.db.doc_dir(doc_id).join(UPDATES_DIR);
        let mut removed = 0;
        for timestamp in timestamps {
            match tokio::fs::remove_file(dir.join(update_file_name(*timestamp))).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    async fn insert_update(&self, doc_id: &str, bin: Vec<u8>) -> Result<Timestamp> {
        let mut state = self.db.state().await?;
        let timestamp = next_clock(state.clocks.get(doc_id).copied());
        let path = self
            .db
            .doc_dir(doc_id)
            .join(UPDATES_DIR)
            .join(update_file_name(timestamp));
        write_atomic(&path, &bin).await?;
        state.clocks.insert(doc_id.to_string(), timestamp);
        self.db.save_clocks(&state).await?;
        Ok(timestamp)
    }

    async fn get_doc_clock(&self, doc_id: &str) -> Result<Option<Timestamp>> {
        Ok(self.db.state().await?.clocks.get(doc_id).copied())
    }

    async fn get_doc_clocks(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        Ok(self
            .db
            .state()
            .await?
            .clocks
            .iter()
            .filter(|(_, ts)| after.is_none_or(|after| **ts > after))
            .map(|(id, ts)| (id.clone(), *ts))
            .collect())
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let mut state = self.db.state().await?;
        match tokio::fs::remove_dir_all(self.db.doc_dir(doc_id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if state.clocks.remove(doc_id).is_some() {
            self.db.save_clocks(&state).await?;
        }
        Ok(())
    }
}

pub struct NativeDocSyncStorage {
    db: Arc<NativeFileDb>,
}

impl NativeDocSyncStorage {
    pub fn new(db: Arc<NativeFileDb>) -> Self {
        Self { db }
    }

    async fn clocks(&self, peer: &str, pick: fn(&PeerClock) -> Option<Timestamp>) -> Result<DocClocks> {
        let state = self.db.state().await?;
        Ok(state
            .sync
            .peer_clocks
            .get(peer)
            .map(|docs| {
                docs.iter()
                    .filter_map(|(doc_id, clock)| pick(clock).map(|ts| (doc_id.clone(), ts)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clock(
        &self,
        peer: &str,
        doc_id: &str,
        pick: fn(&PeerClock) -> Option<Timestamp>,
    ) -> Result<Option<DocClock>> {
        let state = self.db.state().await?;
        Ok(state
            .sync
            .peer_clocks
            .get(peer)
            .and_then(|docs| docs.get(doc_id))
            .and_then(pick)
            .map(|timestamp| DocClock {
                doc_id: doc_id.to_string(),
                timestamp,
            }))
    }

    async fn advance(
        &self,
        peer: &str,
        clock: DocClock,
        slot: fn(&mut PeerClock) -> &mut Option<Timestamp>,
    ) -> Result<()> {
        let mut state = self.db.state().await?;
        let entry = state
            .sync
            .peer_clocks
            .entry(peer.to_string())
            .or_default()
            .entry(clock.doc_id)
            .or_default();
        if PeerClock::advance(slot(entry), clock.timestamp) {
            self.db.save_sync(&state).await?;
        }
        Ok(())
    }
}

impl Storage for NativeDocSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::DocSync
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl DocSyncStorage for NativeDocSyncStorage {
    async fn get_peer_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, |c| c.clock).await
    }

    async fn get_peer_remote_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, |c| c.clock).await
    }

    async fn set_peer_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, |c| &mut c.clock).await
    }

    async fn get_peer_pulled_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, |c| c.pulled_clock).await
    }

    async fn get_peer_pulled_remote_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, |c| c.pulled_clock).await
    }

    async fn set_peer_pulled_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, |c| &mut c.pulled_clock).await
    }

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, |c| c.pushed_clock).await
    }

    async fn get_peer_pushed_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, |c| c.pushed_clock).await
    }

    async fn set_peer_pushed_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, |c| &mut c.pushed_clock).await
    }

    async fn clear_clocks(&self) -> Result<()> {
        let mut state = self.db.state().await?;
        state.sync.peer_clocks.clear();
        self.db.save_sync(&state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::testing::{body_text, text_update};
    use crate::impls::native::{NativeFileOptions, NativeFilePool};
    use crate::storage::{DocUpdate, now};

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
    async fn test_updates_and_clocks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let db = open(dir.path());
            let doc = db.space("ws").doc.unwrap();
            doc.push_doc_update(DocUpdate::new("d1", text_update(1, "on ")), None)
                .await
                .unwrap();
            doc.push_doc_update(DocUpdate::new("d1", text_update(2, "disk")), None)
                .await
                .unwrap()
        };

        let db = open(dir.path());
        let doc = db.space("ws").doc.unwrap();
        assert_eq!(
            doc.get_doc_timestamp("d1").await.unwrap().unwrap().timestamp,
            first.timestamp
        );
        let merged = doc.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(body_text(&merged.bin).len(), "on disk".len());

        // Compaction folded the update files into the snapshot.
        let backend = NativeDocBackend::new(Arc::clone(&db));
        assert!(backend.get_doc_updates("d1").await.unwrap().is_empty());
        assert!(backend.get_doc_snapshot("d1").await.unwrap().is_some());

        let next = doc
            .push_doc_update(DocUpdate::new("d1", text_update(3, "!")), None)
            .await
            .unwrap();
        assert!(next.timestamp > first.timestamp);
    }

    #[tokio::test]
    async fn test_delete_removes_files_and_clock() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let doc = db.space("ws").doc.unwrap();
        doc.push_doc_update(DocUpdate::new("d/1", text_update(1, "x")), None)
            .await
            .unwrap();
        assert!(db.doc_dir("d/1").is_dir());

        doc.delete_doc("d/1").await.unwrap();
        assert!(!db.doc_dir("d/1").exists());
        assert!(doc.get_doc_timestamps(None).await.unwrap().is_empty());
        doc.delete_doc("d/1").await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_clocks_persist() {
        let dir = tempfile::tempdir().unwrap();
        let t = now();
        {
            let sync = NativeDocSyncStorage::new(open(dir.path()));
            sync.set_peer_pulled_remote_clock("cloud", DocClock { doc_id: "d1".into(), timestamp: t })
                .await
                .unwrap();
        }
        let sync = NativeDocSyncStorage::new(open(dir.path()));
        assert_eq!(
            sync.get_peer_pulled_remote_clocks("cloud").await.unwrap().get("d1"),
            Some(&t)
        );
        assert!(sync.get_peer_pushed_clock("cloud", "d1").await.unwrap().is_none());
    }
}
