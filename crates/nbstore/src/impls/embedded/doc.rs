use super::{EmbeddedDb, from_micros, to_micros};
use crate::connection::Connection;
use crate::error::Result;
use crate::storage::{
    DocBackend, DocClock, DocClocks, DocRecord, DocSyncStorage, Storage, StorageType, Timestamp,
    next_clock,
};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use std::sync::Arc;

pub struct EmbeddedDocBackend {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedDocBackend {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DocBackend for EmbeddedDocBackend {
    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT bin, timestamp FROM snapshots WHERE doc_id = ?1",
                    params![doc_id],
                    |row| {
                        Ok(DocRecord {
                            doc_id: doc_id.to_string(),
                            bin: row.get(0)?,
                            timestamp: from_micros(row.get(1)?)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    async fn set_doc_snapshot(&self, snapshot: DocRecord) -> Result<bool> {
        self.db.transact(|tx| {
            // Only a snapshot at least as new as the stored one wins.
            let written = tx.execute(
                "INSERT INTO snapshots (doc_id, bin, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(doc_id) DO UPDATE SET bin = excluded.bin, timestamp = excluded.timestamp
                 WHERE excluded.timestamp >= snapshots.timestamp",
                params![snapshot.doc_id, snapshot.bin, to_micros(snapshot.timestamp)],
            )?;
            Ok(written > 0)
        })
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT bin, timestamp FROM updates WHERE doc_id = ?1 ORDER BY timestamp ASC",
            )?;
            let updates = stmt
                .query_map(params![doc_id], |row| {
                    Ok(DocRecord {
                        doc_id: doc_id.to_string(),
                        bin: row.get(0)?,
                        timestamp: from_micros(row.get(1)?)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(updates)
        })
    }

    async fn mark_updates_merged(&self, doc_id: &str, timestamps: &[Timestamp]) -> Result<usize> {
        self.db.transact(|tx| {
            let mut stmt = tx.prepare_cached("DELETE FROM updates WHERE doc_id = ?1 AND timestamp = ?2")?;
            let mut removed = 0;
            for timestamp in timestamps {
                removed += stmt.execute(params![doc_id, to_micros(*timestamp)])?;
            }
            Ok(removed)
        })
    }

    async fn insert_update(&self, doc_id: &str, bin: Vec<u8>) -> Result<Timestamp> {
        self.db.transact(|tx| {
            let last: Option<i64> = tx
                .query_row(
                    "SELECT timestamp FROM clocks WHERE doc_id = ?1",
                    params![doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            let timestamp = next_clock(last.map(from_micros).transpose()?);
            let micros = to_micros(timestamp);

            tx.execute(
                "INSERT INTO updates (doc_id, timestamp, bin) VALUES (?1, ?2, ?3)",
                params![doc_id, micros, bin],
            )?;
            tx.execute(
                "INSERT INTO clocks (doc_id, timestamp) VALUES (?1, ?2)
                 ON CONFLICT(doc_id) DO UPDATE SET timestamp = excluded.timestamp",
                params![doc_id, micros],
            )?;
            Ok(timestamp)
        })
    }

    async fn get_doc_clock(&self, doc_id: &str) -> Result<Option<Timestamp>> {
        self.db.read(|conn| {
            let micros: Option<i64> = conn
                .query_row(
                    "SELECT timestamp FROM clocks WHERE doc_id = ?1",
                    params![doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(micros.map(from_micros).transpose()?)
        })
    }

    async fn get_doc_clocks(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        let after = after.map(to_micros).unwrap_or(i64::MIN);
        self.db.read(|conn| {
            let mut stmt = conn.prepare("SELECT doc_id, timestamp FROM clocks WHERE timestamp > ?1")?;
            let clocks = stmt
                .query_map(params![after], |row| {
                    Ok((row.get::<_, String>(0)?, from_micros(row.get(1)?)?))
                })?
                .collect::<rusqlite::Result<DocClocks>>()?;
            Ok(clocks)
        })
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        self.db.transact(|tx| {
            for table in ["snapshots", "updates", "clocks"] {
                tx.execute(&format!("DELETE FROM {table} WHERE doc_id = ?1"), params![doc_id])?;
            }
            Ok(())
        })
    }
}

/// Which of the three per-peer clocks a call reads or advances.
#[derive(Debug, Clone, Copy)]
enum PeerClockColumn {
    Remote,
    Pulled,
    Pushed,
}

impl PeerClockColumn {
    fn name(self) -> &'static str {
        match self {
            PeerClockColumn::Remote => "remote_clock",
            PeerClockColumn::Pulled => "pulled_clock",
            PeerClockColumn::Pushed => "pushed_clock",
        }
    }
}

pub struct EmbeddedDocSyncStorage {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedDocSyncStorage {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }

    fn clocks(&self, peer: &str, column: PeerClockColumn) -> Result<DocClocks> {
        let sql = format!(
            "SELECT doc_id, {col} FROM peer_clocks WHERE peer = ?1 AND {col} IS NOT NULL",
            col = column.name()
        );
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let clocks = stmt
                .query_map(params![peer], |row| {
                    Ok((row.get::<_, String>(0)?, from_micros(row.get(1)?)?))
                })?
                .collect::<rusqlite::Result<DocClocks>>()?;
            Ok(clocks)
        })
    }

    fn clock(&self, peer: &str, doc_id: &str, column: PeerClockColumn) -> Result<Option<DocClock>> {
        let sql = format!(
            "SELECT {} FROM peer_clocks WHERE peer = ?1 AND doc_id = ?2",
            column.name()
        );
        self.db.read(|conn| {
            let micros: Option<Option<i64>> = conn
                .query_row(&sql, params![peer, doc_id], |row| row.get(0))
                .optional()?;
            Ok(micros
                .flatten()
                .map(from_micros)
                .transpose()?
                .map(|timestamp| DocClock {
                    doc_id: doc_id.to_string(),
                    timestamp,
                }))
        })
    }

    /// Greater-only update of one clock column.
    fn advance(&self, peer: &str, clock: DocClock, column: PeerClockColumn) -> Result<()> {
        let sql = format!(
            "INSERT INTO peer_clocks (peer, doc_id, {col}) VALUES (?1, ?2, ?3)
             ON CONFLICT(peer, doc_id) DO UPDATE SET {col} = excluded.{col}
             WHERE peer_clocks.{col} IS NULL OR peer_clocks.{col} < excluded.{col}",
            col = column.name()
        );
        self.db.transact(|tx| {
            tx.execute(&sql, params![peer, clock.doc_id, to_micros(clock.timestamp)])?;
            Ok(())
        })
    }
}

impl Storage for EmbeddedDocSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::DocSync
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl DocSyncStorage for EmbeddedDocSyncStorage {
    async fn get_peer_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, PeerClockColumn::Remote)
    }

    async fn get_peer_remote_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, PeerClockColumn::Remote)
    }

    async fn set_peer_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, PeerClockColumn::Remote)
    }

    async fn get_peer_pulled_remote_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, PeerClockColumn::Pulled)
    }

    async fn get_peer_pulled_remote_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, PeerClockColumn::Pulled)
    }

    async fn set_peer_pulled_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, PeerClockColumn::Pulled)
    }

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks> {
        self.clocks(peer, PeerClockColumn::Pushed)
    }

    async fn get_peer_pushed_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>> {
        self.clock(peer, doc_id, PeerClockColumn::Pushed)
    }

    async fn set_peer_pushed_clock(&self, peer: &str, clock: DocClock) -> Result<()> {
        self.advance(peer, clock, PeerClockColumn::Pushed)
    }

    async fn clear_clocks(&self) -> Result<()> {
        self.db.transact(|tx| {
            tx.execute("DELETE FROM peer_clocks", [])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt;
    use crate::crdt::testing::{body_text, text_update};
    use crate::impls::embedded::EmbeddedOptions;
    use crate::storage::{DocStorage, DocUpdate, now};
    use crate::error::StoreError;
    use chrono::Duration;
    use std::sync::Mutex;

    fn open() -> (Arc<EmbeddedDb>, Arc<dyn DocStorage>) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("test")).unwrap();
        let doc = db.space("ws").doc.unwrap();
        (db, doc)
    }

    #[tokio::test]
    async fn test_push_clocks_strictly_increase() {
        let (_db, doc) = open();
        let mut last = None;
        for i in 0..50 {
            let clock = doc
                .push_doc_update(DocUpdate::new("d1", text_update(i + 1, "x")), None)
                .await
                .unwrap();
            if let Some(prev) = last {
                assert!(clock.timestamp > prev);
            }
            last = Some(clock.timestamp);
        }
        assert_eq!(
            doc.get_doc_timestamp("d1").await.unwrap().unwrap().timestamp,
            last.unwrap()
        );
    }

    #[tokio::test]
    async fn test_concurrent_pushes_serialize() {
        let (_db, doc) = open();
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let doc = Arc::clone(&doc);
            handles.push(tokio::spawn(async move {
                doc.push_doc_update(DocUpdate::new("d1", text_update(i + 1, "a")), None)
                    .await
                    .unwrap()
                    .timestamp
            }));
        }
        let mut clocks = Vec::new();
        for handle in handles {
            clocks.push(handle.await.unwrap());
        }
        clocks.sort();
        clocks.dedup();
        assert_eq!(clocks.len(), 16);

        let merged = doc.get_doc("d1").await.unwrap().unwrap();
        assert_eq!(body_text(&merged.bin).len(), 16);
    }

    #[tokio::test]
    async fn test_get_doc_compacts_and_preserves_merge() {
        let (db, doc) = open();
        doc.push_doc_update(DocUpdate::new("d1", text_update(1, "hello ")), None)
            .await
            .unwrap();
        doc.push_doc_update(DocUpdate::new("d1", text_update(2, "world")), None)
            .await
            .unwrap();

        let backend = EmbeddedDocBackend::new(Arc::clone(&db));
        assert_eq!(backend.get_doc_updates("d1").await.unwrap().len(), 2);

        let first = doc.get_doc("d1").await.unwrap().unwrap();
        assert!(backend.get_doc_updates("d1").await.unwrap().is_empty());
        let second = doc.get_doc("d1").await.unwrap().unwrap();

        assert_eq!(first.bin, second.bin);
        assert_eq!(first.timestamp, second.timestamp);
        assert_eq!(body_text(&first.bin).len(), "hello world".len());
    }

    #[tokio::test]
    async fn test_applying_same_diff_twice_is_idempotent() {
        let (_db, doc) = open();
        doc.push_doc_update(DocUpdate::new("d1", text_update(1, "base")), None)
            .await
            .unwrap();

        let remote = text_update(9, "remote");
        doc.push_doc_update(DocUpdate::new("d1", remote.clone()), None)
            .await
            .unwrap();
        let once = doc.get_doc("d1").await.unwrap().unwrap();

        doc.push_doc_update(DocUpdate::new("d1", remote), None)
            .await
            .unwrap();
        let twice = doc.get_doc("d1").await.unwrap().unwrap();

        assert_eq!(crdt::to_json(&once.bin).unwrap(), crdt::to_json(&twice.bin).unwrap());
        assert!(crdt::state_equals(
            &crdt::encode_state_vector(&once.bin).unwrap(),
            &crdt::encode_state_vector(&twice.bin).unwrap()
        )
        .unwrap());
    }

    #[tokio::test]
    async fn test_older_snapshot_is_rejected() {
        let (db, _doc) = open();
        let backend = EmbeddedDocBackend::new(Arc::clone(&db));
        let t = now();

        let newer = DocRecord {
            doc_id: "d1".into(),
            bin: text_update(1, "new"),
            timestamp: t,
        };
        let older = DocRecord {
            doc_id: "d1".into(),
            bin: text_update(1, "old"),
            timestamp: t - Duration::seconds(5),
        };
        assert!(backend.set_doc_snapshot(newer.clone()).await.unwrap());
        assert!(!backend.set_doc_snapshot(older).await.unwrap());
        assert_eq!(backend.get_doc_snapshot("d1").await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_diff_does_not_mutate() {
        let (db, doc) = open();
        doc.push_doc_update(DocUpdate::new("d1", text_update(1, "a")), None)
            .await
            .unwrap();
        let diff = doc.get_doc_diff("d1", None).await.unwrap().unwrap();
        assert_eq!(body_text(&diff.missing), "a");
        let backend = EmbeddedDocBackend::new(Arc::clone(&db));
        assert!(backend.get_doc_snapshot("d1").await.unwrap().is_none());
        assert_eq!(backend.get_doc_updates("d1").await.unwrap().len(), 1);
        assert!(doc.get_doc_diff("missing", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_update_is_rejected() {
        let (_db, doc) = open();
        let err = doc
            .push_doc_update(DocUpdate::new("d1", vec![1, 2, 3]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(doc.get_doc_timestamp("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_subscribers_see_origin() {
        let (_db, doc) = open();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = doc.subscribe_doc_update(Box::new(move |event| {
            seen_clone
                .lock()
                .unwrap()
                .push((event.record.doc_id.clone(), event.origin.clone()));
        }));

        doc.push_doc_update(DocUpdate::new("d1", text_update(1, "a")), Some("peer:cloud"))
            .await
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("d1".to_string(), Some("peer:cloud".to_string()))]
        );
    }

    #[tokio::test]
    async fn test_timestamps_after_filter_and_delete() {
        let (_db, doc) = open();
        let c1 = doc
            .push_doc_update(DocUpdate::new("d1", text_update(1, "a")), None)
            .await
            .unwrap();
        doc.push_doc_update(DocUpdate::new("d2", text_update(1, "b")), None)
            .await
            .unwrap();

        let after = doc.get_doc_timestamps(Some(c1.timestamp)).await.unwrap();
        assert!(after.contains_key("d2"));
        assert!(!after.contains_key("d1"));

        doc.delete_doc("d1").await.unwrap();
        assert!(doc.get_doc("d1").await.unwrap().is_none());
        assert_eq!(doc.get_doc_timestamps(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_peer_clocks_only_move_forward() {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("test")).unwrap();
        let sync = EmbeddedDocSyncStorage::new(Arc::clone(&db));
        let t = now();

        sync.set_peer_pushed_clock("cloud", DocClock { doc_id: "d1".into(), timestamp: t })
            .await
            .unwrap();
        sync.set_peer_pushed_clock(
            "cloud",
            DocClock {
                doc_id: "d1".into(),
                timestamp: t - Duration::seconds(1),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            sync.get_peer_pushed_clock("cloud", "d1").await.unwrap().unwrap().timestamp,
            t
        );
        assert!(sync.get_peer_remote_clock("cloud", "d1").await.unwrap().is_none());
        assert!(sync.get_peer_pushed_clocks("other").await.unwrap().is_empty());

        sync.clear_clocks().await.unwrap();
        assert!(sync.get_peer_pushed_clocks("cloud").await.unwrap().is_empty());
    }
}
