//! Embedded-local backend on SQLite.
//!
//! One database per `EmbeddedDb`: a file, or an in-memory database when no
//! path is given. Each storage operation runs as a single transaction on the
//! shared connection, so a crash keeps either all of an operation or none of
//! it. Every role opened from one `EmbeddedDb` shares its connection,
//! table-update topics and job queue.

mod blob;
mod doc;
mod indexer;

pub use blob::{EmbeddedBlobStorage, EmbeddedBlobSyncStorage};
pub use doc::{EmbeddedDocBackend, EmbeddedDocSyncStorage};
pub use indexer::{EmbeddedIndexSyncStorage, EmbeddedIndexer};

use super::awareness::MemoryAwarenessStorage;
use crate::connection::{Connection, Connector, StatusReporter};
use crate::error::Result;
use crate::events::Topics;
use crate::storage::{DocStore, SpaceStorage, Timestamp, indexer::IndexMutation, timestamp_from_micros};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where and how to open an embedded database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedOptions {
    /// Display name used in logs
    pub name: String,
    /// Database file; `None` keeps everything in memory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl EmbeddedOptions {
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
        }
    }

    pub fn at(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
        }
    }
}

pub struct EmbeddedDb {
    name: String,
    conn: Mutex<rusqlite::Connection>,
    /// Queued index mutations per table, flushed by `refresh`
    index_queue: Mutex<HashMap<String, Vec<IndexMutation>>>,
    connection: Arc<Connection>,
    table_updates: Topics<()>,
    job_notify: Notify,
    awareness: Arc<MemoryAwarenessStorage>,
}

struct EmbeddedConnector;

#[async_trait]
impl Connector for EmbeddedConnector {
    async fn do_connect(&self, _reporter: StatusReporter) -> Result<()> {
        Ok(())
    }

    async fn do_disconnect(&self) {}
}

fn init_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            doc_id TEXT PRIMARY KEY,
            bin BLOB NOT NULL,
            timestamp INTEGER NOT NULL
        );

        -- Pending updates, folded into the snapshot on read
        CREATE TABLE IF NOT EXISTS updates (
            doc_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            bin BLOB NOT NULL,
            PRIMARY KEY (doc_id, timestamp)
        );

        CREATE TABLE IF NOT EXISTS clocks (
            doc_id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_clocks_timestamp ON clocks(timestamp);

        CREATE TABLE IF NOT EXISTS peer_clocks (
            peer TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            remote_clock INTEGER,
            pulled_clock INTEGER,
            pushed_clock INTEGER,
            PRIMARY KEY (peer, doc_id)
        );

        CREATE TABLE IF NOT EXISTS blobs (
            key TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            mime TEXT NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            deleted_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS blob_uploads (
            peer TEXT NOT NULL,
            key TEXT NOT NULL,
            uploaded_at INTEGER NOT NULL,
            PRIMARY KEY (peer, key)
        );

        -- Index documents; fields are a JSON object of string lists
        CREATE TABLE IF NOT EXISTS index_documents (
            table_name TEXT NOT NULL,
            id TEXT NOT NULL,
            fields TEXT NOT NULL,
            PRIMARY KEY (table_name, id)
        );

        CREATE TABLE IF NOT EXISTS index_jobs_pending (
            seq INTEGER PRIMARY KEY,
            doc_id TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS index_jobs_in_flight (
            doc_id TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS indexed_clocks (
            doc_id TEXT PRIMARY KEY,
            timestamp INTEGER NOT NULL
        );
        "#,
    )
}

pub(crate) fn to_micros(timestamp: Timestamp) -> i64 {
    timestamp.timestamp_micros()
}

/// For row mappers: stored micros back to a timestamp.
pub(crate) fn from_micros(micros: i64) -> rusqlite::Result<Timestamp> {
    timestamp_from_micros(micros).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, micros))
}

impl EmbeddedDb {
    /// Open (or create) a database and its schema.
    pub fn open(options: EmbeddedOptions) -> Result<Arc<Self>> {
        let conn = match &options.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                rusqlite::Connection::open(path)?
            }
            None => rusqlite::Connection::open_in_memory()?,
        };
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_schema(&conn)?;

        // Jobs that were in flight when the process stopped run again.
        let requeued = indexer::requeue_interrupted(&conn)?;
        if requeued > 0 {
            info!("{}: requeued {} interrupted index jobs", options.name, requeued);
        }
        if let Some(path) = &options.path {
            info!("{}: opened {:?}", options.name, path);
        }

        let connection = Connection::new(format!("embedded:{}", options.name), Arc::new(EmbeddedConnector));
        let awareness = Arc::new(MemoryAwarenessStorage::new(Arc::clone(&connection)));

        Ok(Arc::new(Self {
            name: options.name,
            conn: Mutex::new(conn),
            index_queue: Mutex::new(HashMap::new()),
            connection,
            table_updates: Topics::new(),
            job_notify: Notify::new(),
            awareness,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Every role for `space_id`, sharing this database.
    pub fn space(self: &Arc<Self>, space_id: &str) -> SpaceStorage {
        SpaceStorage {
            doc: Some(Arc::new(DocStore::new(
                space_id,
                EmbeddedDocBackend::new(Arc::clone(self)),
                Arc::clone(&self.connection),
            ))),
            blob: Some(Arc::new(EmbeddedBlobStorage::new(Arc::clone(self)))),
            doc_sync: Some(Arc::new(EmbeddedDocSyncStorage::new(Arc::clone(self)))),
            blob_sync: Some(Arc::new(EmbeddedBlobSyncStorage::new(Arc::clone(self)))),
            awareness: Some(Arc::clone(&self.awareness) as _),
            indexer: Some(Arc::new(EmbeddedIndexer::new(Arc::clone(self)))),
            index_sync: Some(Arc::new(EmbeddedIndexSyncStorage::new(Arc::clone(self)))),
        }
    }

    /// Run `f` as one transaction; it commits only when `f` succeeds.
    pub(crate) fn transact<R>(&self, f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<R>) -> Result<R> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<R>) -> Result<R> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&conn)
    }
}
