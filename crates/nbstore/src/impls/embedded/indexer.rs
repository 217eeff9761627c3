use super::{EmbeddedDb, from_micros, to_micros};
use crate::connection::Connection;
use crate::error::Result;
use crate::events::Subscription;
use crate::signal::AbortSignal;
use crate::storage::indexer::{
    AggregateOptions, AggregateResult, IndexMutation, TableUpdatedCallback, aggregate_table,
    apply_mutations, search_table,
};
use crate::storage::{
    DocClock, IndexDocument, IndexJob, IndexerStorage, IndexerSyncStorage, Query, SearchOptions,
    SearchResult, Storage, StorageType, Timestamp,
};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

type Fields = BTreeMap<String, Vec<String>>;

/// Put jobs left in flight by a previous process back at the head of the
/// queue, in doc id order. Returns how many were requeued.
pub(super) fn requeue_interrupted(conn: &rusqlite::Connection) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let interrupted = {
        let mut stmt = tx.prepare("SELECT doc_id FROM index_jobs_in_flight ORDER BY doc_id DESC")?;
        stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut requeued = 0;
    for doc_id in &interrupted {
        let head: i64 = tx.query_row(
            "SELECT COALESCE(MIN(seq), 1) FROM index_jobs_pending",
            [],
            |row| row.get(0),
        )?;
        requeued += tx.execute(
            "INSERT OR IGNORE INTO index_jobs_pending (seq, doc_id) VALUES (?1, ?2)",
            params![head - 1, doc_id],
        )?;
    }
    tx.execute("DELETE FROM index_jobs_in_flight", [])?;
    tx.commit()?;
    Ok(requeued)
}

fn load_table(conn: &rusqlite::Connection, table: &str) -> Result<Vec<IndexDocument>> {
    let mut stmt = conn.prepare("SELECT id, fields FROM index_documents WHERE table_name = ?1")?;
    let rows = stmt
        .query_map(params![table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, fields)| {
            Ok(IndexDocument {
                id,
                fields: serde_json::from_str::<Fields>(&fields)?,
            })
        })
        .collect()
}

pub struct EmbeddedIndexer {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedIndexer {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }

    fn queue(&self, table: &str, mutation: IndexMutation) {
        self.db
            .index_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .push(mutation);
    }

    /// Apply `mutations` in one transaction: load the touched rows, fold the
    /// mutations over them, write back what remains.
    fn apply(&self, table: &str, mutations: Vec<IndexMutation>) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        let count = mutations.len();
        self.db.transact(|tx| {
            let mut touched: HashMap<String, IndexDocument> = HashMap::new();
            let mut ids: Vec<String> = Vec::new();
            {
                let mut select = tx.prepare_cached(
                    "SELECT fields FROM index_documents WHERE table_name = ?1 AND id = ?2",
                )?;
                for mutation in &mutations {
                    let id = match mutation {
                        IndexMutation::Insert(doc) | IndexMutation::Update(doc) => &doc.id,
                        IndexMutation::Delete(id) => id,
                    };
                    if ids.contains(id) {
                        continue;
                    }
                    ids.push(id.clone());
                    let fields: Option<String> =
                        select.query_row(params![table, id], |row| row.get(0)).optional()?;
                    if let Some(fields) = fields {
                        touched.insert(
                            id.clone(),
                            IndexDocument {
                                id: id.clone(),
                                fields: serde_json::from_str(&fields)?,
                            },
                        );
                    }
                }
            }

            apply_mutations(&mut touched, mutations);

            let mut upsert = tx.prepare_cached(
                "INSERT INTO index_documents (table_name, id, fields) VALUES (?1, ?2, ?3)
                 ON CONFLICT(table_name, id) DO UPDATE SET fields = excluded.fields",
            )?;
            let mut delete =
                tx.prepare_cached("DELETE FROM index_documents WHERE table_name = ?1 AND id = ?2")?;
            for id in &ids {
                match touched.get(id) {
                    Some(doc) => upsert.execute(params![table, id, serde_json::to_string(&doc.fields)?])?,
                    None => delete.execute(params![table, id])?,
                };
            }
            Ok(())
        })?;
        trace!("{}: applied {} mutations to {}", self.db.name(), count, table);
        self.db.table_updates.emit(table, &());
        Ok(())
    }

    /// Claim the first pending job whose doc is not already in flight.
    fn try_accept(&self) -> Result<Option<IndexJob>> {
        self.db.transact(|tx| {
            let next: Option<(i64, String)> = tx
                .query_row(
                    "SELECT seq, doc_id FROM index_jobs_pending
                     WHERE doc_id NOT IN (SELECT doc_id FROM index_jobs_in_flight)
                     ORDER BY seq ASC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((seq, doc_id)) = next else {
                return Ok(None);
            };
            tx.execute("DELETE FROM index_jobs_pending WHERE seq = ?1", params![seq])?;
            tx.execute(
                "INSERT INTO index_jobs_in_flight (doc_id) VALUES (?1)",
                params![doc_id],
            )?;
            Ok(Some(IndexJob { doc_id }))
        })
    }
}

impl Storage for EmbeddedIndexer {
    fn storage_type(&self) -> StorageType {
        StorageType::Index
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl IndexerStorage for EmbeddedIndexer {
    async fn search(
        &self,
        table: &str,
        query: &Query,
        options: &SearchOptions,
    ) -> Result<SearchResult> {
        let docs = self.db.read(|conn| load_table(conn, table))?;
        Ok(search_table(docs.iter(), query, options))
    }

    async fn aggregate(
        &self,
        table: &str,
        query: &Query,
        field: &str,
        options: &AggregateOptions,
    ) -> Result<AggregateResult> {
        let docs = self.db.read(|conn| load_table(conn, table))?;
        Ok(aggregate_table(docs.iter(), query, field, options))
    }

    async fn insert(&self, table: &str, document: IndexDocument) -> Result<()> {
        self.queue(table, IndexMutation::Insert(document));
        Ok(())
    }

    async fn update(&self, table: &str, document: IndexDocument) -> Result<()> {
        self.queue(table, IndexMutation::Update(document));
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<()> {
        self.queue(table, IndexMutation::Delete(id.to_string()));
        Ok(())
    }

    async fn refresh(&self, table: &str) -> Result<()> {
        let mutations = self
            .db
            .index_queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(table)
            .unwrap_or_default();
        self.apply(table, mutations)
    }

    async fn write(
        &self,
        table: &str,
        upserts: Vec<IndexDocument>,
        deletes: Vec<String>,
    ) -> Result<()> {
        let mutations = deletes
            .into_iter()
            .map(IndexMutation::Delete)
            .chain(upserts.into_iter().map(IndexMutation::Insert))
            .collect();
        self.apply(table, mutations)
    }

    async fn delete_by_query(&self, table: &str, query: &Query) -> Result<()> {
        let removed = self.db.transact(|tx| {
            let matching: Vec<String> = load_table(tx, table)?
                .into_iter()
                .filter(|doc| query.matches(doc))
                .map(|doc| doc.id)
                .collect();
            let mut delete =
                tx.prepare_cached("DELETE FROM index_documents WHERE table_name = ?1 AND id = ?2")?;
            for id in &matching {
                delete.execute(params![table, id])?;
            }
            Ok(matching.len())
        })?;
        if removed > 0 {
            self.db.table_updates.emit(table, &());
        }
        Ok(())
    }

    async fn all_ids(&self, table: &str) -> Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT id FROM index_documents WHERE table_name = ?1 ORDER BY id ASC")?;
            let ids = stmt
                .query_map(params![table], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    async fn enqueue_index_job(&self, doc_id: &str) -> Result<()> {
        // A doc already waiting keeps its place.
        self.db.transact(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO index_jobs_pending (seq, doc_id)
                 SELECT COALESCE(MAX(seq), 0) + 1, ?1 FROM index_jobs_pending",
                params![doc_id],
            )?;
            Ok(())
        })?;
        self.db.job_notify.notify_waiters();
        Ok(())
    }

    async fn accept_index_job(&self, signal: &AbortSignal) -> Result<IndexJob> {
        loop {
            let notified = self.db.job_notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue is not missed.
            notified.as_mut().enable();

            if let Some(job) = self.try_accept()? {
                return Ok(job);
            }
            signal.run(notified).await?;
        }
    }

    async fn complete_index_job(&self, job: IndexJob) -> Result<()> {
        self.db.transact(|tx| {
            tx.execute(
                "DELETE FROM index_jobs_in_flight WHERE doc_id = ?1",
                params![job.doc_id],
            )?;
            Ok(())
        })?;
        self.db.job_notify.notify_waiters();
        Ok(())
    }

    async fn index_job_count(&self) -> Result<usize> {
        self.db.read(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM (
                     SELECT doc_id FROM index_jobs_pending
                     UNION
                     SELECT doc_id FROM index_jobs_in_flight
                 )",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn subscribe_table_updated(
        &self,
        table: &str,
        callback: TableUpdatedCallback,
    ) -> Subscription {
        self.db.table_updates.subscribe(table, move |_| callback())
    }
}

pub struct EmbeddedIndexSyncStorage {
    db: Arc<EmbeddedDb>,
}

impl EmbeddedIndexSyncStorage {
    pub fn new(db: Arc<EmbeddedDb>) -> Self {
        Self { db }
    }
}

impl Storage for EmbeddedIndexSyncStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::IndexSync
    }

    fn connection(&self) -> &Arc<Connection> {
        self.db.connection()
    }
}

#[async_trait]
impl IndexerSyncStorage for EmbeddedIndexSyncStorage {
    async fn get_doc_indexed_clock(&self, doc_id: &str) -> Result<Option<DocClock>> {
        self.db.read(|conn| {
            let micros: Option<i64> = conn
                .query_row(
                    "SELECT timestamp FROM indexed_clocks WHERE doc_id = ?1",
                    params![doc_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(micros.map(from_micros).transpose()?.map(|timestamp| DocClock {
                doc_id: doc_id.to_string(),
                timestamp,
            }))
        })
    }

    async fn set_doc_indexed_clock(&self, doc_id: &str, timestamp: Timestamp) -> Result<()> {
        self.db.transact(|tx| {
            tx.execute(
                "INSERT INTO indexed_clocks (doc_id, timestamp) VALUES (?1, ?2)
                 ON CONFLICT(doc_id) DO UPDATE SET timestamp = excluded.timestamp",
                params![doc_id, to_micros(timestamp)],
            )?;
            Ok(())
        })
    }

    async fn clear_doc_indexed_clock(&self, doc_id: &str) -> Result<()> {
        self.db.transact(|tx| {
            tx.execute("DELETE FROM indexed_clocks WHERE doc_id = ?1", params![doc_id])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::impls::embedded::EmbeddedOptions;
    use crate::signal::AbortController;
    use crate::storage::indexer::BLOCK_TABLE;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn open() -> (Arc<EmbeddedDb>, Arc<EmbeddedIndexer>) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("index")).unwrap();
        let indexer = Arc::new(EmbeddedIndexer::new(Arc::clone(&db)));
        (db, indexer)
    }

    #[tokio::test]
    async fn test_queued_mutations_apply_on_refresh() {
        let (_db, indexer) = open();
        indexer
            .insert(BLOCK_TABLE, IndexDocument::new("b1").with("docId", "a"))
            .await
            .unwrap();
        assert!(indexer.all_ids(BLOCK_TABLE).await.unwrap().is_empty());

        indexer.refresh(BLOCK_TABLE).await.unwrap();
        assert_eq!(indexer.all_ids(BLOCK_TABLE).await.unwrap(), vec!["b1"]);

        indexer.delete(BLOCK_TABLE, "b1").await.unwrap();
        indexer.refresh(BLOCK_TABLE).await.unwrap();
        assert!(indexer.all_ids(BLOCK_TABLE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_query_only_touches_matches() {
        let (_db, indexer) = open();
        indexer
            .write(
                BLOCK_TABLE,
                vec![
                    IndexDocument::new("b1").with("docId", "a"),
                    IndexDocument::new("b2").with("docId", "b"),
                ],
                vec![],
            )
            .await
            .unwrap();

        indexer
            .delete_by_query(BLOCK_TABLE, &Query::match_field("docId", "a"))
            .await
            .unwrap();
        assert_eq!(indexer.all_ids(BLOCK_TABLE).await.unwrap(), vec!["b2"]);
    }

    #[tokio::test]
    async fn test_table_updates_reach_every_instance_on_the_backend() {
        let (db, writer) = open();
        let reader = EmbeddedIndexer::new(Arc::clone(&db));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let _sub = reader.subscribe_table_updated(
            BLOCK_TABLE,
            Box::new(move || {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        writer
            .write(BLOCK_TABLE, vec![IndexDocument::new("b1")], vec![])
            .await
            .unwrap();
        writer.write("doc", vec![IndexDocument::new("d")], vec![]).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_enqueues_coalesce() {
        let (_db, indexer) = open();
        indexer.enqueue_index_job("a").await.unwrap();
        indexer.enqueue_index_job("a").await.unwrap();
        indexer.enqueue_index_job("b").await.unwrap();
        assert_eq!(indexer.index_job_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_at_most_one_in_flight_job_per_doc() {
        let (_db, indexer) = open();
        indexer.enqueue_index_job("a").await.unwrap();

        let signal = AbortSignal::never();
        let first = indexer.accept_index_job(&signal).await.unwrap();
        assert_eq!(first.doc_id, "a");

        // Re-enqueued while in flight: must wait for completion.
        indexer.enqueue_index_job("a").await.unwrap();
        let second = {
            let indexer = Arc::clone(&indexer);
            tokio::spawn(async move { indexer.accept_index_job(&AbortSignal::never()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        indexer.complete_index_job(first).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.doc_id, "a");
    }

    #[tokio::test]
    async fn test_concurrent_acceptors_never_share_a_doc() {
        let (_db, indexer) = open();
        for i in 0..20 {
            indexer.enqueue_index_job(&format!("doc-{}", i)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let indexer = Arc::clone(&indexer);
            handles.push(tokio::spawn(async move {
                let controller = AbortController::new();
                let signal = controller.signal();
                let mut taken = Vec::new();
                loop {
                    let accept = indexer.accept_index_job(&signal);
                    match tokio::time::timeout(Duration::from_millis(50), accept).await {
                        Ok(Ok(job)) => taken.push(job.doc_id),
                        _ => break,
                    }
                }
                taken
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn test_accept_is_cancellable() {
        let (_db, indexer) = open();
        let controller = AbortController::new();
        let signal = controller.signal();
        let waiter = {
            let indexer = Arc::clone(&indexer);
            tokio::spawn(async move { indexer.accept_index_job(&signal).await })
        };
        tokio::task::yield_now().await;
        controller.abort();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_indexed_clocks() {
        let (db, _indexer) = open();
        let sync = EmbeddedIndexSyncStorage::new(db);
        let t = crate::storage::now();
        assert!(sync.get_doc_indexed_clock("a").await.unwrap().is_none());
        sync.set_doc_indexed_clock("a", t).await.unwrap();
        assert_eq!(sync.get_doc_indexed_clock("a").await.unwrap().unwrap().timestamp, t);
        sync.clear_doc_indexed_clock("a").await.unwrap();
        assert!(sync.get_doc_indexed_clock("a").await.unwrap().is_none());
    }
}
