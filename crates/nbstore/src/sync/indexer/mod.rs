//! Index sync engine.
//!
//! Keeps the search index derived from local docs. Local writes enqueue an
//! index job per accepted doc; a single loop accepts jobs from the indexer
//! queue, re-derives the doc's index documents and completes the job. The
//! root doc (id equal to the space id) carries the page listing and drives
//! the `doc` table, including deletions.

mod crawler;
mod reactive;

pub use reactive::QueryStream;

use crate::config::{RetryState, SyncConfig};
use crate::error::Result;
use crate::events::Subscription;
use crate::signal::{AbortController, AbortSignal};
use crate::storage::{
    AggregateOptions, AggregateResult, BLOCK_TABLE, DOC_PREVIEW_TABLE, DOC_TABLE, DocStorage,
    IndexJob, IndexerStorage, IndexerSyncStorage, Query, SearchOptions, SearchResult, Timestamp,
};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Decides which docs are worth indexing.
pub trait IndexPolicy: Send + std::marker::Sync {
    fn accepts(&self, doc_id: &str) -> bool;
}

/// Rejects doc ids starting with any of the prefixes.
#[derive(Debug, Clone)]
pub struct PrefixPolicy {
    rejected: Vec<String>,
}

impl PrefixPolicy {
    pub fn new(rejected: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            rejected: rejected.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for PrefixPolicy {
    /// Database and user-data docs hold no readable content.
    fn default() -> Self {
        Self::new(["db$", "userdata$"])
    }
}

impl IndexPolicy for PrefixPolicy {
    fn accepts(&self, doc_id: &str) -> bool {
        !self.rejected.iter().any(|prefix| doc_id.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSyncState {
    /// Docs queued or being indexed
    pub remaining: usize,
    pub indexing: bool,
    pub error_message: Option<String>,
}

struct Running {
    controller: AbortController,
    task: JoinHandle<()>,
}

struct Inner {
    local: Arc<dyn DocStorage>,
    indexer: Arc<dyn IndexerStorage>,
    index_sync: Option<Arc<dyn IndexerSyncStorage>>,
    policy: Arc<dyn IndexPolicy>,
    config: SyncConfig,
    state: watch::Sender<IndexSyncState>,
    /// Last local write; the loop pauses while the editor is busy
    last_write: Arc<Mutex<Option<Instant>>>,
}

pub struct IndexSync {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl IndexSync {
    pub fn new(
        local: Arc<dyn DocStorage>,
        indexer: Arc<dyn IndexerStorage>,
        index_sync: Option<Arc<dyn IndexerSyncStorage>>,
        config: SyncConfig,
    ) -> Self {
        let (state, _) = watch::channel(IndexSyncState::default());
        Self {
            inner: Arc::new(Inner {
                local,
                indexer,
                index_sync,
                policy: Arc::new(PrefixPolicy::default()),
                config,
                state,
                last_write: Arc::new(Mutex::new(None)),
            }),
            running: Mutex::new(None),
        }
    }

    /// Replace the default policy. Only valid before `start`.
    pub fn with_policy(self, policy: Arc<dyn IndexPolicy>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.policy = policy;
                Self {
                    inner: Arc::new(inner),
                    running: self.running,
                }
            }
            Err(inner) => {
                warn!("index policy replaced after start; keeping the current one");
                Self {
                    inner,
                    running: self.running,
                }
            }
        }
    }

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
        // The previous loop winds down at its next cancellation point; its
        // current job still completes.
        if let Some(previous) = previous {
            previous.controller.abort();
        }
    }

    /// Signal the loop and wait for it to finish the job in hand.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(running) = running else {
            return false;
        };
        running.controller.abort();
        if let Err(e) = running.task.await {
            warn!("index sync task ended abnormally: {}", e);
        }
        self.inner.state.send_modify(|s| s.indexing = false);
        true
    }

    /// Enqueue every local doc the policy accepts. Returns how many were
    /// enqueued; docs already pending are coalesced by the queue.
    pub async fn full_index(&self) -> Result<usize> {
        self.inner.full_index().await
    }

    pub fn state(&self) -> IndexSyncState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<IndexSyncState> {
        self.inner.state.subscribe()
    }

    /// Resolve once the job queue has drained.
    pub async fn wait_for_completed(&self, signal: &AbortSignal) -> Result<()> {
        loop {
            let mut rx = self.inner.state.subscribe();
            if self.inner.indexer.index_job_count().await? == 0 {
                return Ok(());
            }
            if signal.run(rx.changed()).await?.is_err() {
                return Ok(());
            }
        }
    }

    pub async fn search(&self, table: &str, query: &Query, options: &SearchOptions) -> Result<SearchResult> {
        self.inner.indexer.search(table, query, options).await
    }

    pub async fn aggregate(
        &self,
        table: &str,
        query: &Query,
        field: &str,
        options: &AggregateOptions,
    ) -> Result<AggregateResult> {
        self.inner.indexer.aggregate(table, query, field, options).await
    }

    /// Search now and again after every update of `table`.
    pub fn search_stream(&self, table: &str, query: Query, options: SearchOptions) -> QueryStream<SearchResult> {
        let table_name = table.to_string();
        reactive::watch_query(
            Arc::clone(&self.inner.indexer),
            table,
            &self.inner.config,
            move |indexer| {
                let (table, query, options) = (table_name.clone(), query.clone(), options.clone());
                async move { indexer.search(&table, &query, &options).await }.boxed()
            },
        )
    }

    pub fn aggregate_stream(
        &self,
        table: &str,
        query: Query,
        field: &str,
        options: AggregateOptions,
    ) -> QueryStream<AggregateResult> {
        let table_name = table.to_string();
        let field = field.to_string();
        reactive::watch_query(
            Arc::clone(&self.inner.indexer),
            table,
            &self.inner.config,
            move |indexer| {
                let (table, query, field, options) =
                    (table_name.clone(), query.clone(), field.clone(), options.clone());
                async move { indexer.aggregate(&table, &query, &field, &options).await }.boxed()
            },
        )
    }
}

/// An accepted job that must be completed even when the loop is dropped
/// mid-job, or its doc stays in flight and is never accepted again.
struct JobGuard {
    indexer: Arc<dyn IndexerStorage>,
    job: IndexJob,
    armed: bool,
}

impl JobGuard {
    fn new(indexer: Arc<dyn IndexerStorage>, job: IndexJob) -> Self {
        Self {
            indexer,
            job,
            armed: true,
        }
    }

    fn job(&self) -> &IndexJob {
        &self.job
    }

    fn doc_id(&self) -> &str {
        &self.job.doc_id
    }

    async fn complete(mut self) -> Result<()> {
        self.armed = false;
        self.indexer.complete_index_job(self.job.clone()).await
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let indexer = Arc::clone(&self.indexer);
        let job = self.job.clone();
        handle.spawn(async move {
            if let Err(e) = indexer.complete_index_job(job).await {
                warn!("failed to release interrupted index job: {}", e);
            }
        });
    }
}

impl Inner {
    fn space_id(&self) -> &str {
        self.local.space_id()
    }

    async fn full_index(&self) -> Result<usize> {
        let clocks = self.local.get_doc_timestamps(None).await?;
        let mut doc_ids: Vec<&String> = clocks.keys().filter(|id| self.policy.accepts(id)).collect();
        doc_ids.sort();
        for doc_id in &doc_ids {
            self.indexer.enqueue_index_job(doc_id).await?;
        }
        self.refresh_remaining().await?;
        info!("full index enqueued {} docs", doc_ids.len());
        Ok(doc_ids.len())
    }

    async fn refresh_remaining(&self) -> Result<()> {
        let remaining = self.indexer.index_job_count().await?;
        self.state.send_if_modified(|s| {
            let changed = s.remaining != remaining;
            s.remaining = remaining;
            changed
        });
        Ok(())
    }

    /// Forward local writes as index jobs. The callback cannot await, so
    /// enqueues go through a channel drained by a helper task.
    fn subscribe_local(&self) -> Subscription {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let policy = Arc::clone(&self.policy);
        let last_write = Arc::clone(&self.last_write);
        let subscription = self.local.subscribe_doc_update(Box::new(move |event| {
            let doc_id = &event.record.doc_id;
            if policy.accepts(doc_id) {
                *last_write.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
                let _ = tx.send(doc_id.clone());
            }
        }));

        let indexer = Arc::clone(&self.indexer);
        let forwarder = tokio::spawn(async move {
            while let Some(doc_id) = rx.recv().await {
                if let Err(e) = indexer.enqueue_index_job(&doc_id).await {
                    warn!("failed to enqueue index job for {}: {}", doc_id, e);
                }
            }
        });
        Subscription::merge(vec![subscription, Subscription::new(move || forwarder.abort())])
    }

    async fn run(&self, signal: AbortSignal) {
        if self.indexer.readonly() {
            debug!("indexer is readonly; index sync idle");
            return;
        }
        let retry = self.config.retry();
        let mut retry_state = RetryState::default();
        loop {
            match self.session(&signal, &mut retry_state).await {
                Err(e) if e.is_cancelled() || signal.is_aborted() => {
                    debug!("index sync cancelled");
                    return;
                }
                Err(e) => {
                    let delay = retry_state.next_delay(&retry);
                    warn!("index sync failed, retrying in {:?}: {}", delay, e);
                    self.state.send_modify(|s| {
                        s.indexing = false;
                        s.error_message = Some(e.to_string());
                    });
                    if signal.sleep(delay).await.is_err() {
                        return;
                    }
                }
                Ok(()) => {}
            }
        }
    }

    async fn session(&self, signal: &AbortSignal, retry_state: &mut RetryState) -> Result<()> {
        let timeout = self.config.connect_timeout();
        self.local
            .connection()
            .wait_for_connected_within(signal, timeout)
            .await?;
        self.indexer
            .connection()
            .wait_for_connected_within(signal, timeout)
            .await?;

        let _subscription = self.subscribe_local();
        if self.config.full_index_on_start {
            self.full_index().await?;
        }
        retry_state.reset();
        self.state.send_modify(|s| s.error_message = None);

        loop {
            let job = self.indexer.accept_index_job(signal).await?;
            let guard = JobGuard::new(Arc::clone(&self.indexer), job);
            self.state.send_modify(|s| s.indexing = true);

            let doc_id = guard.doc_id().to_string();
            let outcome = self.index_job(guard.job()).await;
            guard.complete().await?;
            match outcome {
                Ok(()) => {}
                Err(e) if e.is_retryable() || e.is_cancelled() => return Err(e),
                Err(e) => error!("failed to index {}: {}", doc_id, e),
            }

            self.refresh_remaining().await?;
            self.state.send_if_modified(|s| {
                let idle = s.remaining == 0;
                let changed = s.indexing == idle;
                s.indexing = !idle;
                changed
            });
            self.idle_pause(signal).await?;
        }
    }

    /// Yield between jobs; while local writes keep arriving wait for a
    /// quiet period, but never longer than the configured bound.
    async fn idle_pause(&self, signal: &AbortSignal) -> Result<()> {
        tokio::task::yield_now().await;
        let bound = self.config.index_idle_yield();
        let last_write = *self.last_write.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last_write) = last_write {
            let quiet_for = last_write.elapsed();
            if quiet_for < bound {
                signal.sleep(bound - quiet_for).await?;
            }
        }
        signal.throw_if_aborted()
    }

    async fn index_job(&self, job: &IndexJob) -> Result<()> {
        if job.doc_id == self.space_id() {
            return self.index_root().await;
        }
        self.index_doc(&job.doc_id).await
    }

    async fn indexed_is_current(&self, doc_id: &str) -> Result<bool> {
        let Some(index_sync) = &self.index_sync else {
            return Ok(false);
        };
        let Some(indexed) = index_sync.get_doc_indexed_clock(doc_id).await? else {
            return Ok(false);
        };
        Ok(self
            .local
            .get_doc_timestamp(doc_id)
            .await?
            .is_some_and(|clock| clock.timestamp <= indexed.timestamp))
    }

    async fn mark_indexed(&self, doc_id: &str, timestamp: Timestamp) -> Result<()> {
        if let Some(index_sync) = &self.index_sync {
            index_sync.set_doc_indexed_clock(doc_id, timestamp).await?;
        }
        Ok(())
    }

    async fn index_root(&self) -> Result<()> {
        let space_id = self.space_id().to_string();
        let Some(root) = self.local.get_doc(&space_id).await? else {
            return Ok(());
        };
        let indexed = self.indexer.all_ids(DOC_TABLE).await?;
        let crawl = crawler::crawl_root(&root.bin, &indexed)?;

        for deleted in &crawl.deleted {
            self.indexer
                .delete_by_query(BLOCK_TABLE, &Query::match_field("docId", deleted.as_str()))
                .await?;
            if let Some(index_sync) = &self.index_sync {
                index_sync.clear_doc_indexed_clock(deleted).await?;
            }
        }
        debug!(
            "root crawl: {} docs listed, {} removed",
            crawl.docs.len(),
            crawl.deleted.len()
        );
        self.indexer.write(DOC_TABLE, crawl.docs, crawl.deleted).await?;
        self.mark_indexed(&space_id, root.timestamp).await
    }

    async fn index_doc(&self, doc_id: &str) -> Result<()> {
        if self.indexed_is_current(doc_id).await? {
            debug!("index for {} is current", doc_id);
            return Ok(());
        }
        let Some(doc) = self.local.get_doc(doc_id).await? else {
            return Ok(());
        };
        let crawl = crawler::crawl_doc(doc_id, &doc.bin)?;

        self.indexer
            .delete_by_query(BLOCK_TABLE, &Query::match_field("docId", doc_id))
            .await?;
        if let Some(preview) = crawl.preview {
            self.indexer.write(DOC_PREVIEW_TABLE, vec![preview], vec![]).await?;
        }
        let blocks = crawl.blocks.len();
        self.indexer.write(BLOCK_TABLE, crawl.blocks, vec![]).await?;
        self.mark_indexed(doc_id, doc.timestamp).await?;
        debug!("indexed {} ({} blocks)", doc_id, blocks);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::crawler::fixtures::{page_doc, retitle};
    use super::*;
    use crate::impls::{EmbeddedDb, EmbeddedOptions};
    use crate::storage::{DocUpdate, SpaceStorage};
    use futures::StreamExt;
    use std::time::Duration;

    fn space() -> (Arc<EmbeddedDb>, SpaceStorage) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory("index")).unwrap();
        let space = db.space("ws");
        space.connect();
        (db, space)
    }

    fn engine(space: &SpaceStorage, config: SyncConfig) -> IndexSync {
        IndexSync::new(
            Arc::clone(space.doc.as_ref().unwrap()),
            Arc::clone(space.indexer.as_ref().unwrap()),
            space.index_sync.clone(),
            config,
        )
    }

    fn fast() -> SyncConfig {
        SyncConfig {
            index_idle_yield_ms: 1,
            search_throttle_ms: 50,
            ..SyncConfig::default()
        }
    }

    #[test]
    fn test_default_policy_skips_database_docs() {
        let policy = PrefixPolicy::default();
        assert!(policy.accepts("ws"));
        assert!(policy.accepts("page-1"));
        assert!(!policy.accepts("db$ws$docProperties"));
        assert!(!policy.accepts("userdata$u1$favorites"));
    }

    #[tokio::test]
    async fn test_full_index_enqueues_accepted_docs() {
        let (_db, space) = space();
        let doc = space.doc.as_ref().unwrap();
        for id in ["a", "b", "db$meta"] {
            doc.push_doc_update(DocUpdate::new(id, page_doc(id, &[])), None)
                .await
                .unwrap();
        }
        let sync = engine(&space, fast());
        assert_eq!(sync.full_index().await.unwrap(), 2);
        assert_eq!(sync.state().remaining, 2);
    }

    #[tokio::test]
    async fn test_doc_is_indexed_and_reindexed_on_write() {
        let (_db, space) = space();
        let doc = Arc::clone(space.doc.as_ref().unwrap());
        let original = page_doc("Plans", &["buy milk"]);
        doc.push_doc_update(DocUpdate::new("d1", original.clone()), None)
            .await
            .unwrap();

        let sync = engine(&space, fast());
        sync.full_index().await.unwrap();
        sync.start();
        let signal = AbortSignal::never();
        tokio::time::timeout(Duration::from_secs(5), sync.wait_for_completed(&signal))
            .await
            .unwrap()
            .unwrap();

        let hits = sync
            .search(BLOCK_TABLE, &Query::contains("content", "milk"), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.nodes.len(), 1);
        assert_eq!(hits.nodes[0].id, "d1:p0");

        let mut stream = sync.search_stream(
            DOC_PREVIEW_TABLE,
            Query::match_field("docId", "d1"),
            SearchOptions {
                fields: vec!["title".into()],
                ..SearchOptions::default()
            },
        );
        let first = stream.next().await.unwrap();
        assert_eq!(first.nodes[0].fields["title"], ["Plans"]);

        doc.push_doc_update(DocUpdate::new("d1", retitle(&original, "Renamed")), None)
            .await
            .unwrap();
        let renamed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let result = StreamExt::next(&mut stream).await.unwrap();
                if result.nodes.first().is_some_and(|n| n.fields["title"] != ["Plans"]) {
                    return result;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(renamed.nodes[0].fields["title"], ["Renamed"]);
        assert!(sync.stop().await);
    }

    #[tokio::test]
    async fn test_current_index_is_skipped() {
        let (_db, space) = space();
        let doc = space.doc.as_ref().unwrap();
        let clock = doc
            .push_doc_update(DocUpdate::new("d1", page_doc("T", &["x"])), None)
            .await
            .unwrap();
        space
            .index_sync
            .as_ref()
            .unwrap()
            .set_doc_indexed_clock("d1", clock.timestamp)
            .await
            .unwrap();

        let sync = engine(&space, fast());
        sync.inner.index_doc("d1").await.unwrap();
        assert!(space.indexer.as_ref().unwrap().all_ids(BLOCK_TABLE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_restart_never_strand_jobs() {
        let (_db, space) = space();
        let doc = space.doc.as_ref().unwrap();
        for i in 0..40 {
            let id = format!("page-{}", i);
            doc.push_doc_update(DocUpdate::new(&id, page_doc(&id, &["some text", "more"])), None)
                .await
                .unwrap();
        }

        let sync = engine(&space, fast());
        sync.full_index().await.unwrap();
        for round in 0..10u64 {
            sync.start();
            tokio::time::sleep(Duration::from_millis(round % 3)).await;
            assert!(sync.stop().await);
        }

        sync.start();
        tokio::time::timeout(
            Duration::from_secs(10),
            sync.wait_for_completed(&AbortSignal::never()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(space.indexer.as_ref().unwrap().index_job_count().await.unwrap(), 0);
        assert!(sync.stop().await);
    }

    #[tokio::test]
    async fn test_restart_while_running_keeps_queue_moving() {
        let (_db, space) = space();
        let doc = space.doc.as_ref().unwrap();
        for i in 0..20 {
            let id = format!("page-{}", i);
            doc.push_doc_update(DocUpdate::new(&id, page_doc(&id, &["body"])), None)
                .await
                .unwrap();
        }

        let sync = engine(&space, fast());
        sync.full_index().await.unwrap();
        for _ in 0..5 {
            sync.start();
            tokio::task::yield_now().await;
        }
        tokio::time::timeout(
            Duration::from_secs(10),
            sync.wait_for_completed(&AbortSignal::never()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(sync.stop().await);
    }

    #[tokio::test]
    async fn test_custom_policy_replaces_default() {
        let (_db, space) = space();
        let sync = engine(&space, fast()).with_policy(Arc::new(PrefixPolicy::new(["skip$"])));
        assert!(sync.inner.policy.accepts("db$x"));
        assert!(!sync.inner.policy.accepts("skip$x"));
    }
}
