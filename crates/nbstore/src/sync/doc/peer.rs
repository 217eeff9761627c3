use super::queue::{DocJobs, JobQueue, Priorities};
use super::{PeerStatus, StateBoard};
use crate::config::{RetryState, SyncConfig};
use crate::crdt;
use crate::error::{Result, StoreError};
use crate::events::Subscription;
use crate::signal::AbortSignal;
use crate::storage::{DocClock, DocRecord, DocStorage, DocSyncStorage, DocUpdate, Timestamp};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum Event {
    /// A local write made by someone other than this peer's loop
    Local(DocRecord),
    /// A remote write announced by the peer
    Remote(DocRecord),
}

pub(crate) struct DocSyncPeer {
    pub peer_id: String,
    /// Stamped on writes made by this loop, so its own echoes are ignored
    pub origin: String,
    pub local: Arc<dyn DocStorage>,
    pub remote: Arc<dyn DocStorage>,
    pub sync_storage: Arc<dyn DocSyncStorage>,
    pub priorities: Arc<Priorities>,
    pub board: Arc<StateBoard>,
    pub config: SyncConfig,
}

impl DocSyncPeer {
    fn update_state(&self, f: impl FnOnce(&mut super::PeerSyncState)) {
        self.board.send_modify(|peers| {
            f(peers.entry(self.peer_id.clone()).or_default());
        });
    }

    pub async fn run(self, signal: AbortSignal) {
        let retry = self.config.retry();
        let mut retry_state = RetryState::default();

        loop {
            match self.session(&signal, &mut retry_state).await {
                Err(e) if e.is_cancelled() || signal.is_aborted() => {
                    debug!("doc sync with {} cancelled", self.peer_id);
                    return;
                }
                Err(e) => {
                    let delay = retry_state.next_delay(&retry);
                    warn!(
                        "doc sync with {} failed (attempt {}), retrying in {:?}: {}",
                        self.peer_id, retry_state.attempts, delay, e
                    );
                    self.update_state(|s| {
                        s.status = PeerStatus::Retrying;
                        s.synced = false;
                        s.pending.clear();
                        s.error_message = Some(e.to_string());
                    });
                    if signal.sleep(delay).await.is_err() {
                        return;
                    }
                }
                // The connection dropped after a clean session; go again.
                Ok(()) => {}
            }
        }
    }

    async fn session(&self, signal: &AbortSignal, retry_state: &mut RetryState) -> Result<()> {
        self.update_state(|s| s.status = PeerStatus::Connecting);
        let timeout = self.config.connect_timeout();
        self.local
            .connection()
            .wait_for_connected_within(signal, timeout)
            .await?;
        self.remote
            .connection()
            .wait_for_connected_within(signal, timeout)
            .await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscriptions = self.subscribe(tx);

        let mut queue = JobQueue::default();
        self.plan(&mut queue).await?;
        retry_state.reset();
        self.update_state(|s| {
            s.status = PeerStatus::Syncing;
            s.error_message = None;
            s.pending = queue.doc_ids().cloned().collect();
            s.synced = queue.is_empty();
        });
        info!(
            "doc sync with {} connected, {} docs to reconcile",
            self.peer_id,
            queue.doc_ids().count()
        );

        loop {
            while let Ok(event) = rx.try_recv() {
                self.enqueue(&mut queue, event);
            }

            if let Some((doc_id, jobs)) = queue.pop(&self.priorities) {
                signal.throw_if_aborted()?;
                self.run_jobs(&doc_id, jobs).await?;
                let pending: BTreeSet<String> = queue.doc_ids().cloned().collect();
                self.update_state(|s| {
                    s.synced = pending.is_empty();
                    s.pending = pending;
                });
                continue;
            }

            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        self.enqueue(&mut queue, event);
                        let pending = queue.doc_ids().cloned().collect();
                        self.update_state(|s| {
                            s.synced = false;
                            s.pending = pending;
                        });
                    }
                    None => return Ok(()),
                },
                _ = self.remote.connection().wait_for_lost() => {
                    return Err(StoreError::Connection(format!("{}: connection lost", self.peer_id)));
                }
                _ = self.local.connection().wait_for_lost() => {
                    return Err(StoreError::Connection("local storage disconnected".into()));
                }
                _ = signal.aborted() => return Err(StoreError::Cancelled),
            }
        }
    }

    fn subscribe(&self, tx: mpsc::UnboundedSender<Event>) -> Subscription {
        let origin = self.origin.clone();
        let mut subscriptions = Vec::new();

        if !self.remote.readonly() {
            let local_tx = tx.clone();
            let own = origin.clone();
            subscriptions.push(self.local.subscribe_doc_update(Box::new(move |event| {
                if event.origin.as_deref() != Some(own.as_str()) {
                    let _ = local_tx.send(Event::Local(event.record.clone()));
                }
            })));
        }

        subscriptions.push(self.remote.subscribe_doc_update(Box::new(move |event| {
            if event.origin.as_deref() != Some(origin.as_str()) {
                let _ = tx.send(Event::Remote(event.record.clone()));
            }
        })));

        Subscription::merge(subscriptions)
    }

    fn enqueue(&self, queue: &mut JobQueue, event: Event) {
        match event {
            Event::Local(record) => queue.push(record),
            Event::Remote(record) => queue.pull(record),
        }
    }

    /// Queue a full reconcile for every doc whose clocks say it changed on
    /// either side since the last exchange.
    async fn plan(&self, queue: &mut JobQueue) -> Result<()> {
        let stored_remote = self.sync_storage.get_peer_remote_clocks(&self.peer_id).await?;
        let after = stored_remote.values().max().copied();
        let fresh = self.remote.get_doc_timestamps(after).await?;

        let mut remote_clocks = stored_remote;
        for (doc_id, timestamp) in fresh {
            self.sync_storage
                .set_peer_remote_clock(
                    &self.peer_id,
                    DocClock {
                        doc_id: doc_id.clone(),
                        timestamp,
                    },
                )
                .await?;
            let entry = remote_clocks.entry(doc_id).or_insert(timestamp);
            *entry = (*entry).max(timestamp);
        }

        let pulled = self
            .sync_storage
            .get_peer_pulled_remote_clocks(&self.peer_id)
            .await?;
        let mut pulls: Vec<(&String, &Timestamp)> = remote_clocks
            .iter()
            .filter(|(doc_id, ts)| pulled.get(*doc_id).is_none_or(|p| p < *ts))
            .collect();
        pulls.sort();
        for (doc_id, _) in pulls {
            queue.connect(doc_id);
        }

        if !self.remote.readonly() {
            let local_clocks = self.local.get_doc_timestamps(None).await?;
            let pushed = self.sync_storage.get_peer_pushed_clocks(&self.peer_id).await?;
            let mut pushes: Vec<(&String, &Timestamp)> = local_clocks
                .iter()
                .filter(|(doc_id, ts)| pushed.get(*doc_id).is_none_or(|p| p < *ts))
                .collect();
            pushes.sort();
            for (doc_id, _) in pushes {
                queue.connect(doc_id);
            }
        }
        Ok(())
    }

    /// Run the collected jobs of one doc. Per-doc failures are recorded and
    /// skipped; anything retryable ends the session.
    async fn run_jobs(&self, doc_id: &str, jobs: DocJobs) -> Result<()> {
        let result = if jobs.connect {
            self.connect_doc(doc_id).await
        } else {
            self.apply_jobs(doc_id, jobs).await
        };

        match result {
            Ok(()) => {
                self.update_state(|s| {
                    s.doc_errors.remove(doc_id);
                });
                Ok(())
            }
            Err(e) if e.is_retryable() || e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("doc sync with {}: skipping {}: {}", self.peer_id, doc_id, e);
                self.update_state(|s| {
                    s.doc_errors.insert(doc_id.to_string(), e.to_string());
                });
                Ok(())
            }
        }
    }

    /// Exchange diffs through state vectors, in both directions.
    async fn connect_doc(&self, doc_id: &str) -> Result<()> {
        let local = self.local.get_doc_diff(doc_id, None).await?;
        let local_state = local.as_ref().map(|d| d.state.clone());

        let remote = self
            .remote
            .get_doc_diff(doc_id, local_state.as_deref())
            .await?;

        if let Some(remote) = &remote {
            let behind = match &local_state {
                Some(state) => !crdt::state_includes(state, &remote.state)?,
                None => true,
            };
            if behind {
                self.apply_locally(doc_id, remote.missing.clone()).await?;
            }
            self.advance_pulled(doc_id, remote.timestamp).await?;
        }

        if self.remote.readonly() {
            return Ok(());
        }
        let Some(local) = local else {
            return Ok(());
        };

        let missing = match &remote {
            Some(remote) if crdt::state_includes(&remote.state, &local.state)? => None,
            Some(remote) => self
                .local
                .get_doc_diff(doc_id, Some(&remote.state))
                .await?
                .map(|d| d.missing),
            None => Some(local.missing),
        };
        if let Some(missing) = missing {
            self.push_remote(doc_id, missing).await?;
        }
        self.advance_pushed(doc_id, local.timestamp).await
    }

    /// Apply broadcasts, then forward local writes as one merged update.
    async fn apply_jobs(&self, doc_id: &str, jobs: DocJobs) -> Result<()> {
        for pull in jobs.pulls {
            self.sync_storage
                .set_peer_remote_clock(
                    &self.peer_id,
                    DocClock {
                        doc_id: doc_id.to_string(),
                        timestamp: pull.timestamp,
                    },
                )
                .await?;
            match self.apply_locally(doc_id, pull.bin).await {
                Ok(()) => self.advance_pulled(doc_id, pull.timestamp).await?,
                Err(StoreError::Integrity(reason)) => {
                    // Fall back to a state-vector exchange for this doc.
                    warn!("broadcast for {} unusable ({}), reconciling", doc_id, reason);
                    return self.connect_doc(doc_id).await;
                }
                Err(e) => return Err(e),
            }
        }

        if jobs.pushes.is_empty() || self.remote.readonly() {
            return Ok(());
        }
        let latest = jobs.pushes.iter().map(|p| p.timestamp).max();
        let bins: Vec<Vec<u8>> = jobs.pushes.into_iter().map(|p| p.bin).collect();
        let merged = crdt::merge_updates(&bins)?;
        self.push_remote(doc_id, merged).await?;
        if let Some(latest) = latest {
            self.advance_pushed(doc_id, latest).await?;
        }
        Ok(())
    }

    async fn apply_locally(&self, doc_id: &str, bin: Vec<u8>) -> Result<()> {
        self.local
            .push_doc_update(DocUpdate::new(doc_id, bin), Some(&self.origin))
            .await?;
        debug!("applied {} from {}", doc_id, self.peer_id);
        Ok(())
    }

    async fn push_remote(&self, doc_id: &str, bin: Vec<u8>) -> Result<()> {
        let clock = self
            .remote
            .push_doc_update(DocUpdate::new(doc_id, bin), Some(&self.origin))
            .await?;
        debug!("pushed {} to {} at {}", doc_id, self.peer_id, clock.timestamp);
        Ok(())
    }

    async fn advance_pulled(&self, doc_id: &str, timestamp: Timestamp) -> Result<()> {
        let clock = DocClock {
            doc_id: doc_id.to_string(),
            timestamp,
        };
        self.sync_storage
            .set_peer_remote_clock(&self.peer_id, clock.clone())
            .await?;
        self.sync_storage
            .set_peer_pulled_remote_clock(&self.peer_id, clock)
            .await
    }

    async fn advance_pushed(&self, doc_id: &str, timestamp: Timestamp) -> Result<()> {
        self.sync_storage
            .set_peer_pushed_clock(
                &self.peer_id,
                DocClock {
                    doc_id: doc_id.to_string(),
                    timestamp,
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::crdt::testing::{body_text, text_update};
    use crate::impls::{EmbeddedDb, EmbeddedOptions};
    use crate::signal::AbortController;
    use crate::storage::SpaceStorage;
    use crate::sync::DocSync;
    use std::time::Duration;

    fn space(name: &str) -> (Arc<EmbeddedDb>, SpaceStorage) {
        let db = EmbeddedDb::open(EmbeddedOptions::in_memory(name)).unwrap();
        let space = db.space("ws");
        space.connect();
        (db, space)
    }

    fn engine(local: &SpaceStorage, remotes: Vec<(&str, &SpaceStorage)>) -> DocSync {
        DocSync::new(
            Arc::clone(local.doc.as_ref().unwrap()),
            Arc::clone(local.doc_sync.as_ref().unwrap()),
            remotes
                .into_iter()
                .map(|(id, s)| (id.to_string(), Arc::clone(s.doc.as_ref().unwrap())))
                .collect(),
            SyncConfig::default(),
        )
    }

    async fn synced(sync: &DocSync) {
        tokio::time::timeout(Duration::from_secs(10), sync.wait_for_synced(&AbortSignal::never()))
            .await
            .expect("sync timed out")
            .unwrap();
    }

    #[tokio::test]
    async fn test_live_local_write_reaches_remote() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let sync = engine(&local, vec![("cloud", &remote)]);
        sync.start();
        synced(&sync).await;

        let local_doc = local.doc.as_ref().unwrap();
        local_doc
            .push_doc_update(DocUpdate::new("d1", text_update(1, "live")), None)
            .await
            .unwrap();

        let remote_doc = Arc::clone(remote.doc.as_ref().unwrap());
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(record) = remote_doc.get_doc("d1").await.unwrap() {
                    if body_text(&record.bin) == "live" {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_readonly_remote_is_only_pulled() {
        let (_l, local) = space("local");
        let remote_db = EmbeddedDb::open(EmbeddedOptions::in_memory("remote")).unwrap();
        let remote_doc: Arc<dyn DocStorage> = Arc::new(
            crate::storage::DocStore::new(
                "ws",
                crate::impls::embedded::EmbeddedDocBackend::new(Arc::clone(&remote_db)),
                Arc::clone(remote_db.connection()),
            )
            .readonly(true),
        );
        remote_db.connection().connect();

        // Seed the readonly remote through its backend-sharing writable twin.
        let writable = remote_db.space("ws");
        writable
            .doc
            .as_ref()
            .unwrap()
            .push_doc_update(DocUpdate::new("shared", text_update(7, "from server")), None)
            .await
            .unwrap();
        local
            .doc
            .as_ref()
            .unwrap()
            .push_doc_update(DocUpdate::new("mine", text_update(1, "local only")), None)
            .await
            .unwrap();

        let sync = DocSync::new(
            Arc::clone(local.doc.as_ref().unwrap()),
            Arc::clone(local.doc_sync.as_ref().unwrap()),
            vec![("ro".to_string(), remote_doc)],
            SyncConfig::default(),
        );
        sync.start();
        synced(&sync).await;

        let pulled = local.doc.as_ref().unwrap().get_doc("shared").await.unwrap().unwrap();
        assert_eq!(body_text(&pulled.bin), "from server");
        assert!(writable.doc.as_ref().unwrap().get_doc("mine").await.unwrap().is_none());
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_existing_remote_doc_is_pulled_on_start() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let remote_doc = remote.doc.as_ref().unwrap();
        remote_doc
            .push_doc_update(DocUpdate::new("good", text_update(2, "fine")), None)
            .await
            .unwrap();

        let sync = engine(&local, vec![("cloud", &remote)]);
        sync.start();
        synced(&sync).await;
        assert!(sync.state().error_message.is_none());
        assert!(local.doc.as_ref().unwrap().get_doc("good").await.unwrap().is_some());
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_priority_doc_is_pulled_first() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        let remote_doc = remote.doc.as_ref().unwrap();
        for i in 0..20 {
            remote_doc
                .push_doc_update(DocUpdate::new(format!("d{i:02}"), text_update(2, "seed")), None)
                .await
                .unwrap();
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let _sub = local.doc.as_ref().unwrap().subscribe_doc_update(Box::new(move |event| {
            seen.lock().unwrap().push(event.record.doc_id.clone());
        }));

        let sync = engine(&local, vec![("cloud", &remote)]);
        let guard = sync.add_priority("d17", 10);
        let stacked = sync.add_priority("d17", 5);
        assert_eq!(sync.priorities.get("d17"), 15);

        sync.start();
        synced(&sync).await;
        let order = order.lock().unwrap().clone();
        assert_eq!(order.len(), 20);
        assert_eq!(order[0], "d17");
        assert_eq!(order[1], "d00");

        drop(stacked);
        assert_eq!(sync.priorities.get("d17"), 10);
        drop(guard);
        assert_eq!(sync.priorities.get("d17"), 0);
        sync.stop().await;
    }

    #[tokio::test]
    async fn test_reset_sync_clears_clocks_and_resyncs() {
        let (_l, local) = space("local");
        let (_r, remote) = space("remote");
        remote
            .doc
            .as_ref()
            .unwrap()
            .push_doc_update(DocUpdate::new("d1", text_update(2, "remote")), None)
            .await
            .unwrap();
        let clocks = Arc::clone(local.doc_sync.as_ref().unwrap());

        let sync = engine(&local, vec![("cloud", &remote)]);
        sync.start();
        synced(&sync).await;
        assert!(clocks.get_peer_pulled_remote_clocks("cloud").await.unwrap().contains_key("d1"));

        sync.reset_sync().await.unwrap();
        assert!(sync.is_running());
        synced(&sync).await;
        assert!(clocks.get_peer_pulled_remote_clocks("cloud").await.unwrap().contains_key("d1"));
        sync.stop().await;

        // Stopped engines stay stopped, with nothing remembered.
        sync.reset_sync().await.unwrap();
        assert!(!sync.is_running());
        assert!(clocks.get_peer_remote_clocks("cloud").await.unwrap().is_empty());
        assert!(clocks.get_peer_pulled_remote_clocks("cloud").await.unwrap().is_empty());
        assert!(clocks.get_peer_pushed_clocks("cloud").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peer_retries_with_error_state() {
        struct Refusing;
        #[async_trait::async_trait]
        impl crate::connection::Connector for Refusing {
            async fn do_connect(&self, _r: crate::connection::StatusReporter) -> Result<()> {
                Err(StoreError::Connection("refused".into()))
            }
            async fn do_disconnect(&self) {}
        }

        let (_l, local) = space("local");
        let remote_db = EmbeddedDb::open(EmbeddedOptions::in_memory("remote")).unwrap();
        let refusing = Connection::new("refusing", Arc::new(Refusing));
        refusing.connect();
        let remote_doc: Arc<dyn DocStorage> = Arc::new(crate::storage::DocStore::new(
            "ws",
            crate::impls::embedded::EmbeddedDocBackend::new(remote_db),
            refusing,
        ));

        let mut config = SyncConfig::default();
        config.connect_timeout_ms = 50;
        config.retry_initial_delay_ms = 10;
        config.retry_max_delay_ms = 20;
        let sync = DocSync::new(
            Arc::clone(local.doc.as_ref().unwrap()),
            Arc::clone(local.doc_sync.as_ref().unwrap()),
            vec![("down".to_string(), remote_doc)],
            config,
        );
        sync.start();

        let mut rx = sync.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|peers| peers.get("down").is_some_and(|p| p.status == PeerStatus::Retrying)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(sync.state().retrying);
        assert!(!sync.doc_state("d1").synced);

        let controller = AbortController::new();
        controller.abort();
        assert!(sync.wait_for_synced(&controller.signal()).await.is_err());
        assert!(sync.stop().await);
        assert!(!sync.stop().await);
    }
}
