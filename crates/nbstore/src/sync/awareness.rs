//! Awareness fan-out. Presence is ephemeral: every backend gets each
//! update once, nothing is persisted and nothing is retried.

use crate::error::Result;
use crate::events::Subscription;
use crate::storage::{AwarenessRecord, AwarenessStorage};
use std::sync::Arc;
use tracing::warn;

pub type SharedAwarenessCallback = Arc<dyn Fn(&AwarenessRecord, Option<&str>) + Send + Sync>;

pub struct AwarenessSync {
    local: Arc<dyn AwarenessStorage>,
    peers: Vec<(String, Arc<dyn AwarenessStorage>)>,
}

impl AwarenessSync {
    pub fn new(local: Arc<dyn AwarenessStorage>, peers: Vec<(String, Arc<dyn AwarenessStorage>)>) -> Self {
        Self { local, peers }
    }

    fn all(&self) -> impl Iterator<Item = (&str, &Arc<dyn AwarenessStorage>)> {
        std::iter::once(("local", &self.local)).chain(self.peers.iter().map(|(id, s)| (id.as_str(), s)))
    }

    /// Publish to the local backend, then to every peer. Peer failures are
    /// logged; only a local failure is returned.
    pub async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()> {
        self.local.update(record.clone(), origin).await?;
        for (peer, storage) in &self.peers {
            if let Err(e) = storage.update(record.clone(), origin).await {
                warn!("awareness update for {} to {} failed: {}", record.doc_id, peer, e);
            }
        }
        Ok(())
    }

    /// Deliver every backend's cached record for `doc_id`, then every update
    /// any backend sees, until the subscription drops.
    pub fn subscribe_update(&self, doc_id: &str, callback: SharedAwarenessCallback) -> Subscription {
        let subscriptions = self
            .all()
            .map(|(_, storage)| {
                let callback = Arc::clone(&callback);
                storage.subscribe_update(doc_id, Box::new(move |record, origin| callback(record, origin)))
            })
            .collect();
        Subscription::merge(subscriptions)
    }

    /// Current cached record from each backend that has one.
    pub fn collect(&self, doc_id: &str) -> Vec<(String, AwarenessRecord)> {
        self.all()
            .filter_map(|(id, storage)| storage.latest(doc_id).map(|record| (id.to_string(), record)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ReadyConnector};
    use crate::impls::MemoryAwarenessStorage;
    use std::sync::Mutex;

    fn storage(name: &str) -> Arc<dyn AwarenessStorage> {
        Arc::new(MemoryAwarenessStorage::new(Connection::new(name, Arc::new(ReadyConnector))))
    }

    fn record(doc_id: &str, bin: &[u8]) -> AwarenessRecord {
        AwarenessRecord {
            doc_id: doc_id.into(),
            bin: bin.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_update_reaches_every_backend() {
        let local = storage("local");
        let cloud = storage("cloud");
        let sync = AwarenessSync::new(Arc::clone(&local), vec![("cloud".into(), Arc::clone(&cloud))]);

        sync.update(record("d1", b"cursor"), Some("editor")).await.unwrap();
        assert_eq!(local.latest("d1").unwrap().bin, b"cursor");
        assert_eq!(cloud.latest("d1").unwrap().bin, b"cursor");

        let collected = sync.collect("d1");
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].0, "local");
        assert!(sync.collect("d2").is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_sees_cached_then_live() {
        let local = storage("local");
        let cloud = storage("cloud");
        cloud.update(record("d1", b"remote user"), None).await.unwrap();
        let sync = AwarenessSync::new(local, vec![("cloud".into(), Arc::clone(&cloud))]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = sync.subscribe_update(
            "d1",
            Arc::new(move |record, origin| {
                sink.lock()
                    .unwrap()
                    .push((record.bin.clone(), origin.map(str::to_string)));
            }),
        );
        assert_eq!(seen.lock().unwrap().len(), 1);

        cloud.update(record("d1", b"moved"), Some("remote")).await.unwrap();
        assert_eq!(
            seen.lock().unwrap().last().cloned(),
            Some((b"moved".to_vec(), Some("remote".to_string())))
        );

        drop(subscription);
        cloud.update(record("d1", b"ignored"), None).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
