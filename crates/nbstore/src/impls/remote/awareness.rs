use super::RemoteSpace;
use crate::connection::Connection;
use crate::error::Result;
use crate::events::Subscription;
use crate::impls::awareness::MemoryAwarenessStorage;
use crate::protocol::{Request, ServerEvent, WireAwareness};
use crate::storage::{
    AwarenessCallback, AwarenessRecord, AwarenessStorage, Storage, StorageType,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Origin attached to records that arrived from other clients.
pub const REMOTE_ORIGIN: &str = "remote";

pub struct RemoteAwarenessStorage {
    space: Arc<RemoteSpace>,
    cache: Arc<MemoryAwarenessStorage>,
    _broadcasts: Subscription,
}

impl RemoteAwarenessStorage {
    pub fn new(space: Arc<RemoteSpace>) -> Self {
        let cache = Arc::new(MemoryAwarenessStorage::new(Arc::clone(space.connection())));
        let sink = Arc::clone(&cache);
        let broadcasts = space.client().events().subscribe(move |event| {
            if let ServerEvent::BroadcastAwarenessUpdate {
                doc_id,
                awareness_update,
                ..
            } = event
            {
                sink.publish(
                    AwarenessRecord {
                        doc_id: doc_id.clone(),
                        bin: awareness_update.clone(),
                    },
                    Some(REMOTE_ORIGIN),
                );
            }
        });
        Self {
            space,
            cache,
            _broadcasts: broadcasts,
        }
    }
}

impl Storage for RemoteAwarenessStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Awareness
    }

    fn connection(&self) -> &Arc<Connection> {
        self.space.connection()
    }
}

#[async_trait]
impl AwarenessStorage for RemoteAwarenessStorage {
    async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()> {
        let options = self.space.options();
        self.space
            .request::<serde_json::Value>(Request::UpdateAwareness {
                space_type: options.space_type,
                space_id: options.space_id.clone(),
                doc_id: record.doc_id.clone(),
                awareness_update: record.bin.clone(),
            })
            .await?;
        self.cache.publish(record, origin);
        Ok(())
    }

    /// Also asks the server for the other clients' current state, which
    /// arrives through the same callback.
    fn subscribe_update(&self, doc_id: &str, callback: AwarenessCallback) -> Subscription {
        let subscription = self.cache.subscribe_update(doc_id, callback);

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let space = Arc::clone(&self.space);
            let cache = Arc::clone(&self.cache);
            let doc_id = doc_id.to_string();
            runtime.spawn(async move {
                let options = space.options();
                let loaded: Result<Vec<WireAwareness>> = space
                    .request(Request::LoadAwarenesses {
                        space_type: options.space_type,
                        space_id: options.space_id.clone(),
                        doc_id: doc_id.clone(),
                    })
                    .await;
                match loaded {
                    Ok(records) => {
                        for record in records {
                            cache.publish(
                                AwarenessRecord {
                                    doc_id: doc_id.clone(),
                                    bin: record.awareness_update,
                                },
                                Some(REMOTE_ORIGIN),
                            );
                        }
                    }
                    Err(e) => debug!("could not load awareness for {}: {}", doc_id, e),
                }
            });
        }
        subscription
    }

    fn latest(&self, doc_id: &str) -> Option<AwarenessRecord> {
        self.cache.latest(doc_id)
    }
}
