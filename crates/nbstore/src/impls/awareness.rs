//! In-process awareness storage. Local backends use it directly; the
//! remote backend uses it as its cache of the latest record per doc.

use crate::connection::Connection;
use crate::error::Result;
use crate::events::{Subscription, Topics};
use crate::storage::{AwarenessCallback, AwarenessRecord, AwarenessStorage, Storage, StorageType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

type AwarenessEvent = (AwarenessRecord, Option<String>);

pub struct MemoryAwarenessStorage {
    connection: Arc<Connection>,
    topics: Topics<AwarenessEvent>,
    latest: Mutex<HashMap<String, AwarenessRecord>>,
    /// Serializes publishing against subscribe-and-replay.
    order: Mutex<()>,
}

impl MemoryAwarenessStorage {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            topics: Topics::new(),
            latest: Mutex::new(HashMap::new()),
            order: Mutex::new(()),
        }
    }

    /// Notify subscribers of `record.doc_id`, then cache it.
    pub fn publish(&self, record: AwarenessRecord, origin: Option<&str>) {
        let doc_id = record.doc_id.clone();
        let event = (record, origin.map(str::to_string));
        let _order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        self.topics.emit(&doc_id, &event);
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id, event.0);
    }
}

impl Storage for MemoryAwarenessStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Awareness
    }

    fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

#[async_trait]
impl AwarenessStorage for MemoryAwarenessStorage {
    async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()> {
        self.publish(record, origin);
        Ok(())
    }

    fn subscribe_update(&self, doc_id: &str, callback: AwarenessCallback) -> Subscription {
        let callback: Arc<AwarenessCallback> = Arc::new(callback);
        let _order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let replay = self.latest(doc_id);
        let live = Arc::clone(&callback);
        let subscription = self
            .topics
            .subscribe(doc_id, move |(record, origin)| live(record, origin.as_deref()));
        if let Some(latest) = replay {
            callback(&latest, None);
        }
        subscription
    }

    fn latest(&self, doc_id: &str) -> Option<AwarenessRecord> {
        self.latest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .cloned()
    }
}
