use super::RemoteSpace;
use crate::connection::Connection;
use crate::error::Result;
use crate::events::{EventBus, Subscription};
use crate::protocol::{
    Request, ServerEvent, WireDocDiff, WireDocUpdate, WirePushed, decode_timestamps,
};
use crate::storage::{
    DocClock, DocClocks, DocDiff, DocRecord, DocStorage, DocUpdate, DocUpdateCallback,
    DocUpdateEvent, Storage, StorageType, Timestamp,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct RemoteDocStorage {
    space: Arc<RemoteSpace>,
    /// Our own pushes, published to local subscribers
    pushed: Arc<EventBus<DocUpdateEvent>>,
}

impl RemoteDocStorage {
    pub fn new(space: Arc<RemoteSpace>) -> Self {
        Self {
            space,
            pushed: Arc::new(EventBus::new()),
        }
    }

    fn space_type(&self) -> crate::protocol::SpaceType {
        self.space.options().space_type
    }

    async fn load_doc(&self, doc_id: &str, state_vector: Option<&[u8]>) -> Result<Option<WireDocDiff>> {
        self.space
            .request(Request::LoadDoc {
                space_type: self.space_type(),
                space_id: self.space_id().to_string(),
                doc_id: doc_id.to_string(),
                state_vector: state_vector.map(<[u8]>::to_vec),
            })
            .await
    }

    /// Every doc changed after `since`, each as one full update.
    pub async fn load_doc_updates_since(&self, since: Timestamp) -> Result<Vec<DocRecord>> {
        let updates: Vec<WireDocUpdate> = self
            .space
            .request(Request::LoadDocUpdatesSince {
                space_type: self.space_type(),
                space_id: self.space_id().to_string(),
                since,
            })
            .await?;
        Ok(updates
            .into_iter()
            .map(|u| DocRecord {
                doc_id: u.doc_id,
                bin: u.update,
                timestamp: u.timestamp,
            })
            .collect())
    }
}

impl Storage for RemoteDocStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Doc
    }

    fn connection(&self) -> &Arc<Connection> {
        self.space.connection()
    }

    fn readonly(&self) -> bool {
        self.space.options().readonly
    }
}

#[async_trait]
impl DocStorage for RemoteDocStorage {
    fn space_id(&self) -> &str {
        &self.space.options().space_id
    }

    async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>> {
        Ok(self.load_doc(doc_id, None).await?.map(|diff| DocRecord {
            doc_id: doc_id.to_string(),
            bin: diff.missing,
            timestamp: diff.timestamp,
        }))
    }

    async fn get_doc_diff(
        &self,
        doc_id: &str,
        state_vector: Option<&[u8]>,
    ) -> Result<Option<DocDiff>> {
        Ok(self.load_doc(doc_id, state_vector).await?.map(|diff| DocDiff {
            doc_id: doc_id.to_string(),
            missing: diff.missing,
            state: diff.state,
            timestamp: diff.timestamp,
        }))
    }

    async fn push_doc_update(&self, update: DocUpdate, origin: Option<&str>) -> Result<DocClock> {
        let pushed: WirePushed = self
            .space
            .request(Request::PushDocUpdate {
                space_type: self.space_type(),
                space_id: self.space_id().to_string(),
                doc_id: update.doc_id.clone(),
                update: update.bin.clone(),
            })
            .await?;

        self.pushed.emit(&DocUpdateEvent {
            record: DocRecord {
                doc_id: update.doc_id.clone(),
                bin: update.bin,
                timestamp: pushed.timestamp,
            },
            origin: origin.map(str::to_string),
        });
        Ok(DocClock {
            doc_id: update.doc_id,
            timestamp: pushed.timestamp,
        })
    }

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>> {
        Ok(self.load_doc(doc_id, None).await?.map(|diff| DocClock {
            doc_id: doc_id.to_string(),
            timestamp: diff.timestamp,
        }))
    }

    async fn get_doc_timestamps(&self, after: Option<Timestamp>) -> Result<DocClocks> {
        let raw: HashMap<String, i64> = self
            .space
            .request(Request::LoadDocTimestamps {
                space_type: self.space_type(),
                space_id: self.space_id().to_string(),
                timestamp: after,
            })
            .await?;
        decode_timestamps(raw)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<()> {
        self.space
            .request::<serde_json::Value>(Request::DeleteDoc {
                space_type: self.space_type(),
                space_id: self.space_id().to_string(),
                doc_id: doc_id.to_string(),
            })
            .await?;
        Ok(())
    }

    /// Other clients' pushes (server broadcasts) plus our own.
    fn subscribe_doc_update(&self, callback: DocUpdateCallback) -> Subscription {
        let callback = Arc::new(callback);
        let for_remote = Arc::clone(&callback);
        let remote = self.space.client().events().subscribe(move |event| {
            if let ServerEvent::BroadcastDocUpdate {
                doc_id,
                update,
                timestamp,
                ..
            } = event
            {
                for_remote(&DocUpdateEvent {
                    record: DocRecord {
                        doc_id: doc_id.clone(),
                        bin: update.clone(),
                        timestamp: *timestamp,
                    },
                    origin: None,
                });
            }
        });
        let local = self.pushed.subscribe(move |event| callback(event));
        Subscription::merge(vec![remote, local])
    }
}
