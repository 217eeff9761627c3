//! Awareness role: ephemeral presence per doc.

use super::Storage;
use crate::error::Result;
use crate::events::Subscription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessRecord {
    pub doc_id: String,
    /// Opaque presence payload
    pub bin: Vec<u8>,
}

/// Receives each record plus the origin it was published with.
pub type AwarenessCallback = Box<dyn Fn(&AwarenessRecord, Option<&str>) + Send + Sync>;

#[async_trait]
pub trait AwarenessStorage: Storage {
    /// Notify subscribers of `record.doc_id`, then remember it as the latest.
    async fn update(&self, record: AwarenessRecord, origin: Option<&str>) -> Result<()>;

    /// Delivers the latest record (if any) right away, then every update.
    fn subscribe_update(&self, doc_id: &str, callback: AwarenessCallback) -> Subscription;

    /// Latest record for `doc_id`, if any.
    fn latest(&self, doc_id: &str) -> Option<AwarenessRecord>;
}
