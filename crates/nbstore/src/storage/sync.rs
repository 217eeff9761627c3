//! Sync bookkeeping roles (docSync, blobSync).
//!
//! These persist clocks only, never content. All clock setters are
//! greater-only: a value that is not newer than the stored one is ignored.

use super::{DocClock, DocClocks, Storage, Timestamp};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per (peer, doc) clocks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerClock {
    /// Newest timestamp known to exist on the peer
    pub clock: Option<Timestamp>,
    /// Newest peer timestamp merged locally
    pub pulled_clock: Option<Timestamp>,
    /// Newest local timestamp acknowledged by the peer
    pub pushed_clock: Option<Timestamp>,
}

impl PeerClock {
    /// Greater-only assignment. Returns whether the slot changed.
    pub fn advance(slot: &mut Option<Timestamp>, value: Timestamp) -> bool {
        match slot {
            Some(current) if *current >= value => false,
            _ => {
                *slot = Some(value);
                true
            }
        }
    }
}

#[async_trait]
pub trait DocSyncStorage: Storage {
    async fn get_peer_remote_clocks(&self, peer: &str) -> Result<DocClocks>;
    async fn get_peer_remote_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>>;
    async fn set_peer_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()>;

    async fn get_peer_pulled_remote_clocks(&self, peer: &str) -> Result<DocClocks>;
    async fn get_peer_pulled_remote_clock(
        &self,
        peer: &str,
        doc_id: &str,
    ) -> Result<Option<DocClock>>;
    async fn set_peer_pulled_remote_clock(&self, peer: &str, clock: DocClock) -> Result<()>;

    async fn get_peer_pushed_clocks(&self, peer: &str) -> Result<DocClocks>;
    async fn get_peer_pushed_clock(&self, peer: &str, doc_id: &str) -> Result<Option<DocClock>>;
    async fn set_peer_pushed_clock(&self, peer: &str, clock: DocClock) -> Result<()>;

    /// Forget every peer clock, forcing a full resync.
    async fn clear_clocks(&self) -> Result<()>;
}

#[async_trait]
pub trait BlobSyncStorage: Storage {
    async fn get_blob_uploaded_at(&self, peer: &str, key: &str) -> Result<Option<Timestamp>>;

    /// `None` clears the record so the next upload is attempted again.
    async fn set_blob_uploaded_at(
        &self,
        peer: &str,
        key: &str,
        uploaded_at: Option<Timestamp>,
    ) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_advance_is_greater_only() {
        let t0 = crate::storage::now();
        let mut slot = None;

        assert!(PeerClock::advance(&mut slot, t0));
        assert!(!PeerClock::advance(&mut slot, t0));
        assert!(!PeerClock::advance(&mut slot, t0 - Duration::seconds(1)));
        assert_eq!(slot, Some(t0));

        assert!(PeerClock::advance(&mut slot, t0 + Duration::seconds(1)));
        assert_eq!(slot, Some(t0 + Duration::seconds(1)));
    }
}
