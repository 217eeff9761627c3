//! Backend adapters.
//!
//! - `embedded`: single-process durable store on SQLite
//! - `native`: file-per-record store, pooled by universal id
//! - `remote`: thin WebSocket RPC client to `nbstore-daemon`

mod awareness;
pub mod embedded;
pub mod native;
pub mod remote;

pub use awareness::MemoryAwarenessStorage;
pub use embedded::{EmbeddedDb, EmbeddedOptions};
pub use native::{NativeFileDb, NativeFileOptions, NativeFilePool};
pub use remote::{RemoteSpace, SocketClient, SocketOptions};

use crate::error::Result;
use crate::storage::SpaceStorage;
use serde::{Deserialize, Serialize};

/// Backend selection, usually read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StorageKind {
    EmbeddedLocal(EmbeddedOptions),
    NativeFile(NativeFileOptions),
    RemoteSocket(SocketOptions),
}

/// Open every role the backend supports for `space_id`.
///
/// Remote sockets are bound to the space in their options; `space_id` is
/// ignored for them.
pub fn open_space(kind: &StorageKind, space_id: &str) -> Result<SpaceStorage> {
    match kind {
        StorageKind::EmbeddedLocal(options) => Ok(EmbeddedDb::open(options.clone())?.space(space_id)),
        StorageKind::NativeFile(options) => {
            Ok(NativeFilePool::global().ensure_storage(options)?.space(space_id))
        }
        StorageKind::RemoteSocket(options) => Ok(RemoteSpace::open(options.clone()).space()),
    }
}
