//! nbstore: local-first storage and sync for Loro CRDT documents.
//!
//! This crate provides:
//! - A storage contract (doc, blob, sync bookkeeping, awareness, index roles)
//! - Embedded-local, native-file and remote-socket backends
//! - Doc, blob, index and awareness sync engines behind one `Sync` facade
//! - The JSON-over-WebSocket protocol spoken with `nbstore-daemon`

pub mod config;
pub mod connection;
pub mod crdt;
pub mod error;
pub mod events;
pub mod impls;
pub mod protocol;
pub mod signal;
pub mod storage;
pub mod sync;

pub use config::{RetryConfig, SyncConfig};
pub use connection::{Connection, ConnectionStatus, Connector};
pub use error::{Result, StoreError};
pub use events::{EventBus, Subscription};
pub use impls::{StorageKind, open_space};
pub use signal::{AbortController, AbortSignal};
pub use storage::SpaceStorage;
pub use sync::{Sync, SyncHealth};
