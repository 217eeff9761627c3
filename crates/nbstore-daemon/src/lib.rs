//! nbstore-daemon: serves nbstore spaces to remote-socket clients.
//!
//! The binary is a thin layer over this library so integration tests can
//! run the server in-process.

pub mod config;
mod connection;
pub mod server;

pub use config::{Backend, DaemonConfig};
pub use server::{INVALID_SPACE, SPACE_NOT_JOINED, SpaceServer};
