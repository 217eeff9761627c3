//! WebSocket server hosting spaces for remote-socket clients.
//!
//! Sockets join `(spaceType, spaceId)` pairs. Every request gets exactly one
//! ack; doc and awareness updates are relayed to the other sockets joined to
//! the same space. Spaces are opened on first join and stay open until the
//! server closes.

use crate::config::{Backend, DaemonConfig};
use crate::connection::{ClientConnection, Outgoing};
use anyhow::Result;
use nbstore::impls::{EmbeddedDb, EmbeddedOptions, NativeFileOptions, NativeFilePool};
use nbstore::protocol::{
    AckPayload, Frame, Request, ServerEvent, SpaceType, WireAwareness, WireBlob, WireDocDiff,
    WireDocUpdate, WireListedBlob, WirePushed, encode_timestamps,
};
use nbstore::storage::{BlobRecord, BlobStorage, DocStorage, DocUpdate, SpaceStorage};
use nbstore::{AbortSignal, StoreError};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

/// Error name for requests on a space the socket hasn't joined.
pub const SPACE_NOT_JOINED: &str = "SPACE_NOT_JOINED";
pub const INVALID_SPACE: &str = "INVALID_SPACE";

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

type SpaceKey = (SpaceType, String);

struct ServedSpace {
    storage: SpaceStorage,
    members: Mutex<HashMap<String, Outgoing>>,
    /// doc id -> conn id -> latest awareness payload
    awareness: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl ServedSpace {
    fn new(storage: SpaceStorage) -> Self {
        Self {
            storage,
            members: Mutex::new(HashMap::new()),
            awareness: Mutex::new(HashMap::new()),
        }
    }

    fn is_member(&self, conn_id: &str) -> bool {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(conn_id)
    }

    fn add_member(&self, client: &Outgoing) {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client.conn_id().to_string(), client.clone());
    }

    /// Returns whether the socket was a member.
    fn remove_member(&self, conn_id: &str) -> bool {
        let removed = self
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn_id)
            .is_some();
        let mut awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
        for states in awareness.values_mut() {
            states.remove(conn_id);
        }
        awareness.retain(|_, states| !states.is_empty());
        removed
    }

    fn broadcast_except(&self, conn_id: &str, event: ServerEvent) {
        let frame = Frame::Event { event };
        let members: Vec<Outgoing> = self
            .members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|m| m.conn_id() != conn_id)
            .cloned()
            .collect();
        for member in members {
            if let Err(e) = member.send(&frame) {
                warn!("Failed to relay to {}: {}", member.conn_id(), e);
            }
        }
    }

    fn doc(&self) -> nbstore::Result<&Arc<dyn DocStorage>> {
        self.storage
            .doc
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("doc storage".into()))
    }

    fn blob(&self) -> nbstore::Result<&Arc<dyn BlobStorage>> {
        self.storage
            .blob
            .as_ref()
            .ok_or_else(|| StoreError::NotFound("blob storage".into()))
    }

    async fn serve(&self, conn_id: &str, request: Request) -> nbstore::Result<AckPayload> {
        match request {
            Request::LoadDoc {
                doc_id,
                state_vector,
                ..
            } => {
                let diff = self.doc()?.get_doc_diff(&doc_id, state_vector.as_deref()).await?;
                Ok(AckPayload::ok(&diff.map(|d| WireDocDiff {
                    missing: d.missing,
                    state: d.state,
                    timestamp: d.timestamp,
                })))
            }
            Request::PushDocUpdate {
                space_type,
                space_id,
                doc_id,
                update,
            } => {
                let clock = self
                    .doc()?
                    .push_doc_update(DocUpdate::new(doc_id.clone(), update.clone()), Some(conn_id))
                    .await?;
                debug!("{} pushed {} ({} bytes)", conn_id, doc_id, update.len());
                self.broadcast_except(
                    conn_id,
                    ServerEvent::BroadcastDocUpdate {
                        space_type,
                        space_id,
                        doc_id,
                        update,
                        timestamp: clock.timestamp,
                    },
                );
                Ok(AckPayload::ok(&WirePushed {
                    timestamp: clock.timestamp,
                }))
            }
            Request::LoadDocTimestamps { timestamp, .. } => {
                let clocks = self.doc()?.get_doc_timestamps(timestamp).await?;
                Ok(AckPayload::ok(&encode_timestamps(&clocks)))
            }
            Request::LoadDocUpdatesSince { since, .. } => {
                let doc = self.doc()?;
                let mut doc_ids: Vec<String> = doc.get_doc_timestamps(Some(since)).await?.into_keys().collect();
                doc_ids.sort();
                let mut updates = Vec::with_capacity(doc_ids.len());
                for doc_id in doc_ids {
                    if let Some(record) = doc.get_doc(&doc_id).await? {
                        updates.push(WireDocUpdate {
                            doc_id: record.doc_id,
                            update: record.bin,
                            timestamp: record.timestamp,
                        });
                    }
                }
                Ok(AckPayload::ok(&updates))
            }
            Request::DeleteDoc { doc_id, .. } => {
                self.doc()?.delete_doc(&doc_id).await?;
                Ok(AckPayload::ok(&()))
            }
            Request::UpdateAwareness {
                space_type,
                space_id,
                doc_id,
                awareness_update,
            } => {
                self.awareness
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(doc_id.clone())
                    .or_default()
                    .insert(conn_id.to_string(), awareness_update.clone());
                self.broadcast_except(
                    conn_id,
                    ServerEvent::BroadcastAwarenessUpdate {
                        space_type,
                        space_id,
                        doc_id,
                        awareness_update,
                    },
                );
                Ok(AckPayload::ok(&()))
            }
            Request::LoadAwarenesses { doc_id, .. } => {
                let awareness = self.awareness.lock().unwrap_or_else(|e| e.into_inner());
                let mut others: Vec<(&String, &Vec<u8>)> = awareness
                    .get(&doc_id)
                    .into_iter()
                    .flatten()
                    .filter(|(id, _)| id.as_str() != conn_id)
                    .collect();
                others.sort_by(|a, b| a.0.cmp(b.0));
                let states: Vec<WireAwareness> = others
                    .into_iter()
                    .map(|(_, bin)| WireAwareness {
                        awareness_update: bin.clone(),
                    })
                    .collect();
                Ok(AckPayload::ok(&states))
            }
            Request::GetBlob { key, .. } => {
                let blob = self.blob()?.get(&key).await?;
                Ok(AckPayload::ok(&blob.map(WireBlob::from)))
            }
            Request::SetBlob { blob, .. } => {
                let record = BlobRecord::from(blob);
                record.verify()?;
                self.blob()?.set(record).await?;
                Ok(AckPayload::ok(&()))
            }
            Request::DeleteBlob {
                key, permanently, ..
            } => {
                self.blob()?.delete(&key, permanently).await?;
                Ok(AckPayload::ok(&()))
            }
            Request::ReleaseBlobs { .. } => {
                self.blob()?.release().await?;
                Ok(AckPayload::ok(&()))
            }
            Request::ListBlobs { .. } => {
                let listed: Vec<WireListedBlob> = self
                    .blob()?
                    .list()
                    .await?
                    .into_iter()
                    .map(WireListedBlob::from)
                    .collect();
                Ok(AckPayload::ok(&listed))
            }
            Request::BlobExists { key, .. } => Ok(AckPayload::ok(&self.blob()?.exists(&key).await?)),
            Request::JoinSpace { .. } | Request::LeaveSpace { .. } => Err(StoreError::protocol(
                "BAD_REQUEST",
                "membership requests are not space operations",
            )),
        }
    }
}

/// Shared state behind every connection.
pub(crate) struct Hub {
    config: DaemonConfig,
    native: NativeFilePool,
    spaces: tokio::sync::Mutex<HashMap<SpaceKey, Arc<ServedSpace>>>,
}

impl Hub {
    fn new(config: DaemonConfig) -> Self {
        Self {
            config,
            native: NativeFilePool::new(),
            spaces: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Answer one request. Failures become error acks.
    pub(crate) async fn handle(&self, client: &Outgoing, request: Request) -> AckPayload {
        let name = request.name();
        match self.dispatch(client, request).await {
            Ok(ack) => ack,
            Err(e) => {
                debug!("{} from {} failed: {}", name, client.conn_id(), e);
                AckPayload::from_error(&e)
            }
        }
    }

    async fn dispatch(&self, client: &Outgoing, request: Request) -> nbstore::Result<AckPayload> {
        let conn_id = client.conn_id();
        match request {
            Request::JoinSpace {
                space_type,
                space_id,
                client_version,
            } => {
                let space = self.open(space_type, &space_id).await?;
                space.add_member(client);
                info!(
                    "{} joined {} {} (client {})",
                    conn_id, space_type, space_id, client_version
                );
                Ok(AckPayload::ok(&json!({ "clientId": conn_id })))
            }
            Request::LeaveSpace {
                space_type,
                space_id,
            } => {
                let space = self.spaces.lock().await.get(&(space_type, space_id.clone())).cloned();
                if space.is_some_and(|s| s.remove_member(conn_id)) {
                    info!("{} left {} {}", conn_id, space_type, space_id);
                }
                Ok(AckPayload::ok(&()))
            }
            request => {
                let space = {
                    let (space_type, space_id) = request.space();
                    self.joined(conn_id, space_type, space_id).await?
                };
                space.serve(conn_id, request).await
            }
        }
    }

    async fn joined(
        &self,
        conn_id: &str,
        space_type: SpaceType,
        space_id: &str,
    ) -> nbstore::Result<Arc<ServedSpace>> {
        self.spaces
            .lock()
            .await
            .get(&(space_type, space_id.to_string()))
            .filter(|space| space.is_member(conn_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::protocol(
                    SPACE_NOT_JOINED,
                    format!("join {} {} first", space_type, space_id),
                )
            })
    }

    async fn open(&self, space_type: SpaceType, space_id: &str) -> nbstore::Result<Arc<ServedSpace>> {
        if space_id.is_empty()
            || space_id == "."
            || space_id == ".."
            || space_id.contains(['/', '\\'])
        {
            return Err(StoreError::protocol(
                INVALID_SPACE,
                format!("unusable space id {:?}", space_id),
            ));
        }

        let mut spaces = self.spaces.lock().await;
        let key = (space_type, space_id.to_string());
        if let Some(space) = spaces.get(&key) {
            return Ok(Arc::clone(space));
        }

        let storage = self.open_storage(space_type, space_id)?;
        storage.connect();
        tokio::time::timeout(OPEN_TIMEOUT, storage.wait_for_connected(&AbortSignal::never()))
            .await
            .map_err(|_| StoreError::Connection(format!("opening {} {} timed out", space_type, space_id)))??;
        info!("Opened {} {} ({:?})", space_type, space_id, self.config.backend);

        let space = Arc::new(ServedSpace::new(storage));
        spaces.insert(key, Arc::clone(&space));
        Ok(space)
    }

    fn open_storage(&self, space_type: SpaceType, space_id: &str) -> nbstore::Result<SpaceStorage> {
        let name = format!("{}-{}", space_type, space_id);
        match self.config.backend {
            Backend::Memory => Ok(EmbeddedDb::open(EmbeddedOptions::in_memory(name))?.space(space_id)),
            Backend::Embedded => {
                let path = self.config.data_dir.join(format!("{}.db", name));
                Ok(EmbeddedDb::open(EmbeddedOptions::at(name, path))?.space(space_id))
            }
            Backend::NativeFile => Ok(self
                .native
                .ensure_storage(&NativeFileOptions {
                    root: self.config.data_dir.clone(),
                    universal_id: name,
                    space_id: space_id.to_string(),
                })?
                .space(space_id)),
        }
    }

    /// Drop a closed socket from every space it joined.
    pub(crate) async fn disconnect(&self, conn_id: &str) {
        let spaces: Vec<Arc<ServedSpace>> = self.spaces.lock().await.values().cloned().collect();
        let left = spaces.iter().filter(|space| space.remove_member(conn_id)).count();
        info!("{} disconnected (left {} space(s))", conn_id, left);
    }

    async fn close(&self) {
        let spaces: Vec<Arc<ServedSpace>> = self.spaces.lock().await.drain().map(|(_, s)| s).collect();
        for space in spaces {
            space.storage.disconnect().await;
        }
    }
}

/// WebSocket server accepting remote-socket clients.
pub struct SpaceServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    next_conn_id: AtomicU64,
}

impl SpaceServer {
    /// Bind the configured listen address.
    pub async fn bind(config: DaemonConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen).await?;
        info!("WebSocket server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            hub: Arc::new(Hub::new(config)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = format!("conn-{}", self.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let hub = Arc::clone(&self.hub);

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    // Health checks connect and close without upgrading.
                    let err_str = e.to_string();
                    if err_str.contains("Handshake not finished")
                        || err_str.contains("Connection reset")
                        || err_str.contains("unexpected EOF")
                    {
                        debug!("Connection closed before upgrade from {}", addr);
                    } else {
                        error!("WebSocket upgrade failed for {}: {}", addr, e);
                    }
                    return;
                }
            };

            info!("New connection from {} (conn_id: {})", addr, conn_id);
            ClientConnection::new(conn_id, ws_stream).run(hub).await;
        });
    }

    /// Disconnect the storage of every opened space.
    pub async fn close(&self) {
        self.hub.close().await;
        info!("All spaces closed");
    }
}
