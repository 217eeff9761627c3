//! Remote-socket backend.
//!
//! A thin RPC client: every storage call becomes one request frame over a
//! WebSocket and waits for its ack. Server broadcasts for the joined space
//! are fanned out to the doc and awareness roles. Durability lives on the
//! server; nothing is cached here except the latest awareness record.

mod awareness;
mod blob;
mod doc;

pub use awareness::RemoteAwarenessStorage;
pub use blob::RemoteBlobStorage;
pub use doc::RemoteDocStorage;

use crate::config::RetryConfig;
use crate::connection::{Connection, Connector, StatusReporter};
use crate::error::{Result, StoreError};
use crate::events::EventBus;
use crate::protocol::{AckPayload, CLIENT_VERSION, Frame, MAX_FRAME_SIZE, Request, ServerEvent, SpaceType};
use crate::storage::SpaceStorage;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:3010`
    pub endpoint: String,
    pub space_type: SpaceType,
    pub space_id: String,
    /// Only pull from this peer
    #[serde(default)]
    pub readonly: bool,
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<AckPayload>>>>;

/// How long a disconnect waits for queued frames (the leave) to be written.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Session {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

/// WebSocket client for one `(spaceType, spaceId)`.
pub struct SocketClient {
    options: SocketOptions,
    next_id: AtomicU64,
    pending: PendingAcks,
    session: Mutex<Session>,
    events: Arc<EventBus<ServerEvent>>,
}

impl SocketClient {
    pub fn new(options: SocketOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            session: Mutex::new(Session::default()),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    /// Broadcasts for the joined space.
    pub fn events(&self) -> &Arc<EventBus<ServerEvent>> {
        &self.events
    }

    /// Send one request and wait for its ack.
    ///
    /// Fails with a connection error when no session is open or the socket
    /// closes before the ack arrives, and with a protocol error when the
    /// server replies with `error`.
    pub async fn request<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        let outgoing = self
            .session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outgoing
            .clone()
            .ok_or_else(|| StoreError::Connection(format!("{}: not connected", self.options.endpoint)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = request.name();
        let text = Frame::Request { id, request }.to_text()?;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        if outgoing.send(Message::Text(text.into())).is_err() {
            self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
            return Err(StoreError::Connection(format!("{}: socket closed", self.options.endpoint)));
        }

        let ack = rx.await.map_err(|_| {
            StoreError::Connection(format!("{}: socket closed before {} was acked", self.options.endpoint, name))
        })?;
        ack.into_result()
    }

    fn take_session(&self) -> Session {
        std::mem::take(&mut *self.session.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn fail_pending(&self) {
        // Dropping the senders fails every waiter with a connection error.
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Tear the session down without a goodbye.
    fn close_session(&self) {
        let session = self.take_session();
        for task in [session.writer, session.reader].into_iter().flatten() {
            task.abort();
        }
        self.fail_pending();
    }

    async fn join(&self) -> Result<()> {
        self.request::<serde_json::Value>(Request::JoinSpace {
            space_type: self.options.space_type,
            space_id: self.options.space_id.clone(),
            client_version: CLIENT_VERSION.to_string(),
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Connector for SocketClient {
    async fn do_connect(&self, reporter: StatusReporter) -> Result<()> {
        let (ws_stream, _) = connect_async(self.options.endpoint.as_str()).await?;
        let (mut write, read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!("socket write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(read_loop(
            self.options.clone(),
            read,
            Arc::clone(&self.pending),
            Arc::clone(&self.events),
            reporter,
        ));

        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Session {
            outgoing: Some(tx),
            writer: Some(writer),
            reader: Some(reader),
        };

        if let Err(e) = self.join().await {
            self.close_session();
            return Err(e);
        }
        info!(
            "joined {} {} at {}",
            self.options.space_type, self.options.space_id, self.options.endpoint
        );
        Ok(())
    }

    /// Queue a leave, let the writer flush it and close the socket, then
    /// stop reading.
    async fn do_disconnect(&self) {
        let session = self.take_session();
        // The reader goes first so the server's close is not reported as a lost session.
        if let Some(reader) = session.reader {
            reader.abort();
        }

        if let Some(outgoing) = session.outgoing {
            let leave = Frame::Request {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                request: Request::LeaveSpace {
                    space_type: self.options.space_type,
                    space_id: self.options.space_id.clone(),
                },
            };
            match leave.to_text() {
                Ok(text) => {
                    let _ = outgoing.send(Message::Text(text.into()));
                }
                Err(e) => warn!("{}: could not encode leave: {}", self.options.endpoint, e),
            }
        }

        if let Some(mut writer) = session.writer {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                debug!("{}: writer did not drain, dropping socket", self.options.endpoint);
                writer.abort();
            }
        }
        self.fail_pending();
    }
}

async fn read_loop(
    options: SocketOptions,
    mut read: futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
    pending: PendingAcks,
    events: Arc<EventBus<ServerEvent>>,
    reporter: StatusReporter,
) {
    loop {
        let text = match read.next().await {
            Some(Ok(Message::Text(text))) => text.to_string(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    warn!("{}: dropping non-UTF-8 binary frame", options.endpoint);
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) => {
                debug!("{}: received close frame", options.endpoint);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                debug!("{}: stream ended", options.endpoint);
                break;
            }
            Some(Err(e)) => {
                error!("{}: websocket error: {}", options.endpoint, e);
                break;
            }
        };

        if text.len() > MAX_FRAME_SIZE {
            warn!("{}: frame exceeds {} bytes, dropping", options.endpoint, MAX_FRAME_SIZE);
            continue;
        }

        match Frame::from_text(&text) {
            Ok(Frame::Ack { id, response }) => {
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => debug!("{}: ack for unknown request {}", options.endpoint, id),
                }
            }
            Ok(Frame::Event { event }) => {
                if event.space() == (options.space_type, options.space_id.as_str()) {
                    events.emit(&event);
                }
            }
            Ok(Frame::Request { .. }) => {
                warn!("{}: server sent a request frame, ignoring", options.endpoint);
            }
            Err(e) => warn!("{}: {}", options.endpoint, e),
        }
    }

    pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
    reporter.lost("socket closed");
}

/// A joined remote space: one client, one connection, every remote role.
pub struct RemoteSpace {
    client: Arc<SocketClient>,
    connection: Arc<Connection>,
}

impl RemoteSpace {
    pub fn open(options: SocketOptions) -> Arc<Self> {
        Self::with_retry(options, RetryConfig::default())
    }

    pub fn with_retry(options: SocketOptions, retry: RetryConfig) -> Arc<Self> {
        let name = format!("remote:{}/{}", options.endpoint, options.space_id);
        let client = SocketClient::new(options);
        let connection = Connection::with_retry(name, Arc::clone(&client) as Arc<dyn Connector>, retry);
        Arc::new(Self { client, connection })
    }

    pub fn client(&self) -> &Arc<SocketClient> {
        &self.client
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn options(&self) -> &SocketOptions {
        self.client.options()
    }

    pub(crate) async fn request<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        self.client.request(request).await
    }

    /// Doc, blob and awareness roles. Sync bookkeeping stays local.
    pub fn space(self: &Arc<Self>) -> SpaceStorage {
        SpaceStorage {
            doc: Some(Arc::new(RemoteDocStorage::new(Arc::clone(self)))),
            blob: Some(Arc::new(RemoteBlobStorage::new(Arc::clone(self)))),
            awareness: Some(Arc::new(RemoteAwarenessStorage::new(Arc::clone(self)))),
            ..Default::default()
        }
    }
}
