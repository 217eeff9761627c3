//! Individual client socket handling.
//!
//! The write half is drained by a writer task fed through a channel, so
//! acks and broadcasts produced by other sockets' tasks never contend on
//! the sink. The read half answers requests in arrival order.

use crate::server::Hub;
use anyhow::{Result, anyhow};
use futures::{SinkExt, StreamExt};
use nbstore::protocol::{AckPayload, Frame, MAX_FRAME_SIZE};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

type WsRead = futures::stream::SplitStream<WebSocketStream<TcpStream>>;

/// Cloneable send handle for one socket.
#[derive(Debug, Clone)]
pub(crate) struct Outgoing {
    conn_id: Arc<str>,
    tx: mpsc::UnboundedSender<Message>,
}

impl Outgoing {
    pub(crate) fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub(crate) fn send(&self, frame: &Frame) -> Result<()> {
        let text = frame.to_text()?;
        self.tx
            .send(Message::Text(text.into()))
            .map_err(|_| anyhow!("connection {} closed", self.conn_id))
    }
}

pub(crate) struct ClientConnection {
    outgoing: Outgoing,
    read: WsRead,
}

impl ClientConnection {
    /// Split the stream and spawn the writer. The writer exits, closing the
    /// socket, once every `Outgoing` clone is gone.
    pub(crate) fn new(conn_id: String, ws_stream: WebSocketStream<TcpStream>) -> Self {
        let (mut write, read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let write_conn_id = conn_id.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    debug!("Write to {} failed: {}", write_conn_id, e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        Self {
            outgoing: Outgoing {
                conn_id: conn_id.into(),
                tx,
            },
            read,
        }
    }

    /// Serve requests until the socket closes, then drop out of every space.
    pub(crate) async fn run(mut self, hub: Arc<Hub>) {
        let conn_id = self.outgoing.conn_id().to_string();

        loop {
            let text = match self.read.next().await {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame from {}", conn_id);
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame from {}", conn_id);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!("Connection {} closed", conn_id);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error on {}: {}", conn_id, e);
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", conn_id);
                    break;
                }
            };

            if text.len() > MAX_FRAME_SIZE {
                warn!(
                    "Frame from {} exceeds max size ({} > {}), dropping",
                    conn_id,
                    text.len(),
                    MAX_FRAME_SIZE
                );
                continue;
            }

            self.on_text(&hub, &text).await;
        }

        hub.disconnect(&conn_id).await;
    }

    async fn on_text(&self, hub: &Hub, text: &str) {
        let reply = match Frame::from_text(text) {
            Ok(Frame::Request { id, request }) => {
                let response = hub.handle(&self.outgoing, request).await;
                Frame::Ack { id, response }
            }
            Ok(_) => {
                warn!("{} sent a non-request frame, ignoring", self.outgoing.conn_id());
                return;
            }
            Err(e) => {
                // Answer when the id is readable so the caller's request fails fast.
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|value| value.get("id")?.as_u64());
                match id {
                    Some(id) => Frame::Ack {
                        id,
                        response: AckPayload::from_error(&e),
                    },
                    None => {
                        warn!("Unreadable frame from {}: {}", self.outgoing.conn_id(), e);
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.outgoing.send(&reply) {
            debug!("Could not reply to {}: {}", self.outgoing.conn_id(), e);
        }
    }
}
