//! Connection lifecycle shared by every storage role of one backend.
//!
//! A `Connection` wraps a backend-specific `Connector` and keeps it connected:
//! `connect()` starts a background task that retries with exponential backoff
//! until it succeeds, and reconnects after the connector reports the session
//! lost. Engines gate their work on `wait_for_connected`, which resolves once
//! the status is `Connected` and fails on timeout or cancellation.
//!
//! Roles backed by the same physical store share one `Arc<Connection>`;
//! `connect`/`disconnect` are reference counted so one role disconnecting does
//! not tear down its siblings.

use crate::config::{CONNECT_TIMEOUT, RetryConfig, RetryState};
use crate::error::{Result, StoreError};
use crate::signal::AbortSignal;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Observable state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Never connected
    Idle,
    /// Attempt in progress
    Connecting,
    /// Backend usable
    Connected,
    /// Last attempt failed or the session dropped; a retry is scheduled
    Error(String),
    /// Disconnected on request, no retry
    Closed,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// Backend-specific connect/disconnect.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish the session. The reporter stays valid for the session's
    /// lifetime and is used to signal that it dropped.
    async fn do_connect(&self, reporter: StatusReporter) -> Result<()>;

    /// Tear down whatever `do_connect` set up. Must tolerate partial state.
    async fn do_disconnect(&self);
}

/// Handle given to connectors to report a dropped session.
#[derive(Clone)]
pub struct StatusReporter {
    status: Arc<watch::Sender<ConnectionStatus>>,
    lost: Arc<AtomicBool>,
}

impl StatusReporter {
    pub fn lost(&self, reason: impl Into<String>) {
        self.lost.store(true, Ordering::SeqCst);
        let reason = reason.into();
        self.status.send_if_modified(|status| {
            if status.is_connected() {
                *status = ConnectionStatus::Error(reason);
                true
            } else {
                false
            }
        });
    }
}

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    task: Option<JoinHandle<()>>,
}

pub struct Connection {
    name: String,
    connector: Arc<dyn Connector>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    retry: RetryConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Connection {
    pub fn new(name: impl Into<String>, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_retry(name, connector, RetryConfig::default())
    }

    pub fn with_retry(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        retry: RetryConfig,
    ) -> Arc<Self> {
        let (tx, _rx) = watch::channel(ConnectionStatus::Idle);
        Arc::new(Self {
            name: name.into(),
            connector,
            status: Arc::new(tx),
            retry,
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().is_connected()
    }

    /// Receiver for status changes; starts with the current value.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Start connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        lifecycle.refs += 1;
        let running = lifecycle.task.as_ref().is_some_and(|t| !t.is_finished());
        if running {
            return;
        }

        debug!("{}: connecting", self.name);
        lifecycle.task = Some(tokio::spawn(run_connection(
            self.name.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.status),
            self.retry.clone(),
        )));
    }

    /// Release one reference; the last one closes the backend.
    pub async fn disconnect(&self) {
        let task = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            lifecycle.refs = lifecycle.refs.saturating_sub(1);
            if lifecycle.refs > 0 {
                return;
            }
            lifecycle.task.take()
        };

        self.status.send_replace(ConnectionStatus::Closed);
        if let Some(task) = task {
            task.abort();
        }
        self.connector.do_disconnect().await;
        info!("{}: disconnected", self.name);
    }

    /// Wait up to the standard 30 second bound.
    pub async fn wait_for_connected(&self, signal: &AbortSignal) -> Result<bool> {
        self.wait_for_connected_within(signal, CONNECT_TIMEOUT).await
    }

    pub async fn wait_for_connected_within(
        &self,
        signal: &AbortSignal,
        timeout: Duration,
    ) -> Result<bool> {
        let mut rx = self.status.subscribe();
        let wait = async move { rx.wait_for(|s| s.is_connected()).await.is_ok() };

        match tokio::time::timeout(timeout, signal.run(wait)).await {
            Err(_) => Err(StoreError::Connection(format!(
                "{}: not connected after {:?}",
                self.name, timeout
            ))),
            Ok(Err(err)) => Err(err),
            Ok(Ok(true)) => Ok(true),
            Ok(Ok(false)) => Err(StoreError::Connection(format!("{}: closed", self.name))),
        }
    }

    /// Resolves once the status leaves `Connected`.
    pub async fn wait_for_lost(&self) {
        let mut rx = self.status.subscribe();
        let _ = rx.wait_for(|s| !s.is_connected()).await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

async fn run_connection(
    name: String,
    connector: Arc<dyn Connector>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    retry: RetryConfig,
) {
    let mut retry_state = RetryState::default();

    loop {
        status.send_replace(ConnectionStatus::Connecting);
        let lost = Arc::new(AtomicBool::new(false));
        let reporter = StatusReporter {
            status: Arc::clone(&status),
            lost: Arc::clone(&lost),
        };

        match connector.do_connect(reporter).await {
            Ok(()) if !lost.load(Ordering::SeqCst) => {
                retry_state.reset();
                status.send_replace(ConnectionStatus::Connected);
                info!("{}: connected", name);

                let mut rx = status.subscribe();
                let _ = rx.wait_for(|s| !s.is_connected()).await;
                if matches!(*status.borrow(), ConnectionStatus::Closed) {
                    return;
                }
                warn!("{}: connection lost, reconnecting", name);
                connector.do_disconnect().await;
            }
            Ok(()) => {
                warn!("{}: session dropped during connect", name);
                status.send_replace(ConnectionStatus::Error("session dropped".into()));
                connector.do_disconnect().await;
            }
            Err(err) => {
                warn!("{}: failed to connect: {}", name, err);
                status.send_replace(ConnectionStatus::Error(err.to_string()));
            }
        }

        if retry_state.exceeded(&retry) {
            warn!("{}: giving up after {} attempts", name, retry_state.attempts);
            return;
        }
        tokio::time::sleep(retry_state.next_delay(&retry)).await;
    }
}

/// Connector for backends that are usable as soon as they exist.
pub struct ReadyConnector;

#[async_trait]
impl Connector for ReadyConnector {
    async fn do_connect(&self, _reporter: StatusReporter) -> Result<()> {
        Ok(())
    }

    async fn do_disconnect(&self) {}
}
