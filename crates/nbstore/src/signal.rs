//! Cooperative cancellation for long-running loops.
//!
//! An `AbortController` owns the flag; every loop receives a cloned
//! `AbortSignal` and checks it at each suspension point (connection waits,
//! job accepts, backoff sleeps, idle yields).

use crate::error::{Result, StoreError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Owner side of a cancellation flag.
#[derive(Debug)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            signal: AbortSignal { tx: Arc::new(tx) },
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Flip the flag. Idempotent.
    pub fn abort(&self) {
        self.signal.tx.send_replace(true);
    }
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
    /// A signal that is never aborted, for one-shot callers.
    pub fn never() -> Self {
        AbortController::new().signal()
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the signal is aborted.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as this signal, so the wait cannot fail.
        let _ = rx.wait_for(|aborted| *aborted).await;
    }

    /// Run `fut` unless the signal fires first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.throw_if_aborted()?;
        tokio::select! {
            biased;
            _ = self.aborted() => Err(StoreError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<()> {
        self.run(tokio::time::sleep(duration)).await
    }
}
