//! Live queries: run once, then re-run whenever the table is signalled as
//! updated, at most once per throttle window with leading and trailing
//! edges. Failed queries back off and retry.

use crate::config::{RetryState, SyncConfig};
use crate::error::Result;
use crate::signal::AbortController;
use crate::storage::IndexerStorage;
use futures::Stream;
use futures::future::BoxFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Results of a live query. Dropping it stops the query task.
pub struct QueryStream<T> {
    rx: mpsc::Receiver<T>,
    controller: AbortController,
}

impl<T> QueryStream<T> {
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

impl<T> Unpin for QueryStream<T> {}

impl<T> Stream for QueryStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for QueryStream<T> {
    fn drop(&mut self) {
        self.controller.abort();
    }
}

pub(crate) fn watch_query<T, F>(
    indexer: Arc<dyn IndexerStorage>,
    table: &str,
    config: &SyncConfig,
    query: F,
) -> QueryStream<T>
where
    T: Send + 'static,
    F: Fn(Arc<dyn IndexerStorage>) -> BoxFuture<'static, Result<T>>
        + Send
        + std::marker::Sync
        + 'static,
{
    let controller = AbortController::new();
    let signal = controller.signal();
    let (tx, rx) = mpsc::channel(1);
    let (dirty_tx, dirty_rx) = watch::channel(());
    let subscription = indexer.subscribe_table_updated(
        table,
        Box::new(move || {
            dirty_tx.send_replace(());
        }),
    );

    let table = table.to_string();
    let throttle = config.search_throttle();
    let retry = config.retry();
    tokio::spawn(async move {
        let _subscription = subscription;
        let mut dirty_rx = dirty_rx;
        let mut retry_state = RetryState::default();

        let outcome: Result<()> = async {
            loop {
                let result = match signal.run(query(Arc::clone(&indexer))).await? {
                    Ok(result) => result,
                    Err(e) => {
                        let delay = retry_state.next_delay(&retry);
                        warn!("live query on {} failed, retrying in {:?}: {}", table, delay, e);
                        signal.sleep(delay).await?;
                        continue;
                    }
                };
                retry_state.reset();
                let ran_at = Instant::now();
                if tx.send(result).await.is_err() {
                    return Ok(());
                }

                if signal.run(dirty_rx.changed()).await?.is_err() {
                    return Ok(());
                }
                signal.run(tokio::time::sleep_until(ran_at + throttle)).await?;
                dirty_rx.borrow_and_update();
            }
        }
        .await;
        if let Err(e) = outcome {
            debug!("live query on {} ended: {}", table, e);
        }
    });

    QueryStream { rx, controller }
}
