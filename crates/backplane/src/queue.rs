//! At-least-once distributed work queue.
//!
//! Two backplane lists per logical queue: the pending list under the base
//! name, and the in-flight `_dequeue` sibling. A dequeue is one atomic move
//! from the tail of the pending list to the head of the sibling, so every
//! taken entry is in exactly one of {pending, in-flight, committed} at all
//! times. Acknowledgement is `remove_from_dequeue` after the pipeline has
//! durably committed the entry; entries a crashed worker leaves behind stay
//! in the sibling list for the external recovery sweep.
//!
//! Blocking dequeues run on a helper task so that caller cancellation can
//! forcibly disconnect the store and unblock the server side. A reply that
//! races the cancellation is delivered anyway; the cancellation stays
//! asserted on the caller's token.

use std::sync::Arc;
use std::time::Duration;

use ffx_common::ids::QueueName;
use ffx_common::metrics::global_metrics;
use ffx_common::{FfxError, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::{Direction, ListStore};

const LIST_PAGE_SIZE: i64 = 10_000;

/// A named work queue over the backplane list store.
///
/// The queue outlives this handle: two queues constructed with the same name
/// against the same store are the same underlying queue.
pub struct WorkQueue {
    store: Arc<dyn ListStore>,
    name: QueueName,
}

impl WorkQueue {
    /// Bind a queue handle to a store and base name.
    pub fn new(store: Arc<dyn ListStore>, name: QueueName) -> Self {
        Self { store, name }
    }

    /// Base name of the pending list.
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Name of the in-flight sibling list.
    pub fn dequeue_name(&self) -> String {
        self.name.dequeue_name()
    }

    /// Append `value` to the pending list.
    pub async fn push(&self, value: &str) -> Result<()> {
        self.push_with_priority(value, 1.0).await
    }

    /// Append `value` to the pending list.
    ///
    /// This queue is the FIFO variant: `priority` is accepted for call-site
    /// compatibility with score-ordered queue types and ignored.
    pub async fn push_with_priority(&self, value: &str, _priority: f64) -> Result<()> {
        self.store.push_head(self.name.as_str(), value).await
    }

    /// Atomically move the oldest pending entry into the in-flight list and
    /// return it, without waiting.
    ///
    /// A move that races an already-cancelled token still wins: the entry
    /// was transferred and must be delivered so it can be acknowledged
    /// later. `Cancelled` is raised only when nothing moved.
    pub async fn non_blocking_dequeue(&self, token: &CancellationToken) -> Result<Option<String>> {
        let started = Instant::now();
        let moved = self
            .store
            .move_one(
                self.name.as_str(),
                &self.dequeue_name(),
                Direction::Right,
                Direction::Left,
            )
            .await;
        self.record_dequeue(&moved, started);
        let moved = moved?;
        if moved.is_some() {
            return Ok(moved);
        }
        if token.is_cancelled() {
            return Err(FfxError::cancelled());
        }
        Ok(None)
    }

    /// Atomically move the oldest pending entry into the in-flight list,
    /// waiting up to `timeout` for one to arrive. Returns `None` on timeout.
    ///
    /// A zero timeout degenerates to [`WorkQueue::non_blocking_dequeue`].
    /// Cancelling `token` during the wait disconnects the store to unblock
    /// the server side and raises `Cancelled`; a failure on that disconnect
    /// path is attached to the cancellation as a suppressed error.
    pub async fn dequeue(
        &self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        if timeout.is_zero() {
            return self.non_blocking_dequeue(token).await;
        }
        let started = Instant::now();
        let store = Arc::clone(&self.store);
        let src = self.name.as_str().to_string();
        let dst = self.dequeue_name();
        let reply = tokio::spawn(async move {
            store
                .blocking_move_one(&src, &dst, Direction::Right, Direction::Left, timeout)
                .await
        });
        let out = self.blocking_reply(reply, token).await;
        self.record_dequeue(&out, started);
        out
    }

    /// Wait on the helper task, honoring caller cancellation.
    async fn blocking_reply(
        &self,
        mut reply: JoinHandle<Result<Option<String>>>,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        tokio::select! {
            res = &mut reply => join_reply(res),
            _ = token.cancelled() => {
                debug!(queue = %self.name, "dequeue cancelled; disconnecting store");
                self.store.disconnect().await;
                match reply.await {
                    // The reply won the race; deliver it. The token stays
                    // cancelled, so the caller observes the interrupt on its
                    // next suspension point.
                    Ok(Ok(Some(val))) => Ok(Some(val)),
                    Ok(Ok(None)) => Err(FfxError::cancelled()),
                    Ok(Err(e)) => Err(FfxError::cancelled().suppressing(e)),
                    Err(join) => Err(FfxError::cancelled()
                        .suppressing(FfxError::Fatal(format!("dequeue helper failed: {join}")))),
                }
            }
        }
    }

    /// Remove one occurrence of `value` from the in-flight list, scanning
    /// from the tail. This is the acknowledgement step after the entry has
    /// been durably committed.
    pub async fn remove_from_dequeue(&self, value: &str) -> Result<bool> {
        let removed = self.store.remove(&self.dequeue_name(), -1, value).await?;
        Ok(removed != 0)
    }

    /// Remove every occurrence of `value` from the pending list.
    pub async fn remove_all(&self, value: &str) -> Result<bool> {
        let removed = self.store.remove(self.name.as_str(), 0, value).await?;
        Ok(removed != 0)
    }

    /// Length of the pending list.
    pub async fn size(&self) -> Result<u64> {
        self.store.len(self.name.as_str()).await
    }

    /// Visit every entry of the pending list in order.
    ///
    /// Paged, not a snapshot: the cursor advances by the size of the last
    /// returned page, so concurrent mutation can skip or repeat entries.
    pub async fn visit<V: FnMut(&str)>(&self, visitor: &mut V) -> Result<()> {
        self.visit_list(self.name.as_str(), visitor).await
    }

    /// Visit every entry of the in-flight list in order; same paging
    /// semantics as [`WorkQueue::visit`].
    pub async fn visit_dequeue<V: FnMut(&str)>(&self, visitor: &mut V) -> Result<()> {
        self.visit_list(&self.dequeue_name(), visitor).await
    }

    async fn visit_list<V: FnMut(&str)>(&self, key: &str, visitor: &mut V) -> Result<()> {
        let mut index = 0_i64;
        let mut next_index = LIST_PAGE_SIZE;
        loop {
            let entries = self.store.range(key, index, next_index - 1).await?;
            for entry in &entries {
                visitor(entry);
            }
            index = next_index;
            next_index += entries.len() as i64;
            if entries.len() as i64 != LIST_PAGE_SIZE {
                return Ok(());
            }
        }
    }

    fn record_dequeue(&self, out: &Result<Option<String>>, started: Instant) {
        let outcome = match out {
            Ok(Some(_)) => "hit",
            Ok(None) => "empty",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "transient",
        };
        global_metrics().record_dequeue(
            self.name.as_str(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
    }
}

fn join_reply(
    res: std::result::Result<Result<Option<String>>, tokio::task::JoinError>,
) -> Result<Option<String>> {
    match res {
        Ok(reply) => reply,
        Err(join) => Err(FfxError::Fatal(format!("dequeue helper failed: {join}"))),
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
