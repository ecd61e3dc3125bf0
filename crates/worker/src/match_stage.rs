//! Entry stage: pulls one queue entry per iteration and seeds the pipeline.
//!
//! Each iteration claims the successor's capacity first, then asks the
//! worker context to match one queue entry. A matched entry seeds the
//! operation context (provenance digests, request metadata, a liveness
//! poller at QUEUED, partial execution metadata), records a best-effort
//! operation update, and forwards downstream. An unmatched attempt releases
//! the claim, so every successful claim pairs with exactly one put or
//! release.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use ffx_common::api::{
    ExecuteEntry, ExecutedActionMetadata, ExecutionStage, Operation, QueueEntry,
};
use ffx_common::metrics::global_metrics;
use ffx_common::{FfxError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::{OperationContext, OperationContextBuilder};
use crate::stage::PipelineStage;
use crate::worker_context::WorkerContext;

/// Callbacks delivered while the worker context matches one queue entry.
///
/// `on_entry` is reentrant into the pipeline: accepting an entry may forward
/// the matched context downstream and block on the successor's input slot.
#[async_trait]
pub trait MatchListener: Send {
    /// The matcher began waiting on the queue.
    fn on_wait_start(&mut self);

    /// The wait ended, with or without an entry.
    fn on_wait_end(&mut self);

    /// An entry arrived; `None` means the wait produced nothing. Returns
    /// whether the entry was accepted.
    async fn on_entry(&mut self, entry: Option<QueueEntry>) -> Result<bool>;
}

/// The pipeline's entry stage.
pub struct MatchStage {
    worker_context: Arc<dyn WorkerContext>,
    output: Arc<dyn PipelineStage>,
    error: Arc<dyn PipelineStage>,
    in_graceful_shutdown: AtomicBool,
    token: CancellationToken,
}

impl MatchStage {
    /// Build the stage in front of `output`, with failures routed to `error`.
    pub fn new(
        worker_context: Arc<dyn WorkerContext>,
        output: Arc<dyn PipelineStage>,
        error: Arc<dyn PipelineStage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            worker_context,
            output,
            error,
            in_graceful_shutdown: AtomicBool::new(false),
            token: CancellationToken::new(),
        })
    }

    /// Stop matching new work. In-flight matches complete and downstream
    /// stages keep draining.
    pub fn prepare_for_graceful_shutdown(&self) {
        self.in_graceful_shutdown.store(true, Ordering::SeqCst);
        info!("match stage entering graceful shutdown");
    }

    /// Cancel the stage's worker and unblock its suspension points.
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    /// Match loop. Returns when interrupted; an `Err` is fatal.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("match stage started");
        loop {
            if self.token.is_cancelled() {
                break;
            }
            match self.iterate().await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    error!(error = %e, "match stage failed");
                    return Err(e);
                }
            }
        }
        info!("match stage stopped");
        Ok(())
    }

    async fn iterate(&self) -> Result<()> {
        if self.in_graceful_shutdown.load(Ordering::SeqCst) {
            // Consume nothing; keep the loop responsive to interrupt.
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Ok(());
        }
        let stopwatch = Instant::now();
        let ctx = OperationContext::default();
        if !self.output.claim(&ctx, &self.token).await? {
            return Ok(());
        }
        let mut listener = MatchOperationListener {
            stage: self,
            ctx: Some(ctx.thaw()),
            stopwatch,
            wait_start: stopwatch.elapsed(),
            wait_duration: Duration::ZERO,
            matched: false,
        };
        let result = self
            .worker_context
            .match_action(&mut listener, &self.token)
            .await;
        if !listener.matched {
            // The claim was computed from an empty context; release with the
            // same shape.
            self.output.release(&OperationContext::default());
            global_metrics().record_match("unmatched");
        }
        match result {
            Err(e) if !e.is_cancelled() => {
                // Transport trouble; the next iteration retries against a
                // fresh connection.
                warn!(error = %e, "match attempt failed");
                Ok(())
            }
            other => other,
        }
    }

    /// Stamp partial execution metadata and record a best-effort operation
    /// update at QUEUED.
    async fn match_context(&self, ctx: &mut OperationContextBuilder, execute_entry: &ExecuteEntry) {
        let worker_start = SystemTime::now();
        let metadata = &mut ctx.metadata.execute_operation_metadata;
        metadata.action_digest = execute_entry.action_digest.clone();
        metadata.stage = ExecutionStage::Queued;
        metadata.stdout_stream_name = execute_entry.stdout_stream_name.clone();
        metadata.stderr_stream_name = execute_entry.stderr_stream_name.clone();
        metadata.partial_execution_metadata = Some(ExecutedActionMetadata {
            worker: self.worker_context.name().to_string(),
            queued_timestamp: Some(execute_entry.queued_timestamp),
            worker_start_timestamp: Some(worker_start),
            ..ExecutedActionMetadata::default()
        });

        let operation = Operation {
            name: execute_entry.operation_name.clone(),
            metadata: Some(ctx.metadata.clone()),
            done: false,
        };
        self.put_operation(&operation).await;
        ctx.operation = operation;
    }

    /// Best-effort operation update: failures are logged, never propagated.
    async fn put_operation(&self, operation: &Operation) {
        match self.worker_context.put_operation(operation).await {
            Ok(true) => {}
            Ok(false) => warn!(operation = %operation.name, "could not record operation update"),
            Err(e) => error!(operation = %operation.name, error = %e, "error putting operation"),
        }
    }
}

struct MatchOperationListener<'a> {
    stage: &'a MatchStage,
    ctx: Option<OperationContextBuilder>,
    stopwatch: Instant,
    wait_start: Duration,
    wait_duration: Duration,
    matched: bool,
}

#[async_trait]
impl MatchListener for MatchOperationListener<'_> {
    fn on_wait_start(&mut self) {
        self.wait_start = self.stopwatch.elapsed();
    }

    fn on_wait_end(&mut self) {
        let elapsed = self.stopwatch.elapsed();
        self.wait_duration += elapsed - self.wait_start;
        self.wait_start = elapsed;
    }

    async fn on_entry(&mut self, entry: Option<QueueEntry>) -> Result<bool> {
        let Some(entry) = entry else {
            return Ok(false);
        };
        let mut ctx = self
            .ctx
            .take()
            .ok_or_else(|| FfxError::Fatal("queue entry delivered twice".to_string()))?;
        if ctx.poller.is_some() {
            return Err(FfxError::Fatal("poller already installed".to_string()));
        }

        ctx.metadata.queued_operation_digest = entry.queued_operation_digest.clone();
        ctx.metadata.request_metadata = entry.execute_entry.request_metadata.clone();
        ctx.poller = Some(self.stage.worker_context.create_poller(
            "MatchStage",
            &entry,
            ExecutionStage::Queued,
        ));
        let execute_entry = entry.execute_entry.clone();
        ctx.queue_entry = Some(entry);
        self.on_operation_polled(ctx, execute_entry).await?;
        Ok(true)
    }
}

impl MatchOperationListener<'_> {
    async fn on_operation_polled(
        &mut self,
        mut ctx: OperationContextBuilder,
        execute_entry: ExecuteEntry,
    ) -> Result<()> {
        let matching_at = self.stopwatch.elapsed();
        self.stage.match_context(&mut ctx, &execute_entry).await;
        let matched_in = self.stopwatch.elapsed() - matching_at;
        info!(
            operation = %execute_entry.operation_name,
            matched_us = matched_in.as_micros() as u64,
            waited_us = self.wait_duration.as_micros() as u64,
            "operation matched"
        );
        if let Some(poller) = &ctx.poller {
            poller.pause();
        }
        match self.stage.output.put(ctx.freeze(), &self.stage.token).await {
            Ok(()) => {
                self.matched = true;
                global_metrics().record_match("matched");
                Ok(())
            }
            Err(rejection) => {
                // Forwarding was interrupted; surrender the context to the
                // error sink and re-raise. The unclaimed slot is released by
                // iterate since the listener never matched.
                let fresh = CancellationToken::new();
                if self
                    .stage
                    .error
                    .claim(&rejection.ctx, &fresh)
                    .await
                    .unwrap_or(false)
                {
                    let _ = self.stage.error.put(rejection.ctx, &fresh).await;
                }
                Err(rejection.error)
            }
        }
    }
}

#[cfg(test)]
#[path = "match_stage_tests.rs"]
mod tests;
