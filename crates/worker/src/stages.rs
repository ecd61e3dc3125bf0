//! Input fetch, execute, and report stage handlers.
//!
//! The handlers drive the stage-specific slice of the operation's lifecycle
//! and delegate the heavy lifting (CAS reads, sandboxed execution) to the
//! [`WorkerContext`]. The execute stage is the superscalar consumer: each
//! action claims as many slots as its `min-cores` platform property asks
//! for, clamped to the stage width.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use ffx_common::api::{ExecutedActionMetadata, ExecutionStage, QueueEntry};
use ffx_common::{FfxError, Result};
use tracing::{debug, warn};

use crate::context::{OperationContext, OperationContextBuilder};
use crate::stage::StageHandler;
use crate::worker_context::WorkerContext;

fn partial_metadata(ctx: &mut OperationContextBuilder) -> &mut ExecutedActionMetadata {
    ctx.metadata
        .execute_operation_metadata
        .partial_execution_metadata
        .get_or_insert_with(ExecutedActionMetadata::default)
}

fn require_entry(ctx: &OperationContextBuilder) -> Result<QueueEntry> {
    ctx.queue_entry
        .clone()
        .ok_or_else(|| FfxError::Fatal("operation context has no queue entry".to_string()))
}

/// Materializes action inputs ahead of execution.
pub struct InputFetchHandler {
    worker_context: Arc<dyn WorkerContext>,
}

impl InputFetchHandler {
    /// Build the handler over the hosting context.
    pub fn new(worker_context: Arc<dyn WorkerContext>) -> Self {
        Self { worker_context }
    }
}

#[async_trait]
impl StageHandler for InputFetchHandler {
    fn name(&self) -> &'static str {
        "InputFetchStage"
    }

    async fn handle(&self, ctx: &mut OperationContextBuilder) -> Result<()> {
        let entry = require_entry(ctx)?;
        if let Some(poller) = &ctx.poller {
            poller.resume(ExecutionStage::Queued);
        }
        partial_metadata(ctx).input_fetch_start_timestamp = Some(SystemTime::now());
        self.worker_context.fetch_inputs(&entry).await?;
        partial_metadata(ctx).input_fetch_completed_timestamp = Some(SystemTime::now());
        if let Some(poller) = &ctx.poller {
            poller.pause();
        }
        Ok(())
    }
}

/// Runs the action under the execution collaborator.
pub struct ExecuteActionHandler {
    worker_context: Arc<dyn WorkerContext>,
    width: usize,
}

impl ExecuteActionHandler {
    /// Build the handler; `width` bounds per-action core claims.
    pub fn new(worker_context: Arc<dyn WorkerContext>, width: usize) -> Self {
        Self {
            worker_context,
            width: width.max(1),
        }
    }
}

#[async_trait]
impl StageHandler for ExecuteActionHandler {
    fn name(&self) -> &'static str {
        "ExecuteActionStage"
    }

    fn claims_required(&self, ctx: &OperationContext) -> usize {
        ctx.queue_entry
            .as_ref()
            .and_then(|entry| entry.platform.min_cores())
            .unwrap_or(1)
            .clamp(1, self.width)
    }

    async fn handle(&self, ctx: &mut OperationContextBuilder) -> Result<()> {
        let entry = require_entry(ctx)?;
        if let Some(poller) = &ctx.poller {
            poller.resume(ExecutionStage::Executing);
        }
        ctx.metadata.execute_operation_metadata.stage = ExecutionStage::Executing;
        partial_metadata(ctx).execution_start_timestamp = Some(SystemTime::now());
        let exit_code = self.worker_context.execute_action(&entry).await?;
        ctx.exit_code = Some(exit_code);
        partial_metadata(ctx).execution_completed_timestamp = Some(SystemTime::now());
        if let Some(poller) = &ctx.poller {
            poller.pause();
        }
        debug!(
            operation = %entry.execute_entry.operation_name,
            exit_code,
            "action execution finished"
        );
        Ok(())
    }
}

/// Terminal stage: reports completion, acknowledges the queue entry, and
/// releases the context's resources.
pub struct ReportResultHandler {
    worker_context: Arc<dyn WorkerContext>,
}

impl ReportResultHandler {
    /// Build the handler over the hosting context.
    pub fn new(worker_context: Arc<dyn WorkerContext>) -> Self {
        Self { worker_context }
    }
}

#[async_trait]
impl StageHandler for ReportResultHandler {
    fn name(&self) -> &'static str {
        "ReportResultStage"
    }

    async fn handle(&self, ctx: &mut OperationContextBuilder) -> Result<()> {
        let entry = require_entry(ctx)?;
        partial_metadata(ctx).worker_completed_timestamp = Some(SystemTime::now());
        ctx.metadata.execute_operation_metadata.stage = ExecutionStage::Completed;
        ctx.operation.metadata = Some(ctx.metadata.clone());
        ctx.operation.done = true;

        if !self.worker_context.put_operation(&ctx.operation).await? {
            warn!(operation = %ctx.operation.name, "could not record operation completion");
        }
        // Acknowledgement comes after the durable completion update; a crash
        // before this line leaves the entry for the recovery sweep.
        if !self.worker_context.ack(&entry).await? {
            warn!(
                operation = %ctx.operation.name,
                "queue entry already acknowledged or swept"
            );
        }
        if let Some(poller) = ctx.poller.take() {
            poller.terminate();
        }
        Ok(())
    }
}
