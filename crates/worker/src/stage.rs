//! Pipeline stage capability set and generic stage runtime.
//!
//! A stage exposes `{claim, release, put, interrupt}` to its predecessor and
//! drives its own take loop. Superscalar behavior is composed from an
//! embedded [`Admission`] controller rather than inherited: a width-1 stage
//! and a width-N stage are the same runtime with different admission widths.
//!
//! Claims flow forward then backward: the successor's slots are claimed
//! before a transfer finalizes, and released when the successor's handler
//! finishes with the operation or the transfer is rejected. Every successful
//! `claim` pairs with exactly one `put` or one `release`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use ffx_common::metrics::global_metrics;
use ffx_common::{FfxError, Result};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::Admission;
use crate::context::{OperationContext, OperationContextBuilder};

/// A `put` that could not complete; the context is returned to the caller.
pub struct PutRejection {
    /// Why the transfer failed.
    pub error: FfxError,
    /// The context that was not transferred.
    pub ctx: OperationContext,
}

/// Capabilities a stage exposes to its predecessor and to the driver.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stage name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Reserve capacity for `ctx`, waiting until granted. Returns false only
    /// when the stage is terminated; cancelling `caller` mid-wait raises
    /// `Cancelled` with all partially taken slots released.
    async fn claim(&self, ctx: &OperationContext, caller: &CancellationToken) -> Result<bool>;

    /// Return a previously granted claim without transferring an operation.
    fn release(&self, ctx: &OperationContext);

    /// Deposit `ctx` into the stage's input slot. Must be preceded by a
    /// successful `claim` for the same context.
    async fn put(
        &self,
        ctx: OperationContext,
        caller: &CancellationToken,
    ) -> std::result::Result<(), PutRejection>;

    /// Cancel the stage's workers and unblock its suspension points.
    fn interrupt(&self);

    /// Whether the stage holds no claims and its input slot is empty.
    fn is_drained(&self) -> bool;
}

/// Stage-specific work run against the operation context.
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Slots this operation needs in the stage's admission controller.
    fn claims_required(&self, _ctx: &OperationContext) -> usize {
        1
    }

    /// Perform the stage's work, mutating the context in place.
    async fn handle(&self, ctx: &mut OperationContextBuilder) -> Result<()>;
}

/// One-deep handoff slot between a stage and its predecessor.
pub(crate) struct Handoff {
    slot: std::sync::Mutex<Option<OperationContext>>,
    changed: Notify,
}

impl Handoff {
    pub(crate) fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
            changed: Notify::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slot.lock().expect("handoff slot").is_none()
    }

    pub(crate) async fn put(
        &self,
        ctx: OperationContext,
        token: &CancellationToken,
    ) -> std::result::Result<(), PutRejection> {
        let mut ctx = Some(ctx);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if token.is_cancelled() {
                return Err(PutRejection {
                    error: FfxError::cancelled(),
                    ctx: ctx.take().expect("context not yet deposited"),
                });
            }
            {
                let mut slot = self.slot.lock().expect("handoff slot");
                if slot.is_none() {
                    *slot = ctx.take();
                }
            }
            if ctx.is_none() {
                self.changed.notify_waiters();
                return Ok(());
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => {
                    return Err(PutRejection {
                        error: FfxError::cancelled(),
                        ctx: ctx.take().expect("context not yet deposited"),
                    });
                }
            }
        }
    }

    pub(crate) async fn take(&self, token: &CancellationToken) -> Result<OperationContext> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if token.is_cancelled() {
                return Err(FfxError::cancelled());
            }
            if let Some(ctx) = self.slot.lock().expect("handoff slot").take() {
                self.changed.notify_waiters();
                return Ok(ctx);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = token.cancelled() => return Err(FfxError::cancelled()),
            }
        }
    }
}

/// Generic stage runtime: an admission controller, a one-deep input slot,
/// and a take loop spawning one worker per admitted operation.
pub struct WorkStage<H: StageHandler> {
    handler: H,
    admission: Admission,
    input: Handoff,
    output: Option<Arc<dyn PipelineStage>>,
    error: Arc<dyn PipelineStage>,
    token: CancellationToken,
}

impl<H: StageHandler + 'static> WorkStage<H> {
    /// Build a stage with `width` admission slots. `output` is `None` for
    /// the terminal stage.
    pub fn new(
        handler: H,
        width: usize,
        output: Option<Arc<dyn PipelineStage>>,
        error: Arc<dyn PipelineStage>,
    ) -> Arc<Self> {
        let name = handler.name();
        Arc::new(Self {
            handler,
            admission: Admission::new(name, width),
            input: Handoff::new(),
            output,
            error,
            token: CancellationToken::new(),
        })
    }

    /// The stage's admission controller.
    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    fn claims_for(&self, ctx: &OperationContext) -> usize {
        self.handler.claims_required(ctx).max(1)
    }

    /// Take loop: consume the input slot in arrival order, one worker per
    /// admitted operation. Returns when interrupted; an `Err` is a fatal
    /// stage failure.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(stage = self.name(), width = self.admission.width(), "stage worker started");
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        let mut fatal: Option<FfxError> = None;
        loop {
            tokio::select! {
                taken = self.input.take(&self.token) => match taken {
                    Ok(ctx) => {
                        let stage = Arc::clone(&self);
                        workers.spawn(async move { stage.process(ctx).await });
                    }
                    Err(e) if e.is_cancelled() => break,
                    Err(e) => {
                        fatal = Some(e);
                        break;
                    }
                },
                // Resolves to None while no workers are in flight, which
                // disables this branch for the rest of the select.
                Some(joined) = workers.join_next() => {
                    if let Some(e) = worker_failure(self.name(), joined) {
                        self.token.cancel();
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Some(e) = worker_failure(self.name(), joined) {
                fatal.get_or_insert(e);
            }
        }
        info!(stage = self.name(), "stage worker stopped");
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Process one admitted operation: handle, forward, release claims.
    async fn process(&self, ctx: OperationContext) -> Result<()> {
        let claims = self.claims_for(&ctx);
        let operation = ctx.operation_name().to_string();
        let started = Instant::now();
        debug!(stage = self.name(), operation = %operation, claims, "operation entered stage");

        let mut builder = ctx.thaw();
        let handled = self.handler.handle(&mut builder).await;
        let ctx = builder.freeze();
        let result = match handled {
            Ok(()) => self.forward(ctx).await,
            Err(e) => {
                if e.is_cancelled() {
                    // Abandoned mid-flight; the queue entry stays in the
                    // in-flight list for the recovery sweep.
                    warn!(stage = self.name(), operation = %operation, "handler cancelled");
                } else {
                    error!(stage = self.name(), operation = %operation, error = %e, "stage handler failed");
                    self.route_error(ctx).await;
                }
                Err(e)
            }
        };

        let outcome = if result.is_ok() { "forwarded" } else { "errored" };
        global_metrics().record_stage_operation(
            self.name(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        self.admission.release(claims);

        match result {
            Err(e @ FfxError::Fatal(_)) => Err(e),
            _ => Ok(()),
        }
    }

    /// Hand the context to the successor, claiming its capacity first.
    async fn forward(&self, ctx: OperationContext) -> Result<()> {
        let Some(output) = &self.output else {
            // Terminal stage: the handler completed the operation and the
            // context is destroyed here.
            return Ok(());
        };
        match output.claim(&ctx, &self.token).await {
            Ok(true) => match output.put(ctx, &self.token).await {
                Ok(()) => Ok(()),
                Err(rejection) => {
                    output.release(&rejection.ctx);
                    self.route_error(rejection.ctx).await;
                    Err(rejection.error)
                }
            },
            Ok(false) => {
                // Successor terminated while we held work for it.
                self.route_error(ctx).await;
                Err(FfxError::cancelled())
            }
            Err(e) => {
                self.route_error(ctx).await;
                Err(e)
            }
        }
    }

    /// Route a failed context to the error sink.
    async fn route_error(&self, ctx: OperationContext) {
        let operation = ctx.operation_name().to_string();
        // The error sink accepts unconditionally and never blocks on a
        // cancelled caller.
        let token = CancellationToken::new();
        match self.error.claim(&ctx, &token).await {
            Ok(true) => {
                if let Err(rejection) = self.error.put(ctx, &token).await {
                    warn!(
                        stage = self.name(),
                        operation = %operation,
                        error = %rejection.error,
                        "error sink rejected context"
                    );
                }
            }
            _ => warn!(stage = self.name(), operation = %operation, "error sink unavailable"),
        }
    }
}

#[async_trait]
impl<H: StageHandler + 'static> PipelineStage for WorkStage<H> {
    fn name(&self) -> &'static str {
        self.handler.name()
    }

    async fn claim(&self, ctx: &OperationContext, caller: &CancellationToken) -> Result<bool> {
        if self.token.is_cancelled() {
            return Ok(false);
        }
        let claims = self.claims_for(ctx);
        tokio::select! {
            res = self.admission.acquire(claims, caller) => res.map(|()| true),
            _ = self.token.cancelled() => Ok(false),
        }
    }

    fn release(&self, ctx: &OperationContext) {
        self.admission.release(self.claims_for(ctx));
    }

    async fn put(
        &self,
        ctx: OperationContext,
        caller: &CancellationToken,
    ) -> std::result::Result<(), PutRejection> {
        self.input.put(ctx, caller).await
    }

    fn interrupt(&self) {
        self.token.cancel();
    }

    fn is_drained(&self) -> bool {
        !self.admission.is_claimed() && self.input.is_empty()
    }
}

/// Terminal error stage: accepts unconditionally, releases the context's
/// resources, and leaves the queue entry in flight for the recovery sweep.
pub struct ErrorSink;

#[async_trait]
impl PipelineStage for ErrorSink {
    fn name(&self) -> &'static str {
        "ErrorSink"
    }

    async fn claim(&self, _ctx: &OperationContext, _caller: &CancellationToken) -> Result<bool> {
        Ok(true)
    }

    fn release(&self, _ctx: &OperationContext) {}

    async fn put(
        &self,
        ctx: OperationContext,
        _caller: &CancellationToken,
    ) -> std::result::Result<(), PutRejection> {
        error!(
            operation = ctx.operation_name(),
            "operation routed to error sink; entry left in flight for recovery"
        );
        if let Some(poller) = &ctx.poller {
            poller.terminate();
        }
        Ok(())
    }

    fn interrupt(&self) {}

    fn is_drained(&self) -> bool {
        true
    }
}

fn worker_failure(
    stage: &'static str,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) -> Option<FfxError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(join) if join.is_cancelled() => None,
        Err(join) => {
            error!(stage, error = %join, "stage worker panicked");
            Some(FfxError::Fatal(format!("stage worker panicked: {join}")))
        }
    }
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
