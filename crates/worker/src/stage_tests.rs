use super::*;
use std::time::Duration;

fn ctx_named(name: &str) -> OperationContext {
    let mut builder = OperationContext::default().thaw();
    builder.operation.name = name.to_string();
    builder.freeze()
}

struct NoopHandler;

#[async_trait]
impl StageHandler for NoopHandler {
    fn name(&self) -> &'static str {
        "NoopStage"
    }

    async fn handle(&self, _ctx: &mut OperationContextBuilder) -> Result<()> {
        Ok(())
    }
}

struct FailingHandler(fn() -> FfxError);

#[async_trait]
impl StageHandler for FailingHandler {
    fn name(&self) -> &'static str {
        "FailingStage"
    }

    async fn handle(&self, _ctx: &mut OperationContextBuilder) -> Result<()> {
        Err((self.0)())
    }
}

#[derive(Default)]
struct CaptureStage {
    received: std::sync::Mutex<Vec<OperationContext>>,
}

impl CaptureStage {
    fn names(&self) -> Vec<String> {
        self.received
            .lock()
            .expect("received")
            .iter()
            .map(|ctx| ctx.operation.name.clone())
            .collect()
    }
}

#[async_trait]
impl PipelineStage for CaptureStage {
    fn name(&self) -> &'static str {
        "CaptureStage"
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
        self.received.lock().expect("received").push(ctx);
        Ok(())
    }

    fn interrupt(&self) {}

    fn is_drained(&self) -> bool {
        true
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn interrupted_claim_releases_partial() {
    let admission = Arc::new(Admission::new("too-narrow", 3));
    let token = CancellationToken::new();

    // Once the stage is exhausted, cancel the claiming task.
    let interruptor = tokio::spawn({
        let admission = Arc::clone(&admission);
        let token = token.clone();
        async move {
            admission.wait_full().await;
            token.cancel();
        }
    });

    let err = admission
        .acquire(5, &token)
        .await
        .expect_err("a claim wider than the stage must cancel, not complete");
    assert!(err.is_cancelled());
    interruptor.await.expect("interruptor");
    assert!(!admission.is_claimed());
}

#[tokio::test]
async fn claims_block_until_capacity_is_released() {
    let admission = Arc::new(Admission::new("width-two", 2));
    let token = CancellationToken::new();
    admission.acquire(2, &token).await.expect("fill stage");
    assert!(admission.is_full());

    let waiter = tokio::spawn({
        let admission = Arc::clone(&admission);
        let token = token.clone();
        async move { admission.acquire(1, &token).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "claim must wait for capacity");

    admission.release(1);
    waiter.await.expect("join").expect("claim granted");
    assert_eq!(admission.held(), 2);
}

#[tokio::test]
async fn handoff_is_one_deep_and_ordered() {
    let handoff = Arc::new(Handoff::new());
    let token = CancellationToken::new();

    assert!(handoff.put(ctx_named("first"), &token).await.is_ok());
    let blocked = tokio::spawn({
        let handoff = Arc::clone(&handoff);
        let token = token.clone();
        async move { handoff.put(ctx_named("second"), &token).await.is_ok() }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!blocked.is_finished(), "second put must wait for the slot");

    let first = handoff.take(&token).await.expect("take first");
    assert_eq!(first.operation.name, "first");
    assert!(blocked.await.expect("join"), "second put completes");
    let second = handoff.take(&token).await.expect("take second");
    assert_eq!(second.operation.name, "second");
}

#[tokio::test]
async fn take_unblocks_on_interrupt() {
    let handoff = Arc::new(Handoff::new());
    let token = CancellationToken::new();

    let canceller = tokio::spawn({
        let token = token.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        }
    });
    let started = std::time::Instant::now();
    let err = handoff.take(&token).await.expect_err("cancelled");
    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_millis(200));
    canceller.await.expect("canceller");
}

#[tokio::test]
async fn terminated_stage_refuses_claims() {
    let stage = WorkStage::new(NoopHandler, 1, None, Arc::new(ErrorSink));
    stage.interrupt();
    let caller = CancellationToken::new();
    let granted = stage
        .claim(&ctx_named("late"), &caller)
        .await
        .expect("claim resolves");
    assert!(!granted);
}

#[tokio::test]
async fn stage_forwards_downstream_and_releases_claims() {
    let capture = Arc::new(CaptureStage::default());
    let stage = WorkStage::new(
        NoopHandler,
        2,
        Some(Arc::clone(&capture) as Arc<dyn PipelineStage>),
        Arc::new(ErrorSink),
    );
    let runner = tokio::spawn(Arc::clone(&stage).run());

    let caller = CancellationToken::new();
    let ctx = ctx_named("op-forward");
    assert!(stage.claim(&ctx, &caller).await.expect("claim"));
    assert!(stage.put(ctx, &caller).await.is_ok());

    wait_for("context to be forwarded", || {
        !capture.received.lock().expect("received").is_empty()
    })
    .await;
    assert_eq!(capture.names(), vec!["op-forward"]);
    wait_for("claims to be released", || !stage.admission().is_claimed()).await;
    assert!(stage.is_drained());

    stage.interrupt();
    runner.await.expect("join").expect("stage result");
}

#[tokio::test]
async fn handler_failure_routes_context_to_error_sink() {
    let output = Arc::new(CaptureStage::default());
    let errors = Arc::new(CaptureStage::default());
    let stage = WorkStage::new(
        FailingHandler(|| FfxError::Transient("input fetch failed".to_string())),
        1,
        Some(Arc::clone(&output) as Arc<dyn PipelineStage>),
        Arc::clone(&errors) as Arc<dyn PipelineStage>,
    );
    let runner = tokio::spawn(Arc::clone(&stage).run());

    let caller = CancellationToken::new();
    let ctx = ctx_named("op-doomed");
    assert!(stage.claim(&ctx, &caller).await.expect("claim"));
    assert!(stage.put(ctx, &caller).await.is_ok());

    wait_for("context to reach the error sink", || {
        !errors.received.lock().expect("received").is_empty()
    })
    .await;
    assert_eq!(errors.names(), vec!["op-doomed"]);
    assert!(output.received.lock().expect("received").is_empty());
    wait_for("claims to be released", || !stage.admission().is_claimed()).await;

    // A non-fatal failure leaves the stage alive for the next operation.
    assert!(stage.claim(&ctx_named("next"), &caller).await.expect("claim"));
    stage.release(&ctx_named("next"));

    stage.interrupt();
    runner.await.expect("join").expect("stage survives transient failure");
}

#[tokio::test]
async fn fatal_handler_failure_aborts_the_stage() {
    let errors = Arc::new(CaptureStage::default());
    let stage = WorkStage::new(
        FailingHandler(|| FfxError::Fatal("poller already installed".to_string())),
        1,
        None,
        Arc::clone(&errors) as Arc<dyn PipelineStage>,
    );
    let runner = tokio::spawn(Arc::clone(&stage).run());

    let caller = CancellationToken::new();
    let ctx = ctx_named("op-fatal");
    assert!(stage.claim(&ctx, &caller).await.expect("claim"));
    assert!(stage.put(ctx, &caller).await.is_ok());

    let result = runner.await.expect("join");
    let err = result.expect_err("fatal failure surfaces to the driver");
    assert!(matches!(err, FfxError::Fatal(_)));
    assert_eq!(errors.names(), vec!["op-fatal"]);
}
