use super::*;
use crate::admission::Admission;
use crate::stage::{ErrorSink, PutRejection};
use crate::worker_context::QueueWorkerContext;
use ffx_backplane::poller::PollerState;
use ffx_backplane::queue::WorkQueue;
use ffx_backplane::store::{ListStore, MemoryListStore};
use ffx_common::api::{Digest, Platform, RequestMetadata};
use ffx_common::ids::{QueueName, WorkerId};
use ffx_common::BackplaneConfig;

const QUEUE: &str = "{ops}:test";

struct CaptureStage {
    admission: Admission,
    received: std::sync::Mutex<Vec<OperationContext>>,
}

impl CaptureStage {
    fn new() -> Self {
        Self {
            admission: Admission::new("CaptureStage", 1),
            received: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PipelineStage for CaptureStage {
    fn name(&self) -> &'static str {
        "CaptureStage"
    }

    async fn claim(&self, _ctx: &OperationContext, caller: &CancellationToken) -> Result<bool> {
        self.admission.acquire(1, caller).await.map(|()| true)
    }

    fn release(&self, _ctx: &OperationContext) {
        self.admission.release(1);
    }

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
        !self.admission.is_claimed()
    }
}

fn sample_entry(operation_name: &str) -> QueueEntry {
    QueueEntry {
        execute_entry: ExecuteEntry {
            operation_name: operation_name.to_string(),
            action_digest: Digest::new("1f2e3d", 42),
            stdout_stream_name: format!("{operation_name}/streams/stdout"),
            stderr_stream_name: format!("{operation_name}/streams/stderr"),
            queued_timestamp: SystemTime::now(),
            request_metadata: RequestMetadata::default(),
        },
        queued_operation_digest: Digest::new("ab54a98c", 128),
        platform: Platform::default(),
    }
}

fn harness() -> (
    Arc<MemoryListStore>,
    QueueWorkerContext,
    Arc<MatchStage>,
    Arc<CaptureStage>,
) {
    let store = Arc::new(MemoryListStore::new());
    let config = BackplaneConfig {
        url: String::new(),
        queue_name: QUEUE.to_string(),
        dequeue_timeout_ms: 50,
        poller_period_ms: 10_000,
    };
    let queue = WorkQueue::new(
        Arc::clone(&store) as Arc<dyn ListStore>,
        QueueName::from(QUEUE),
    );
    let worker_context = QueueWorkerContext::new(WorkerId::from("test-worker"), queue, &config);
    let capture = Arc::new(CaptureStage::new());
    let stage = MatchStage::new(
        Arc::new(worker_context.clone()),
        Arc::clone(&capture) as Arc<dyn PipelineStage>,
        Arc::new(ErrorSink),
    );
    (store, worker_context, stage, capture)
}

async fn push_entry(store: &MemoryListStore, entry: &QueueEntry) {
    let payload = serde_json::to_string(entry).expect("encode entry");
    store.push_head(QUEUE, &payload).await.expect("push entry");
}

#[tokio::test]
async fn graceful_shutdown_consumes_nothing() {
    let (store, _worker_context, stage, capture) = harness();
    push_entry(&store, &sample_entry("op-1")).await;
    push_entry(&store, &sample_entry("op-2")).await;

    stage.prepare_for_graceful_shutdown();
    let runner = tokio::spawn(Arc::clone(&stage).run());
    tokio::time::sleep(Duration::from_millis(100)).await;
    stage.interrupt();
    runner.await.expect("join").expect("run");

    assert_eq!(store.len(QUEUE).await.expect("pending"), 2);
    assert_eq!(
        store.len("{ops}:test_dequeue").await.expect("in-flight"),
        0
    );
    assert!(capture.received.lock().expect("received").is_empty());
    assert!(!capture.admission.is_claimed());
}

#[tokio::test]
async fn match_seeds_and_forwards_operation_metadata() {
    let (store, worker_context, stage, capture) = harness();
    let entry = sample_entry("op-7");
    push_entry(&store, &entry).await;

    stage.iterate().await.expect("iterate");

    let ctx = capture
        .received
        .lock()
        .expect("received")
        .pop()
        .expect("forwarded context");
    assert_eq!(ctx.operation.name, "op-7");
    assert_eq!(
        ctx.metadata.queued_operation_digest,
        entry.queued_operation_digest
    );
    let metadata = &ctx.metadata.execute_operation_metadata;
    assert_eq!(metadata.stage, ExecutionStage::Queued);
    assert_eq!(metadata.action_digest, entry.execute_entry.action_digest);
    assert_eq!(
        metadata.stdout_stream_name,
        entry.execute_entry.stdout_stream_name
    );
    let partial = metadata
        .partial_execution_metadata
        .as_ref()
        .expect("partial execution metadata");
    assert_eq!(partial.worker, "test-worker");
    assert_eq!(
        partial.queued_timestamp,
        Some(entry.execute_entry.queued_timestamp)
    );
    assert!(partial.worker_start_timestamp.is_some());

    // The poller was installed and paused before the handoff.
    let poller = ctx.poller.as_ref().expect("poller installed");
    assert_eq!(poller.state(), PollerState::Paused);

    // The entry moved to the in-flight list and awaits acknowledgement.
    assert_eq!(store.len(QUEUE).await.expect("pending"), 0);
    assert_eq!(
        store.len("{ops}:test_dequeue").await.expect("in-flight"),
        1
    );

    // A QUEUED operation update was recorded.
    let operation = worker_context.operation("op-7").expect("operation update");
    assert!(!operation.done);

    // The downstream claim is retained until its handler finishes.
    assert!(capture.admission.is_claimed());
}

#[tokio::test]
async fn unmatched_attempt_releases_downstream_claim() {
    let (store, _worker_context, stage, capture) = harness();

    stage.iterate().await.expect("iterate");

    assert!(capture.received.lock().expect("received").is_empty());
    assert!(!capture.admission.is_claimed());
    assert_eq!(store.len(QUEUE).await.expect("pending"), 0);
}
