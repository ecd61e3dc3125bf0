use super::*;
use crate::store::MemoryListStore;
use std::collections::HashSet;

fn test_queue(store: &Arc<MemoryListStore>) -> WorkQueue {
    WorkQueue::new(
        Arc::clone(store) as Arc<dyn ListStore>,
        QueueName::from("{ops}:test"),
    )
}

#[tokio::test]
async fn dequeue_atomically_moves_oldest_into_dequeue_list() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    queue.push("A").await.expect("push A");
    queue.push("B").await.expect("push B");

    let token = CancellationToken::new();
    let val = queue
        .dequeue(Duration::from_millis(1_000), &token)
        .await
        .expect("dequeue");
    assert_eq!(val.as_deref(), Some("A"));
    assert_eq!(
        store.range("{ops}:test", 0, -1).await.expect("pending"),
        vec!["B"]
    );
    assert_eq!(
        store
            .range("{ops}:test_dequeue", 0, -1)
            .await
            .expect("in-flight"),
        vec!["A"]
    );

    assert!(queue.remove_from_dequeue("A").await.expect("ack"));
    assert!(store
        .range("{ops}:test_dequeue", 0, -1)
        .await
        .expect("in-flight")
        .is_empty());
    assert!(!queue.remove_from_dequeue("A").await.expect("second ack"));
}

#[tokio::test]
async fn dequeue_times_out_on_empty_queue() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    let token = CancellationToken::new();

    let started = Instant::now();
    let val = queue
        .dequeue(Duration::from_millis(50), &token)
        .await
        .expect("dequeue");
    let elapsed = started.elapsed();
    assert!(val.is_none());
    assert!(elapsed >= Duration::from_millis(50), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "returned late: {elapsed:?}");
}

#[tokio::test]
async fn dequeue_returns_entry_pushed_during_wait() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    let token = CancellationToken::new();

    let pusher = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.push_head("{ops}:test", "late").await.expect("push");
        })
    };

    let started = Instant::now();
    let val = queue
        .dequeue(Duration::from_millis(1_000), &token)
        .await
        .expect("dequeue");
    assert_eq!(val.as_deref(), Some("late"));
    assert!(started.elapsed() < Duration::from_millis(500));
    pusher.await.expect("pusher");
}

#[tokio::test]
async fn cancelled_dequeue_disconnects_and_moves_nothing() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        })
    };

    let started = Instant::now();
    let err = queue
        .dequeue(Duration::from_millis(5_000), &token)
        .await
        .expect_err("cancelled");
    let elapsed = started.elapsed();
    assert!(err.is_cancelled());
    assert!(elapsed < Duration::from_millis(200), "cancel was slow: {elapsed:?}");
    // The disconnect surfaced through the helper and was collected as the
    // suppressed failure.
    match err {
        FfxError::Cancelled { suppressed } => {
            let inner = *suppressed.expect("disconnect failure collected");
            assert!(matches!(inner, FfxError::Transient(_)), "unexpected: {inner:?}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.len("{ops}:test").await.expect("pending"), 0);
    assert_eq!(store.len("{ops}:test_dequeue").await.expect("in-flight"), 0);
    canceller.await.expect("canceller");
}

#[tokio::test]
async fn zero_timeout_degenerates_to_non_blocking() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    let token = CancellationToken::new();

    let started = Instant::now();
    let val = queue.dequeue(Duration::ZERO, &token).await.expect("dequeue");
    assert!(val.is_none());
    assert!(started.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn raced_cancel_still_delivers_successful_move() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    queue.push("A").await.expect("push");

    let token = CancellationToken::new();
    token.cancel();
    let val = queue
        .non_blocking_dequeue(&token)
        .await
        .expect("move wins over pending cancel");
    assert_eq!(val.as_deref(), Some("A"));
    assert!(token.is_cancelled(), "cancellation stays asserted");

    // Nothing left to move: now the cancellation surfaces.
    let err = queue
        .non_blocking_dequeue(&token)
        .await
        .expect_err("cancelled");
    assert!(err.is_cancelled());
    // The delivered entry still sits in the in-flight list awaiting ack.
    assert_eq!(store.len("{ops}:test_dequeue").await.expect("in-flight"), 1);
}

#[tokio::test]
async fn remove_all_clears_every_pending_occurrence() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    queue.push("X").await.expect("push");
    queue.push("Y").await.expect("push");
    queue.push("X").await.expect("push");

    assert!(queue.remove_all("X").await.expect("remove"));
    assert_eq!(queue.size().await.expect("size"), 1);
    assert_eq!(
        store.range("{ops}:test", 0, -1).await.expect("pending"),
        vec!["Y"]
    );
    assert!(!queue.remove_all("X").await.expect("second remove"));
}

#[tokio::test]
async fn visit_pages_through_every_entry_exactly_once() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    let total = 10_050_usize;
    for i in 0..total {
        queue.push(&format!("e{i}")).await.expect("push");
    }

    let mut seen = Vec::new();
    queue
        .visit(&mut |entry: &str| seen.push(entry.to_string()))
        .await
        .expect("visit");
    assert_eq!(seen.len(), total);
    let unique: HashSet<_> = seen.iter().collect();
    assert_eq!(unique.len(), total);
}

#[tokio::test]
async fn visit_dequeue_exposes_in_flight_entries_for_recovery() {
    let store = Arc::new(MemoryListStore::new());
    let queue = test_queue(&store);
    queue.push("A").await.expect("push");
    queue.push("B").await.expect("push");
    let token = CancellationToken::new();
    queue.non_blocking_dequeue(&token).await.expect("dequeue");
    queue.non_blocking_dequeue(&token).await.expect("dequeue");

    let mut in_flight = Vec::new();
    queue
        .visit_dequeue(&mut |entry: &str| in_flight.push(entry.to_string()))
        .await
        .expect("visit dequeue");
    assert_eq!(in_flight, vec!["B", "A"]);
    assert_eq!(queue.size().await.expect("size"), 0);
}
