//! Integration tests for the work source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use workfeed::error::{Error, Result};
use workfeed::model::{DeliveryTag, Envelope, Task};
use workfeed::queue::{MemoryQueue, QueueClient};
use workfeed::source::{SourceSettings, WorkSource};

const QUEUE: &str = "crawler1:start_urls";

fn test_source(queue: &Arc<MemoryQueue>) -> WorkSource {
    WorkSource::new(queue.clone(), QUEUE, Duration::from_secs(1))
}

// ---------------------------------------------------------------------------
// fetch_one
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fetch_one_wraps_message_and_hides_it() {
    let queue = Arc::new(MemoryQueue::new());
    queue.push_tagged(QUEUE, "T1", "http://a");
    let source = test_source(&queue);

    let task = source.fetch_one().await.unwrap().expect("should fetch a task");
    assert_eq!(task.target(), "http://a");
    assert_eq!(task.body(), b"http://a");
    assert_eq!(task.ack_context().delivery_tag, DeliveryTag::from("T1"));
    assert_eq!(task.ack_context().queue, QUEUE);

    // Removed from the visible queue, not peeked.
    assert_eq!(queue.ready_len(QUEUE), 0);
    assert_eq!(queue.unacked_len(), 1);
}

#[tokio::test]
async fn fetch_one_on_empty_queue_returns_none() {
    let queue = Arc::new(MemoryQueue::new());
    let source = test_source(&queue);

    assert!(source.fetch_one().await.unwrap().is_none());
    assert_eq!(queue.fetch_count(), 1);
}

#[tokio::test]
async fn broken_connection_is_an_error_not_an_empty_queue() {
    let queue = Arc::new(MemoryQueue::new());
    queue.set_unavailable(true);
    let source = test_source(&queue);

    let err = source.fetch_one().await.unwrap_err();
    assert!(matches!(err, Error::Queue { .. }), "got {err:?}");
}

struct StalledQueue;

#[async_trait]
impl QueueClient for StalledQueue {
    async fn ensure_queue(&self, _queue: &str) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, _queue: &str) -> Result<Option<Envelope>> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }

    async fn publish(&self, _queue: &str, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn ack(&self, _queue: &str, _tag: &DeliveryTag) -> Result<()> {
        Ok(())
    }

    async fn reject(&self, _queue: &str, _tag: &DeliveryTag, _requeue: bool) -> Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn blocking_fetch_is_cut_off_by_timeout() {
    let source = WorkSource::new(Arc::new(StalledQueue), QUEUE, Duration::from_millis(50));

    let err = source.fetch_one().await.unwrap_err();
    match err {
        Error::FetchTimeout { queue, timeout_ms } => {
            assert_eq!(queue, QUEUE);
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("expected FetchTimeout, got {other:?}"),
    }
}

/// Answers every fetch only after `delay`, like a broker reply that arrives
/// after the caller gave up.
struct SlowQueue {
    inner: Arc<MemoryQueue>,
    delay: Duration,
}

#[async_trait]
impl QueueClient for SlowQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.inner.ensure_queue(queue).await
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Envelope>> {
        tokio::time::sleep(self.delay).await;
        self.inner.fetch(queue).await
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        self.inner.publish(queue, payload).await
    }

    async fn ack(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        self.inner.ack(queue, tag).await
    }

    async fn reject(&self, queue: &str, tag: &DeliveryTag, requeue: bool) -> Result<()> {
        self.inner.reject(queue, tag, requeue).await
    }
}

#[tokio::test(start_paused = true)]
async fn message_returned_after_timeout_is_requeued() {
    let queue = Arc::new(MemoryQueue::new());
    queue.push_tagged(QUEUE, "T1", "http://a");
    let slow = Arc::new(SlowQueue {
        inner: queue.clone(),
        delay: Duration::from_millis(200),
    });
    let source = WorkSource::new(slow, QUEUE, Duration::from_millis(50));

    let err = source.fetch_one().await.unwrap_err();
    assert!(matches!(err, Error::FetchTimeout { .. }), "got {err:?}");

    // Let the abandoned fetch land and its requeue run.
    tokio::time::sleep(Duration::from_millis(300)).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert_eq!(queue.fetch_count(), 1);
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.ready_len(QUEUE), 1);

    // The next fetch sees it again, marked as redelivered.
    let envelope = queue.fetch(QUEUE).await.unwrap().expect("requeued message");
    assert_eq!(envelope.delivery_tag.as_str(), "T1");
    assert!(envelope.properties.redelivered);
}

// ---------------------------------------------------------------------------
// refill
// ---------------------------------------------------------------------------

#[tokio::test]
async fn refill_submits_one_then_nothing() {
    let queue = Arc::new(MemoryQueue::new());
    queue.push_tagged(QUEUE, "T1", "http://a");
    let source = test_source(&queue);

    let mut submitted: Vec<Task> = Vec::new();
    let count = source
        .refill(|task| {
            submitted.push(task);
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].target(), "http://a");
    assert_eq!(submitted[0].ack_context().delivery_tag.as_str(), "T1");

    let count = source
        .refill(|_| panic!("nothing should be submitted from an empty queue"))
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn refill_never_submits_more_than_one() {
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..5 {
        queue.push(QUEUE, format!("http://site/{i}"));
    }
    let source = test_source(&queue);

    let count = source.refill(|_| Ok(())).await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(queue.fetch_count(), 1);
    assert_eq!(queue.ready_len(QUEUE), 4);
}

#[tokio::test]
async fn refused_submission_requeues_the_message() {
    let queue = Arc::new(MemoryQueue::new());
    queue.push_tagged(QUEUE, "T1", "http://a");
    let source = test_source(&queue);

    let err = source.refill(|_| Err(Error::EngineClosed)).await.unwrap_err();
    assert!(matches!(err, Error::EngineClosed));
    assert_eq!(queue.unacked_len(), 0);
    assert_eq!(queue.ready_len(QUEUE), 1);
}

// ---------------------------------------------------------------------------
// configure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn configure_derives_queue_name_from_identifier() {
    let queue = Arc::new(MemoryQueue::new());
    let client: Arc<dyn QueueClient> = queue.clone();

    let source = WorkSource::configure(SourceSettings::new("crawler1"), || async { Ok(client) })
        .await
        .unwrap();
    assert_eq!(source.queue(), "crawler1:start_urls");
}

#[tokio::test]
async fn configure_prefers_explicit_queue_name() {
    let client: Arc<dyn QueueClient> = Arc::new(MemoryQueue::new());

    let settings = SourceSettings::new("crawler1").queue_name("frontier");
    let source = WorkSource::configure(settings, || async { Ok(client) })
        .await
        .unwrap();
    assert_eq!(source.queue(), "frontier");
}

#[tokio::test]
async fn configure_propagates_connection_failure() {
    let result = WorkSource::configure(SourceSettings::new("crawler1"), || async {
        Err(Error::Connection("broker down".to_string()))
    })
    .await;

    match result {
        Err(Error::Connection(message)) => assert_eq!(message, "broker down"),
        Err(other) => panic!("expected Connection, got {other:?}"),
        Ok(_) => panic!("configure should fail without a client"),
    }
}
