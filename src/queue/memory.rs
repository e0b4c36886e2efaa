//! In-process queue with broker-like delivery semantics.
//!
//! Messages move from `ready` to `unacked` on fetch and leave for good on
//! ack. Rejecting with requeue puts them back at the head of the queue.
//! Used by the tests and for running the feed without a broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::{DeliveryTag, Envelope, MessageProperties};

use super::QueueClient;

#[derive(Debug, Clone)]
struct Stored {
    tag: DeliveryTag,
    payload: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct Inner {
    ready: HashMap<String, VecDeque<Stored>>,
    unacked: HashMap<DeliveryTag, (String, Stored)>,
    acked: Vec<DeliveryTag>,
    dropped: Vec<DeliveryTag>,
    extended: Vec<DeliveryTag>,
    next_tag: u64,
    fetches: usize,
    unavailable: bool,
}

impl Inner {
    fn next_tag(&mut self) -> DeliveryTag {
        self.next_tag += 1;
        DeliveryTag::from(self.next_tag)
    }
}

/// An in-memory broker.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a payload under an explicit delivery tag.
    pub fn push_tagged(&self, queue: &str, tag: impl Into<DeliveryTag>, payload: impl Into<Vec<u8>>) {
        let mut inner = self.lock();
        inner
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back(Stored {
                tag: tag.into(),
                payload: payload.into(),
                redelivered: false,
            });
    }

    /// Enqueue a payload under a generated delivery tag.
    pub fn push(&self, queue: &str, payload: impl Into<Vec<u8>>) -> DeliveryTag {
        let tag = self.lock().next_tag();
        self.push_tagged(queue, tag.clone(), payload);
        tag
    }

    /// Messages waiting to be fetched.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.lock().ready.get(queue).map_or(0, VecDeque::len)
    }

    /// Messages fetched but not yet settled.
    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.lock().acked.clone()
    }

    /// Messages rejected without requeue.
    pub fn dropped(&self) -> Vec<DeliveryTag> {
        self.lock().dropped.clone()
    }

    /// Visibility extensions received, in order.
    pub fn extended(&self) -> Vec<DeliveryTag> {
        self.lock().extended.clone()
    }

    /// Number of fetch calls served, empty or not.
    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    /// Simulate a dead connection: every operation fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn check_available(inner: &Inner, queue: &str) -> Result<()> {
        if inner.unavailable {
            return Err(Error::queue(queue, "connection unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::check_available(&inner, queue)?;
        inner.ready.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Envelope>> {
        let mut inner = self.lock();
        Self::check_available(&inner, queue)?;
        inner.fetches += 1;

        let Some(stored) = inner.ready.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };

        let envelope = Envelope {
            delivery_tag: stored.tag.clone(),
            properties: MessageProperties {
                content_type: None,
                headers: Default::default(),
                redelivered: stored.redelivered,
            },
            payload: stored.payload.clone(),
        };
        inner
            .unacked
            .insert(stored.tag.clone(), (queue.to_string(), stored));
        Ok(Some(envelope))
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        Self::check_available(&self.lock(), queue)?;
        self.push(queue, payload);
        Ok(())
    }

    async fn ack(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        let mut inner = self.lock();
        Self::check_available(&inner, queue)?;
        if inner.unacked.remove(tag).is_none() {
            return Err(Error::InvalidDeliveryTag(tag.to_string()));
        }
        inner.acked.push(tag.clone());
        Ok(())
    }

    async fn reject(&self, queue: &str, tag: &DeliveryTag, requeue: bool) -> Result<()> {
        let mut inner = self.lock();
        Self::check_available(&inner, queue)?;
        let Some((origin, mut stored)) = inner.unacked.remove(tag) else {
            return Err(Error::InvalidDeliveryTag(tag.to_string()));
        };
        if requeue {
            stored.redelivered = true;
            inner.ready.entry(origin).or_default().push_front(stored);
        } else {
            inner.dropped.push(tag.clone());
        }
        Ok(())
    }

    async fn extend_visibility(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        let mut inner = self.lock();
        Self::check_available(&inner, queue)?;
        if !inner.unacked.contains_key(tag) {
            return Err(Error::InvalidDeliveryTag(tag.to_string()));
        }
        inner.extended.push(tag.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_hides_message_until_settled() {
        let queue = MemoryQueue::new();
        queue.push_tagged("q", "T1", "http://a");

        let envelope = queue.fetch("q").await.unwrap().expect("one message");
        assert_eq!(envelope.delivery_tag.as_str(), "T1");
        assert_eq!(queue.ready_len("q"), 0);
        assert_eq!(queue.unacked_len(), 1);

        queue.ack("q", &envelope.delivery_tag).await.unwrap();
        assert_eq!(queue.unacked_len(), 0);
        assert_eq!(queue.acked(), vec![DeliveryTag::from("T1")]);
    }

    #[tokio::test]
    async fn requeue_marks_redelivered() {
        let queue = MemoryQueue::new();
        let tag = queue.push("q", "http://a");

        queue.fetch("q").await.unwrap().unwrap();
        queue.reject("q", &tag, true).await.unwrap();

        let again = queue.fetch("q").await.unwrap().unwrap();
        assert_eq!(again.delivery_tag, tag);
        assert!(again.properties.redelivered);
    }

    #[tokio::test]
    async fn unknown_tag_is_an_error() {
        let queue = MemoryQueue::new();
        let err = queue.ack("q", &DeliveryTag::from("nope")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDeliveryTag(_)));
    }
}
