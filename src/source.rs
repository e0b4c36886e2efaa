//! Work source: turns queue messages into engine tasks, one per refill.
//!
//! The source holds the queue client and the resolved queue name and nothing
//! else. Each refill fetches at most once and submits at most once. Fetches
//! are serialized, so triggers that fire together never pull the same
//! message twice.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::{Envelope, Task};
use crate::queue::QueueClient;

/// Suffix of the queue name derived from a component identifier.
pub const DEFAULT_QUEUE_SUFFIX: &str = "start_urls";

/// Resolve the queue to read from: the explicit name if given, otherwise
/// `"<identifier>:start_urls"`.
pub fn resolve_queue_name(explicit: Option<&str>, identifier: &str) -> String {
    match explicit {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{identifier}:{DEFAULT_QUEUE_SUFFIX}"),
    }
}

/// Settings a work source is configured from.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    /// Component identifier, used to derive the queue name when none is given.
    pub identifier: String,
    pub queue_name: Option<String>,
    /// Upper bound on a single fetch round trip.
    pub fetch_timeout: Duration,
}

impl SourceSettings {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            queue_name: None,
            fetch_timeout: Duration::from_secs(5),
        }
    }

    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }
}

/// Supplies at most one task per refill from a named queue.
pub struct WorkSource {
    client: Arc<dyn QueueClient>,
    queue: String,
    fetch_timeout: Duration,
    fetch_lock: Mutex<()>,
}

impl WorkSource {
    /// Resolve the queue name and open the queue client through `factory`.
    ///
    /// A factory failure is returned as-is: the source cannot operate without
    /// a connection.
    pub async fn configure<F, Fut>(settings: SourceSettings, factory: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn QueueClient>>>,
    {
        let queue = resolve_queue_name(settings.queue_name.as_deref(), &settings.identifier);
        let client = factory().await?;
        debug!(queue = %queue, identifier = %settings.identifier, "work source configured");
        Ok(Self::new(client, queue, settings.fetch_timeout))
    }

    /// Build a source around an already-open client.
    pub fn new(client: Arc<dyn QueueClient>, queue: impl Into<String>, fetch_timeout: Duration) -> Self {
        Self {
            client,
            queue: queue.into(),
            fetch_timeout,
            fetch_lock: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Perform exactly one fetch. `Ok(None)` means the queue is empty right
    /// now, which is the normal state between enqueues.
    ///
    /// A fetch that outlives `fetch_timeout` is reported as
    /// [`Error::FetchTimeout`] rather than as an empty queue. The broker call
    /// itself keeps running in the background; a message it still returns is
    /// rejected with requeue.
    pub async fn fetch_one(&self) -> Result<Option<Task>> {
        let _guard = self.fetch_lock.lock().await;

        let mut fetch = {
            let client = Arc::clone(&self.client);
            let queue = self.queue.clone();
            tokio::spawn(async move { client.fetch(&queue).await })
        };

        let fetched = match tokio::time::timeout(self.fetch_timeout, &mut fetch).await {
            Ok(joined) => joined
                .map_err(|e| Error::queue(&self.queue, format!("fetch task failed: {e}")))??,
            Err(_) => {
                warn!(queue = %self.queue, "fetch timed out");
                self.requeue_late(fetch);
                return Err(Error::FetchTimeout {
                    queue: self.queue.clone(),
                    timeout_ms: self.fetch_timeout.as_millis() as u64,
                });
            }
        };

        Ok(fetched.map(|envelope| {
            debug!(
                queue = %self.queue,
                delivery_tag = %envelope.delivery_tag,
                bytes = envelope.payload.len(),
                "fetched message"
            );
            Task::from_envelope(&self.queue, envelope)
        }))
    }

    /// Wait out an abandoned fetch and give back whatever it returns.
    fn requeue_late(&self, fetch: JoinHandle<Result<Option<Envelope>>>) {
        let client = Arc::clone(&self.client);
        let queue = self.queue.clone();
        tokio::spawn(async move {
            match fetch.await {
                Ok(Ok(Some(envelope))) => {
                    let tag = envelope.delivery_tag;
                    warn!(
                        queue = %queue,
                        delivery_tag = %tag,
                        "late fetch returned a message, requeueing"
                    );
                    if let Err(e) = client.reject(&queue, &tag, true).await {
                        error!(
                            queue = %queue,
                            delivery_tag = %tag,
                            error = %e,
                            "failed to requeue late message"
                        );
                    }
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => debug!(queue = %queue, error = %e, "abandoned fetch failed"),
                Err(e) => warn!(queue = %queue, error = %e, "abandoned fetch task failed"),
            }
        });
    }

    /// Fetch once and hand the task, if any, to `submit`. Returns the number
    /// of tasks submitted: 0 or 1.
    ///
    /// If `submit` refuses the task, the message is requeued before the
    /// error is returned so it is not left unacknowledged.
    pub async fn refill<F>(&self, submit: F) -> Result<usize>
    where
        F: FnOnce(Task) -> Result<()>,
    {
        let Some(task) = self.fetch_one().await? else {
            return Ok(0);
        };

        let ack = task.ack_context().clone();
        if let Err(e) = submit(task) {
            warn!(
                queue = %ack.queue,
                delivery_tag = %ack.delivery_tag,
                error = %e,
                "submission refused, requeueing message"
            );
            self.client
                .reject(&ack.queue, &ack.delivery_tag, true)
                .await?;
            return Err(e);
        }
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_queue_name_wins() {
        assert_eq!(resolve_queue_name(Some("urls"), "crawler1"), "urls");
    }

    #[test]
    fn missing_queue_name_derives_from_identifier() {
        assert_eq!(resolve_queue_name(None, "crawler1"), "crawler1:start_urls");
        assert_eq!(resolve_queue_name(Some(""), "crawler1"), "crawler1:start_urls");
    }
}
