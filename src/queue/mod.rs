//! Queue client port and broker adapters.
//!
//! The feed only ever needs a handful of operations from a broker: get one
//! message without waiting, and settle it later by delivery tag. Each adapter
//! maps those onto its broker's native calls.

pub mod amqp;
pub mod memory;
pub mod pgmq;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{Error, Result};
use crate::model::{DeliveryTag, Envelope};

pub use self::amqp::AmqpQueue;
pub use self::memory::MemoryQueue;
pub use self::pgmq::PgmqQueue;

/// A broker connection exposing single-message, non-blocking gets.
///
/// Implementations must tolerate sequential reuse from several triggers.
/// A fetched message stays invisible to other consumers and unacknowledged
/// until [`ack`](QueueClient::ack) or [`reject`](QueueClient::reject).
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Declare the queue if it does not exist (idempotent).
    async fn ensure_queue(&self, queue: &str) -> Result<()>;

    /// Get one message, or `None` if the queue is currently empty.
    async fn fetch(&self, queue: &str) -> Result<Option<Envelope>>;

    /// Enqueue raw payload bytes.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()>;

    /// Confirm a fetched message was processed.
    async fn ack(&self, queue: &str, tag: &DeliveryTag) -> Result<()>;

    /// Give a fetched message back (`requeue`) or drop it.
    async fn reject(&self, queue: &str, tag: &DeliveryTag, requeue: bool) -> Result<()>;

    /// Keep a fetched message hidden for another visibility period. Brokers
    /// that hold unsettled messages indefinitely need nothing here.
    async fn extend_visibility(&self, _queue: &str, _tag: &DeliveryTag) -> Result<()> {
        Ok(())
    }

    /// Whether unsettled messages are handed out again after a timeout, so
    /// long-running tasks need [`extend_visibility`](QueueClient::extend_visibility).
    fn visibility_timeout(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Which broker a [`connect`] call talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueBackend {
    #[default]
    Amqp,
    Pgmq,
}

impl std::fmt::Display for QueueBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Amqp => f.write_str("amqp"),
            Self::Pgmq => f.write_str("pgmq"),
        }
    }
}

impl std::str::FromStr for QueueBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "pgmq" | "postgres" => Ok(Self::Pgmq),
            other => Err(Error::Config(format!("unknown queue backend: {other}"))),
        }
    }
}

/// Connection parameters shared by the adapters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Name reported to the broker (AMQP connection name).
    pub connection_name: String,
    /// pgmq visibility timeout for fetched messages, in seconds.
    pub visibility_timeout: i32,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connection_name: "workfeed".to_string(),
            visibility_timeout: 60,
        }
    }
}

/// Open a queue client for `backend`. This is the production client factory.
pub async fn connect(
    backend: QueueBackend,
    url: &SecretString,
    options: &ConnectOptions,
) -> Result<Arc<dyn QueueClient>> {
    let client: Arc<dyn QueueClient> = match backend {
        QueueBackend::Amqp => {
            Arc::new(AmqpQueue::connect(url.expose_secret(), &options.connection_name).await?)
        }
        QueueBackend::Pgmq => {
            Arc::new(PgmqQueue::connect(url.expose_secret(), options.visibility_timeout).await?)
        }
    };
    Ok(client)
}
