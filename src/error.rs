//! Error types for workfeed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The queue client could not be constructed or lost its connection.
    #[error("queue connection failed: {0}")]
    Connection(String),

    #[error("queue {queue}: {message}")]
    Queue { queue: String, message: String },

    #[error("fetch from queue {queue} did not return within {timeout_ms}ms")]
    FetchTimeout { queue: String, timeout_ms: u64 },

    #[error("invalid delivery tag: {0}")]
    InvalidDeliveryTag(String),

    #[error("engine is closed and no longer accepts tasks")]
    EngineClosed,

    #[error("task handler failed: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn queue(queue: &str, message: impl Into<String>) -> Self {
        Self::Queue {
            queue: queue.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
