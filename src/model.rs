//! Core data model.
//!
//! An [`Envelope`] is what one queue fetch produces. A [`Task`] is what the
//! engine schedules. Every task is derived from exactly one envelope and keeps
//! that envelope's delivery tag so the message can be settled afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Broker-assigned handle for one unacknowledged message.
///
/// Opaque to the feed. AMQP delivery tags and pgmq message ids are both
/// carried in their decimal form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryTag(String);

impl DeliveryTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for DeliveryTag {
    fn from(tag: u64) -> Self {
        Self(tag.to_string())
    }
}

impl From<i64> for DeliveryTag {
    fn from(tag: i64) -> Self {
        Self(tag.to_string())
    }
}

impl From<&str> for DeliveryTag {
    fn from(tag: &str) -> Self {
        Self(tag.to_string())
    }
}

impl From<String> for DeliveryTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

/// Broker metadata that travels with a message. Passed through unexamined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// The broker has delivered this message before.
    pub redelivered: bool,
}

/// The result of one successful queue fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub delivery_tag: DeliveryTag,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Newtype for task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything needed to acknowledge or reject the originating message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckContext {
    pub queue: String,
    pub delivery_tag: DeliveryTag,
}

/// A schedulable unit of work derived from exactly one [`Envelope`].
///
/// Fields are private: the only way to build a task is
/// [`Task::from_envelope`], so the ack context always points at a real
/// fetched message.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    id: TaskId,
    target: String,
    body: Vec<u8>,
    properties: MessageProperties,
    ack: AckContext,
    fetched_at: DateTime<Utc>,
}

impl Task {
    /// Wrap a fetched envelope. The payload is read as a locator (e.g. a URL);
    /// non-UTF-8 bytes are replaced, the raw bytes stay available via [`Task::body`].
    pub fn from_envelope(queue: &str, envelope: Envelope) -> Self {
        let Envelope {
            delivery_tag,
            properties,
            payload,
        } = envelope;

        Self {
            id: TaskId::new(),
            target: String::from_utf8_lossy(&payload).into_owned(),
            body: payload,
            properties,
            ack: AckContext {
                queue: queue.to_string(),
                delivery_tag,
            },
            fetched_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The work locator, e.g. a URL to crawl.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn ack_context(&self) -> &AckContext {
        &self.ack
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl Outcome {
    pub fn succeeded(duration_ms: u64) -> Self {
        Self {
            success: true,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// A finished task together with its outcome, as reported by the engine.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: Task,
    pub outcome: Outcome,
}
