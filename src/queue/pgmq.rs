//! pgmq queue adapter via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.delete, pgmq.archive, pgmq.set_vt.
//!
//! Payloads are stored as a JSON string when they are UTF-8 text. Messages
//! enqueued by other producers as arbitrary JSON are handed over as their
//! serialized form.

use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::{Error, Result};
use crate::model::{DeliveryTag, Envelope, MessageProperties};
use crate::telemetry::metrics;

use super::QueueClient;

/// A queue client backed by the pgmq Postgres extension.
pub struct PgmqQueue {
    pool: PgPool,
    /// Seconds a read message stays invisible before pgmq hands it out again.
    visibility_timeout: i32,
}

impl PgmqQueue {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, visibility_timeout: i32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await
            .map_err(|e| Error::Connection(format!("postgres: {e}")))?;
        Ok(Self::from_pool(pool, visibility_timeout))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, visibility_timeout: i32) -> Self {
        Self {
            pool,
            visibility_timeout,
        }
    }

    fn msg_id(tag: &DeliveryTag) -> Result<i64> {
        tag.as_str()
            .parse()
            .map_err(|_| Error::InvalidDeliveryTag(tag.to_string()))
    }

    fn record(queue: &str, operation: &'static str) {
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("queue", queue.to_string()),
                KeyValue::new("operation", operation),
            ],
        );
    }
}

fn decode_payload(message: serde_json::Value) -> Vec<u8> {
    match message {
        serde_json::Value::String(text) => text.into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

fn encode_payload(queue: &str, payload: &[u8]) -> Result<serde_json::Value> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| Error::queue(queue, format!("pgmq payload must be UTF-8: {e}")))?;
    Ok(serde_json::Value::String(text.to_string()))
}

#[async_trait]
impl QueueClient for PgmqQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Self::record(queue, "create");
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Envelope>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(queue)
        .bind(self.visibility_timeout)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::queue(queue, format!("pgmq.read failed: {e}")))?;

        let envelope = row.map(|(msg_id, read_ct, enqueued_at, message)| {
            let mut properties = MessageProperties {
                content_type: Some("application/json".to_string()),
                redelivered: read_ct > 1,
                ..Default::default()
            };
            properties
                .headers
                .insert("read_ct".to_string(), read_ct.to_string());
            properties
                .headers
                .insert("enqueued_at".to_string(), enqueued_at.to_rfc3339());

            Envelope {
                delivery_tag: DeliveryTag::from(msg_id),
                properties,
                payload: decode_payload(message),
            }
        });

        Self::record(queue, if envelope.is_some() { "read" } else { "read_empty" });
        Ok(envelope)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let message = encode_payload(queue, payload)?;
        sqlx::query("SELECT pgmq.send($1, $2)")
            .bind(queue)
            .bind(&message)
            .execute(&self.pool)
            .await?;
        Self::record(queue, "send");
        Ok(())
    }

    /// Delete the message permanently.
    async fn ack(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        let msg_id = Self::msg_id(tag)?;
        let (deleted,): (bool,) = sqlx::query_as("SELECT pgmq.delete($1, $2)")
            .bind(queue)
            .bind(msg_id)
            .fetch_one(&self.pool)
            .await?;
        if !deleted {
            return Err(Error::InvalidDeliveryTag(tag.to_string()));
        }
        Self::record(queue, "delete");
        Ok(())
    }

    /// Requeue by resetting the visibility timeout, otherwise archive the
    /// message so failures stay auditable.
    async fn reject(&self, queue: &str, tag: &DeliveryTag, requeue: bool) -> Result<()> {
        let msg_id = Self::msg_id(tag)?;
        if requeue {
            let row: Option<(i64,)> = sqlx::query_as("SELECT msg_id FROM pgmq.set_vt($1, $2, 0)")
                .bind(queue)
                .bind(msg_id)
                .fetch_optional(&self.pool)
                .await?;
            if row.is_none() {
                return Err(Error::InvalidDeliveryTag(tag.to_string()));
            }
            Self::record(queue, "requeue");
        } else {
            let (archived,): (bool,) = sqlx::query_as("SELECT pgmq.archive($1, $2)")
                .bind(queue)
                .bind(msg_id)
                .fetch_one(&self.pool)
                .await?;
            if !archived {
                return Err(Error::InvalidDeliveryTag(tag.to_string()));
            }
            Self::record(queue, "archive");
        }
        Ok(())
    }

    /// Push the message's visibility timeout out by another full period.
    async fn extend_visibility(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        let msg_id = Self::msg_id(tag)?;
        let row: Option<(i64,)> = sqlx::query_as("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue)
            .bind(msg_id)
            .bind(self.visibility_timeout)
            .fetch_optional(&self.pool)
            .await?;
        if row.is_none() {
            return Err(Error::InvalidDeliveryTag(tag.to_string()));
        }
        Self::record(queue, "extend");
        Ok(())
    }

    fn visibility_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.visibility_timeout.max(1) as u64))
    }
}
