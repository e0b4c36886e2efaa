//! RabbitMQ queue adapter using `lapin` (AMQP 0.9.1).
//!
//! `basic_get` is a single request/response round trip, so it never parks
//! waiting for a message: an empty queue answers `get-empty` immediately.
//! Messages are fetched with `no_ack = false` and stay unacknowledged on the
//! channel until [`QueueClient::ack`] or [`QueueClient::reject`].

use async_trait::async_trait;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{DeliveryTag, Envelope, MessageProperties};
use crate::telemetry::metrics;

use super::QueueClient;

/// A queue client holding one AMQP connection and channel.
///
/// Delivery tags are channel-scoped, so every fetch and every settlement for
/// a given message must go through the same `AmqpQueue`.
pub struct AmqpQueue {
    connection: Connection,
    channel: Channel,
}

impl AmqpQueue {
    pub async fn connect(url: &str, connection_name: &str) -> Result<Self> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name(connection_name.to_string().into()),
        )
        .await
        .map_err(|e| Error::Connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| Error::Connection(format!("RabbitMQ channel creation failed: {e}")))?;

        // Publisher confirms, so `publish` only returns once the broker has
        // taken the message.
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| Error::Connection(format!("RabbitMQ confirm_select failed: {e}")))?;

        debug!(connection_name, "amqp channel open");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Close the connection. Unsettled messages return to their queues.
    pub async fn close(&self) -> Result<()> {
        self.connection.close(200, "OK").await?;
        Ok(())
    }

    fn delivery_tag(tag: &DeliveryTag) -> Result<u64> {
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

fn header_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::LongInt(n) => n.to_string(),
        AMQPValue::LongLongInt(n) => n.to_string(),
        other => format!("{other:?}"),
    }
}

fn properties_of(delivery: &Delivery) -> MessageProperties {
    let props = &delivery.properties;
    MessageProperties {
        content_type: props.content_type().as_ref().map(|s| s.as_str().to_string()),
        headers: props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(k, v)| (k.as_str().to_string(), header_value(v)))
                    .collect()
            })
            .unwrap_or_default(),
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl QueueClient for AmqpQueue {
    async fn ensure_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| Error::queue(queue, format!("queue_declare failed: {e}")))?;
        Self::record(queue, "declare");
        Ok(())
    }

    async fn fetch(&self, queue: &str) -> Result<Option<Envelope>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| Error::queue(queue, format!("basic_get failed: {e}")))?;

        let envelope = message.map(|message| {
            let delivery = message.delivery;
            Envelope {
                delivery_tag: DeliveryTag::from(delivery.delivery_tag),
                properties: properties_of(&delivery),
                payload: delivery.data,
            }
        });

        Self::record(queue, if envelope.is_some() { "get" } else { "get_empty" });
        Ok(envelope)
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| Error::queue(queue, format!("basic_publish failed: {e}")))?
            .await
            .map_err(|e| Error::queue(queue, format!("publish confirm failed: {e}")))?;
        if confirmation.is_nack() {
            return Err(Error::queue(queue, "broker refused the published message"));
        }
        Self::record(queue, "publish");
        Ok(())
    }

    async fn ack(&self, queue: &str, tag: &DeliveryTag) -> Result<()> {
        let delivery_tag = Self::delivery_tag(tag)?;
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| Error::queue(queue, format!("ack of {delivery_tag} failed: {e}")))?;
        Self::record(queue, "ack");
        Ok(())
    }

    async fn reject(&self, queue: &str, tag: &DeliveryTag, requeue: bool) -> Result<()> {
        let delivery_tag = Self::delivery_tag(tag)?;
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Error::queue(queue, format!("nack of {delivery_tag} failed: {e}")))?;
        Self::record(queue, if requeue { "requeue" } else { "nack" });
        Ok(())
    }
}
