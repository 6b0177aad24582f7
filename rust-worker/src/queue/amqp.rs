//! RabbitMQ queue backend using lapin.
//!
//! The broker connection is shared by the live queue and the dead-letter
//! store and is re-established lazily after a failure. Queues are declared
//! non-durable and messages are published transient; durability is not a
//! goal of this service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::dead_letter::{DeadLetterEntry, DeadLetterStore};
use super::{EventQueue, QueueError, QueueResult};
use crate::event::Event;

const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Shared RabbitMQ connection with lazy reconnect.
#[derive(Clone)]
pub struct AmqpBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    url: String,
    queue_name: String,
    dlq_name: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

fn transport(context: &str, err: impl std::fmt::Display) -> QueueError {
    QueueError::transport(format!("{}: {}", context, err))
}

fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: false,
        ..Default::default()
    }
}

/// One consumer per queue across all processes.
fn consume_options() -> BasicConsumeOptions {
    BasicConsumeOptions {
        exclusive: true,
        ..Default::default()
    }
}

fn is_access_refused(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(e)
            if matches!(e.kind(), AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED))
    )
}

impl AmqpBroker {
    pub fn new(url: String, queue_name: String, dlq_name: String) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                url,
                queue_name,
                dlq_name,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.inner.queue_name
    }

    pub fn dlq_name(&self) -> &str {
        &self.inner.dlq_name
    }

    /// Return a connected channel, connecting first if needed.
    async fn ensure_connected(&self) -> QueueResult<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Another task may have reconnected while we waited for the lock.
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(|e| transport("failed to connect to RabbitMQ", e))?;

        let ch = conn
            .create_channel()
            .await
            .map_err(|e| transport("failed to create channel", e))?;

        for name in [&self.inner.queue_name, &self.inner.dlq_name] {
            ch.queue_declare(name, queue_options(), FieldTable::default())
                .await
                .map_err(|e| transport("failed to declare queue", e))?;
        }

        info!(
            queue = %self.inner.queue_name,
            dead_letter_queue = %self.inner.dlq_name,
            "rabbitmq_connected"
        );

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    async fn publish(&self, queue: &str, message_id: &str, body: &[u8]) -> QueueResult<()> {
        let channel = self.ensure_connected().await?;

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_delivery_mode(TRANSIENT_DELIVERY_MODE)
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.into()),
            )
            .await
            .map_err(|e| transport("failed to publish", e))?
            .await
            .map_err(|e| transport("failed to confirm publish", e))?;

        Ok(())
    }

    async fn message_count(&self, queue: &str) -> QueueResult<u64> {
        let channel = self.ensure_connected().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..queue_options()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| transport("failed to inspect queue", e))?;
        Ok(u64::from(declared.message_count()))
    }

    async fn is_connected(&self) -> bool {
        match self.inner.connection.read().await.as_ref() {
            Some(conn) => conn.status().connected(),
            None => false,
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_closed");
    }
}

/// Live event queue on RabbitMQ.
///
/// Each `AmqpQueue` owns one exclusive consumer with prefetch 1, so only one
/// process can consume the queue. A delivery is acked as soon as it arrives,
/// so the broker forgets the event before `dequeue` returns it.
pub struct AmqpQueue {
    broker: AmqpBroker,
    consumer: Mutex<Option<(Channel, Consumer)>>,
}

impl AmqpQueue {
    pub fn new(broker: AmqpBroker) -> Self {
        Self {
            broker,
            consumer: Mutex::new(None),
        }
    }

    async fn start_consumer(&self) -> QueueResult<(Channel, Consumer)> {
        let channel = self.broker.ensure_connected().await?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| transport("failed to set QoS", e))?;

        let consumer = channel
            .basic_consume(
                self.broker.queue_name(),
                "eventflow-worker",
                consume_options(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                if is_access_refused(&e) {
                    QueueError::ConsumerBusy {
                        queue: self.broker.queue_name().to_string(),
                    }
                } else {
                    transport("failed to start consumer", e)
                }
            })?;

        info!(queue = %self.broker.queue_name(), "rabbitmq_consumer_started");
        Ok((channel, consumer))
    }

    /// Start the consumer now instead of on the first dequeue.
    pub async fn claim(&self) -> QueueResult<()> {
        let mut slot = self.consumer.lock().await;
        self.ensure_consumer(&mut slot).await
    }

    async fn ensure_consumer(&self, slot: &mut Option<(Channel, Consumer)>) -> QueueResult<()> {
        let stale = match slot.as_ref() {
            Some((channel, _)) => !channel.status().connected(),
            None => true,
        };
        if stale {
            *slot = Some(self.start_consumer().await?);
        }
        Ok(())
    }
}

#[async_trait]
impl EventQueue for AmqpQueue {
    async fn enqueue(&self, event: &Event) -> QueueResult<()> {
        let body = serde_json::to_vec(event).map_err(|e| QueueError::codec(e.to_string()))?;
        self.broker
            .publish(self.broker.queue_name(), &event.id.to_string(), &body)
            .await
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>> {
        let mut slot = self.consumer.lock().await;
        self.ensure_consumer(&mut slot).await?;

        let (channel, next) = {
            let Some((channel, consumer)) = slot.as_mut() else {
                return Err(QueueError::transport("consumer unavailable"));
            };
            (channel.clone(), tokio::time::timeout(timeout, consumer.next()).await)
        };

        let delivery = match next {
            Err(_) => return Ok(None),
            Ok(Some(Ok(delivery))) => delivery,
            Ok(Some(Err(e))) => {
                *slot = None;
                return Err(transport("delivery error", e));
            }
            Ok(None) => {
                warn!("rabbitmq_consumer_closed");
                *slot = None;
                return Err(QueueError::transport("consumer closed"));
            }
        };

        if let Err(e) = channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await
        {
            error!(delivery_tag = delivery.delivery_tag, error = %e, "rabbitmq_ack_failed");
        }

        serde_json::from_slice(&delivery.data)
            .map(Some)
            .map_err(|e| {
                error!(
                    error = %e,
                    body_preview = %String::from_utf8_lossy(
                        &delivery.data[..delivery.data.len().min(200)]
                    ),
                    "event_decode_failed"
                );
                QueueError::codec(e.to_string())
            })
    }

    async fn len(&self) -> QueueResult<u64> {
        self.broker.message_count(self.broker.queue_name()).await
    }

    async fn health_check(&self) -> bool {
        if self.broker.is_connected().await {
            return true;
        }
        self.broker.ensure_connected().await.is_ok()
    }
}

/// Dead-letter store on RabbitMQ: entries are published to the DLQ queue and
/// inspected with broker tooling.
pub struct AmqpDeadLetters {
    broker: AmqpBroker,
}

impl AmqpDeadLetters {
    pub fn new(broker: AmqpBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl DeadLetterStore for AmqpDeadLetters {
    async fn append(&self, entry: DeadLetterEntry) -> QueueResult<()> {
        let body = serde_json::to_vec(&entry).map_err(|e| QueueError::codec(e.to_string()))?;
        self.broker
            .publish(self.broker.dlq_name(), &entry.event.id.to_string(), &body)
            .await
    }

    async fn len(&self) -> QueueResult<u64> {
        self.broker.message_count(self.broker.dlq_name()).await
    }
}
