//! Queue module: the FIFO transport between producer and worker, and the
//! dead-letter store for events that will not be retried.
//!
//! ## Architecture
//!
//! ```text
//! Ingestion API → EventQueue → Worker → { completed | EventQueue (requeue) | DeadLetterStore }
//! ```
//!
//! Two backends are provided: an in-process memory store (default) and a
//! RabbitMQ broker reached through lapin. Neither has an acknowledgment
//! channel: once `dequeue` returns an event the queue has forgotten it.

pub mod amqp;
pub mod dead_letter;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, QueueBackend};
use crate::event::Event;

pub use amqp::{AmqpBroker, AmqpDeadLetters, AmqpQueue};
pub use dead_letter::{DeadLetterEntry, DeadLetterStore, MemoryDeadLetters};
pub use memory::MemoryQueue;

/// Failures of the queue or dead-letter backing store.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The backing store is unreachable.
    #[error("queue transport error: {message}")]
    Transport { message: String },

    /// A message taken from the queue could not be decoded.
    #[error("queue codec error: {message}")]
    Codec { message: String },

    /// Another process already holds the exclusive consumer on the queue.
    #[error("queue {queue} is already consumed by another process")]
    ConsumerBusy { queue: String },
}

impl QueueError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// FIFO queue with a blocking, timed pop.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append `event` to the tail of the queue.
    async fn enqueue(&self, event: &Event) -> QueueResult<()>;

    /// Wait up to `timeout` for the oldest event.
    ///
    /// Returns `Ok(None)` when the timeout elapses with nothing available.
    /// At most one concurrent caller receives any given event.
    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>>;

    /// Number of events currently waiting.
    async fn len(&self) -> QueueResult<u64>;

    /// Whether the backing store is reachable.
    async fn health_check(&self) -> bool;
}

/// Queue and dead-letter store built from the configured backend.
///
/// Either backend is consumed by a single process, so one [`RateLimiter`]
/// instance sees every send.
///
/// [`RateLimiter`]: crate::limiter::RateLimiter
#[derive(Clone)]
pub struct Backend {
    pub queue: Arc<dyn EventQueue>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    /// Set for the AMQP backend so callers can close the connection.
    pub broker: Option<AmqpBroker>,
    amqp_queue: Option<Arc<AmqpQueue>>,
}

impl Backend {
    pub fn from_config(config: &Config) -> Self {
        match &config.queue_backend {
            QueueBackend::Memory => Self {
                queue: Arc::new(MemoryQueue::new()),
                dead_letters: Arc::new(MemoryDeadLetters::new()),
                broker: None,
                amqp_queue: None,
            },
            QueueBackend::Amqp(url) => {
                let broker = AmqpBroker::new(
                    url.clone(),
                    config.queue_name.clone(),
                    config.dlq_name.clone(),
                );
                let amqp_queue = Arc::new(AmqpQueue::new(broker.clone()));
                Self {
                    queue: amqp_queue.clone(),
                    dead_letters: Arc::new(AmqpDeadLetters::new(broker.clone())),
                    broker: Some(broker),
                    amqp_queue: Some(amqp_queue),
                }
            }
        }
    }

    /// Whether this backend can only be consumed from inside this process.
    pub fn is_in_process(&self) -> bool {
        self.broker.is_none()
    }

    /// Take the queue's exclusive consumer for this process.
    ///
    /// Fails with [`QueueError::ConsumerBusy`] when another process already
    /// consumes the queue. A no-op for the memory backend.
    pub async fn claim_consumer(&self) -> QueueResult<()> {
        match &self.amqp_queue {
            Some(queue) => queue.claim().await,
            None => Ok(()),
        }
    }

    pub async fn close(&self) {
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
    }
}
