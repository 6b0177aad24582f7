//! In-process queue backend.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::{EventQueue, QueueResult};
use crate::event::Event;

/// FIFO queue held in memory.
///
/// Waiting consumers park on a [`Notify`] instead of polling. The pop happens
/// under the mutex, so concurrent consumers never receive the same event.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<Event>>,
    available: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn enqueue(&self, event: &Event) -> QueueResult<()> {
        self.items.lock().await.push_back(event.clone());
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Event>> {
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before checking so an enqueue that lands in
            // between is not missed.
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.items.lock().await.pop_front() {
                return Ok(Some(event));
            }

            if timeout_at(deadline, notified).await.is_err() {
                debug!(timeout_ms = timeout.as_millis() as u64, "memory_queue_dequeue_timeout");
                return Ok(None);
            }
        }
    }

    async fn len(&self) -> QueueResult<u64> {
        Ok(self.items.lock().await.len() as u64)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
