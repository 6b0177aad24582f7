//! Dead-letter store: the terminal sink for events that failed permanently or
//! ran out of retries.
//!
//! Entries are written once by the worker and never mutated. Appends
//! accumulate; there is no deduplication.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::QueueResult;
use crate::event::Event;

/// A failed event plus why and when it was moved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub event: Event,
    pub failure_reason: String,
    pub moved_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(event: Event, failure_reason: impl Into<String>) -> Self {
        Self {
            event,
            failure_reason: failure_reason.into(),
            moved_at: Utc::now(),
        }
    }
}

/// Write side of the dead-letter store, as seen by the worker.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn append(&self, entry: DeadLetterEntry) -> QueueResult<()>;

    /// Number of entries held.
    async fn len(&self) -> QueueResult<u64>;
}

/// Dead-letter store held in memory.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries, oldest first.
    pub async fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetters {
    async fn append(&self, entry: DeadLetterEntry) -> QueueResult<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn len(&self) -> QueueResult<u64> {
        Ok(self.entries.read().await.len() as u64)
    }
}
