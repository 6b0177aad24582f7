//! Event data model shared by the ingestion API, the queue and the worker.
//!
//! An [`Event`] is created once by the producer and then owned by exactly one
//! of: the live queue, a worker (in flight), or the dead-letter store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Maximum accepted length of a `user_id`.
pub const MAX_USER_ID_LEN: usize = 128;

/// Opaque key-value payload handed through to the delivery collaborator.
pub type Payload = Map<String, Value>;

/// Supported event types.
///
/// The worker does not branch on the type; it only shows up in logs, metrics
/// and the default notification subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    UserNotification,
    SystemAlert,
    EmailNotification,
    SmsNotification,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UserNotification,
        EventType::SystemAlert,
        EventType::EmailNotification,
        EventType::SmsNotification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::UserNotification => "USER_NOTIFICATION",
            EventType::SystemAlert => "SYSTEM_ALERT",
            EventType::EmailNotification => "EMAIL_NOTIFICATION",
            EventType::SmsNotification => "SMS_NOTIFICATION",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an event.
///
/// Never stored on the event itself: it follows from which store currently
/// holds the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Processing,
    Completed,
    DeadLettered,
}

/// Ingestion request body.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub user_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Payload,
}

/// Validation failures at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("user_id must not be empty")]
    EmptyUserId,

    #[error("user_id must be at most {max} characters, got {len}")]
    UserIdTooLong { len: usize, max: usize },
}

impl NewEvent {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.is_empty() {
            return Err(ValidationError::EmptyUserId);
        }

        let len = self.user_id.chars().count();
        if len > MAX_USER_ID_LEN {
            return Err(ValidationError::UserIdTooLong {
                len,
                max: MAX_USER_ID_LEN,
            });
        }

        Ok(())
    }

    /// Turn a validated request into a queueable event.
    pub fn into_event(self) -> Event {
        Event::new(self.user_id, self.event_type, self.payload)
    }
}

/// The unit of work moved through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Event {
    pub fn new(user_id: impl Into<String>, event_type: EventType, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            event_type,
            payload,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Receipt returned to the producer once the event is queued.
    pub fn receipt(&self) -> EventReceipt {
        EventReceipt {
            event_id: self.id.to_string(),
            status: EventStatus::Queued,
            queued_at: self.created_at,
        }
    }
}

/// Acceptance acknowledgment returned by the ingestion API.
///
/// This is not a delivery guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReceipt {
    pub event_id: String,
    pub status: EventStatus,
    pub queued_at: DateTime<Utc>,
}
