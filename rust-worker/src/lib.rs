//! EventFlow - asynchronous event processing with retries and dead-lettering.
//!
//! This library provides shared modules for the two EventFlow binaries:
//! - `eventflow-web`: Ingestion API that validates and enqueues events
//! - `eventflow-worker`: Queue consumer that delivers events
//!
//! ## Architecture
//!
//! ```text
//! POST /api/v1/events → EventQueue → Worker → { completed | requeue | DeadLetterStore }
//!                                      ↳ RateLimiter, Delivery, RetryPolicy
//! ```

pub mod config;
pub mod deliver;
pub mod error;
pub mod event;
pub mod limiter;
pub mod metrics;
pub mod queue;
pub mod retry;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, QueueBackend};
pub use deliver::{Delivery, EmailMessage};
pub use error::DeliveryError;
pub use event::{Event, EventReceipt, EventStatus, EventType, NewEvent};
pub use limiter::RateLimiter;
pub use metrics::Metrics;
pub use queue::{Backend, DeadLetterEntry, DeadLetterStore, EventQueue, QueueError};
pub use retry::{classify, FailureClass, RetryPolicy};
pub use web::AppState;
pub use worker::{spawn_workers, Outcome, Worker, WorkerContext};
