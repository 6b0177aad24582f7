//! Failure classification and the retry-or-dead-letter decision.

use std::fmt;

use crate::error::DeliveryError;

const TRANSIENT_INDICATORS: &[&str] = &[
    "timeout",
    "connection",
    "temporary",
    "unavailable",
    "retry",
    "network",
];

const PERMANENT_INDICATORS: &[&str] = &[
    "validation",
    "invalid",
    "malformed",
    "not found",
    "unauthorized",
    "forbidden",
];

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Expected to clear up if retried.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Not recognised; retried cautiously up to the same ceiling.
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Unknown => "unknown",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureClass::Permanent)
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a delivery failure. Pure and total.
pub fn classify(error: &DeliveryError) -> FailureClass {
    match error {
        DeliveryError::Timeout { .. }
        | DeliveryError::Connection { .. }
        | DeliveryError::Throttled { .. }
        | DeliveryError::ServerError { .. }
        | DeliveryError::RateLimitDenied { .. } => FailureClass::Transient,

        DeliveryError::ClientError { .. }
        | DeliveryError::InvalidDestination { .. }
        | DeliveryError::Validation { .. } => FailureClass::Permanent,

        DeliveryError::Other { message } => classify_message(message),
    }
}

fn classify_message(message: &str) -> FailureClass {
    let message = message.to_lowercase();

    if TRANSIENT_INDICATORS.iter().any(|i| message.contains(i)) {
        return FailureClass::Transient;
    }
    if PERMANENT_INDICATORS.iter().any(|i| message.contains(i)) {
        return FailureClass::Permanent;
    }
    FailureClass::Unknown
}

/// What the worker does with a failed event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue with `retry_count` bumped to the given value.
    Retry { next_retry_count: u32 },
    /// Move to the dead-letter store.
    DeadLetter { reason: String },
}

/// Retry ceiling shared by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total delivery attempts per event, including the first.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decide the fate of an event whose attempt number `retry_count + 1`
    /// failed with `error`.
    pub fn decide(&self, retry_count: u32, error: &DeliveryError) -> RetryDecision {
        let class = classify(error);

        if !class.is_retryable() {
            return RetryDecision::DeadLetter {
                reason: format!("permanent failure: {}", error),
            };
        }

        if retry_count.saturating_add(1) < self.max_retries {
            return RetryDecision::Retry {
                next_retry_count: retry_count + 1,
            };
        }

        let reason = match error {
            DeliveryError::RateLimitDenied { .. } => "rate limit exhausted".to_string(),
            _ => format!(
                "max retries ({}) exceeded: {} failure: {}",
                self.max_retries, class, error
            ),
        };
        RetryDecision::DeadLetter { reason }
    }
}
