//! Delivery failure types.
//!
//! Every failure the delivery collaborator can report is a variant here, so
//! the retry classifier can match on them exhaustively.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The provider did not answer in time.
    #[error("delivery timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The provider could not be reached.
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The provider asked us to slow down (HTTP 408/429).
    #[error("throttled by provider: HTTP {status}")]
    Throttled { status: u16 },

    /// HTTP 5xx from the provider.
    #[error("server error: HTTP {status}")]
    ServerError { status: u16, body: String },

    /// HTTP 4xx from the provider.
    #[error("client error: HTTP {status}")]
    ClientError { status: u16, body: String },

    /// The destination address in the payload is malformed.
    #[error("invalid destination address: {address}")]
    InvalidDestination { address: String },

    /// The payload was rejected before sending.
    #[error("payload validation failed: {message}")]
    Validation { message: String },

    /// The daily send quota is used up.
    #[error("daily email limit of {limit} reached for {day}")]
    RateLimitDenied { day: NaiveDate, limit: u32 },

    /// A failure the collaborator could not type more precisely.
    #[error("{message}")]
    Other { message: String },
}

impl DeliveryError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status to a typed failure.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            408 | 429 => Self::Throttled { status },
            400..=499 => Self::ClientError {
                status,
                body: body.into(),
            },
            500..=599 => Self::ServerError {
                status,
                body: body.into(),
            },
            _ => Self::Other {
                message: format!("unexpected HTTP status {}: {}", status, body.into()),
            },
        }
    }

    /// Short machine-readable name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Connection { .. } => "connection",
            Self::Throttled { .. } => "throttled",
            Self::ServerError { .. } => "server_error",
            Self::ClientError { .. } => "client_error",
            Self::InvalidDestination { .. } => "invalid_destination",
            Self::Validation { .. } => "validation",
            Self::RateLimitDenied { .. } => "rate_limit_denied",
            Self::Other { .. } => "other",
        }
    }
}
