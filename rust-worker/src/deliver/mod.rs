//! Delivery collaborator: turns an event payload into an email and sends it.
//!
//! The worker only sees the [`Delivery`] trait. Payload interpretation and
//! provider protocol details stay behind it.

pub mod mailgun;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::DeliveryError;
use crate::event::Event;

pub use mailgun::MailgunDelivery;

const DEFAULT_MESSAGE: &str = "You have a new notification!";

/// Sends events to their destination.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Deliver one event. Called synchronously from the worker loop.
    async fn deliver(&self, event: &Event) -> Result<(), DeliveryError>;

    /// Send an operator alert. Not subject to the daily quota.
    async fn send_alert(&self, message: &EmailMessage) -> Result<(), DeliveryError>;
}

/// A rendered email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

/// Build the email for `event`.
///
/// Returns `Ok(None)` when the payload names no destination; such events are
/// logged only.
pub fn render_email(event: &Event) -> Result<Option<EmailMessage>, DeliveryError> {
    let to = ["to", "to_email", "email"]
        .iter()
        .find_map(|key| event.payload.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let Some(to) = to else {
        return Ok(None);
    };

    if !is_plausible_address(to) {
        return Err(DeliveryError::InvalidDestination {
            address: to.to_string(),
        });
    }

    let message = payload_str(event, "message").unwrap_or(DEFAULT_MESSAGE);
    let subject = payload_str(event, "subject")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Notification: {}", event.event_type));

    let html = format!(
        "<html><body style=\"font-family: Arial, sans-serif; padding: 20px;\">\
         <h2>Notification</h2>\
         <p><strong>User ID:</strong> {}</p>\
         <p><strong>Type:</strong> {}</p>\
         <p><strong>Message:</strong> {}</p>\
         <hr><p style=\"color: #666; font-size: 12px;\">Event ID: {}</p>\
         </body></html>",
        escape_html(&event.user_id),
        event.event_type,
        escape_html(message),
        event.id,
    );

    Ok(Some(EmailMessage {
        to: to.to_string(),
        subject,
        text: format!("Notification for {}: {}", event.user_id, message),
        html: Some(html),
    }))
}

fn payload_str<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
    event.payload.get(key).and_then(Value::as_str)
}

/// One `@` with something on both sides and a dotted domain.
fn is_plausible_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !address.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Delivery used when no provider is configured: logs and succeeds.
#[derive(Debug, Default, Clone)]
pub struct LogOnlyDelivery;

#[async_trait]
impl Delivery for LogOnlyDelivery {
    async fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        match render_email(event)? {
            Some(email) => {
                warn!(
                    event_id = %event.id,
                    to = %email.to,
                    hint = "Set MAILGUN_API_KEY and MAILGUN_DOMAIN to send real emails",
                    "email_provider_not_configured"
                );
            }
            None => {
                info!(
                    event_id = %event.id,
                    user_id = %event.user_id,
                    "notification_logged_only"
                );
            }
        }
        Ok(())
    }

    async fn send_alert(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        warn!(to = %message.to, subject = %message.subject, "alert_logged_only");
        Ok(())
    }
}

/// Pick the delivery collaborator for this configuration.
pub fn from_config(config: &Config) -> anyhow::Result<std::sync::Arc<dyn Delivery>> {
    match &config.mailgun {
        Some(settings) => Ok(std::sync::Arc::new(MailgunDelivery::new(
            settings.clone(),
            config.request_timeout,
        )?)),
        None => Ok(std::sync::Arc::new(LogOnlyDelivery)),
    }
}
