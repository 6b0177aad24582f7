//! Mailgun HTTP API delivery.
//!
//! Sends through `POST {base}/v3/{domain}/messages` with basic auth and maps
//! transport and HTTP failures onto [`DeliveryError`] variants.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info};

use super::{render_email, Delivery, EmailMessage};
use crate::config::MailgunSettings;
use crate::error::DeliveryError;
use crate::event::Event;

/// Longest response body kept on an error.
const MAX_ERROR_BODY: usize = 500;

pub struct MailgunDelivery {
    client: Client,
    settings: MailgunSettings,
    timeout: Duration,
}

impl MailgunDelivery {
    pub fn new(settings: MailgunSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            settings,
            timeout,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v3/{}/messages",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.domain
        )
    }

    async fn send_email(&self, email: &EmailMessage) -> Result<(), DeliveryError> {
        let mut form = vec![
            ("from", self.settings.from_email.as_str()),
            ("to", email.to.as_str()),
            ("subject", email.subject.as_str()),
            ("text", email.text.as_str()),
        ];
        if let Some(html) = email.html.as_deref() {
            form.push(("html", html));
        }

        let response = self
            .client
            .post(self.endpoint())
            .basic_auth("api", Some(&self.settings.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                error!(to = %email.to, error = %e, "email_send_failed");
                if e.is_timeout() {
                    DeliveryError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    DeliveryError::connection(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            info!(to = %email.to, subject = %email.subject, status_code = status, "email_sent");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let body: String = body.chars().take(MAX_ERROR_BODY).collect();
        error!(to = %email.to, status_code = status, body = %body, "email_rejected");

        Err(DeliveryError::from_status(status, body))
    }
}

#[async_trait]
impl Delivery for MailgunDelivery {
    async fn deliver(&self, event: &Event) -> Result<(), DeliveryError> {
        match render_email(event)? {
            Some(email) => self.send_email(&email).await,
            None => {
                info!(
                    event_id = %event.id,
                    user_id = %event.user_id,
                    hint = "Add 'to', 'to_email' or 'email' to the payload to send an email",
                    "notification_logged_only"
                );
                Ok(())
            }
        }
    }

    async fn send_alert(&self, message: &EmailMessage) -> Result<(), DeliveryError> {
        self.send_email(message).await
    }
}
