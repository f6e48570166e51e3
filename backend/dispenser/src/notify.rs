//! Best-effort delivery of dispensing codes.
//!
//! Delivery runs on a detached task with a bounded timeout; its outcome is
//! logged and never feeds back into issuance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::SmsConfig;
use crate::errors::{AppError, Result};

const INITIAL_BACKOFF_MILLIS: u64 = 500;
const MAX_BACKOFF_MILLIS: u64 = 8_000;

/// A freshly issued code addressed to a customer.
#[derive(Debug, Clone)]
pub struct CodeMessage {
    pub destination: String,
    pub code: String,
    pub liters: f64,
    pub ttl_minutes: i64,
    pub reference: String,
}

impl CodeMessage {
    pub fn text(&self) -> String {
        format!(
            "Your dispensing code is {}. It is valid for {} minutes for {} liters. Ref: {}",
            self.code, self.ttl_minutes, self.liters, self.reference
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub delivered: bool,
    pub provider_message_id: Option<String>,
    pub attempts: u32,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_code(&self, message: &CodeMessage) -> Result<DeliveryReport>;
}

/// Fire-and-forget front for a [`Notifier`].
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    /// Spawn delivery and return immediately.
    pub fn dispatch(&self, message: CodeMessage) {
        let notifier = Arc::clone(&self.notifier);
        let timeout = self.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, notifier.send_code(&message)).await {
                Ok(Ok(report)) => info!(
                    "Code for {} delivered={} after {} attempt(s)",
                    message.reference, report.delivered, report.attempts
                ),
                Ok(Err(e)) => warn!("Code delivery for {} failed: {e}", message.reference),
                Err(_) => warn!(
                    "Code delivery for {} timed out after {:?}",
                    message.reference, timeout
                ),
            }
        });
    }
}

/// Used when no SMS gateway is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_code(&self, message: &CodeMessage) -> Result<DeliveryReport> {
        info!(
            "SMS delivery disabled; code for {} not sent to {}",
            message.reference,
            mask(&message.destination)
        );
        Ok(DeliveryReport {
            delivered: false,
            provider_message_id: None,
            attempts: 0,
        })
    }
}

// ─────────────────────────────────────────────────────────
// HTTP SMS gateway
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(rename = "SMSMessageData")]
    data: Option<SmsMessageData>,
}

#[derive(Debug, Deserialize)]
struct SmsMessageData {
    #[serde(rename = "Recipients", default)]
    recipients: Vec<SmsRecipient>,
}

#[derive(Debug, Deserialize)]
struct SmsRecipient {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
    status: Option<String>,
}

/// Bulk-SMS HTTP API client with bounded retries.
pub struct SmsNotifier {
    client: Client,
    config: SmsConfig,
}

impl SmsNotifier {
    pub fn new(client: Client, config: SmsConfig) -> Self {
        Self { client, config }
    }

    async fn send_once(&self, message: &CodeMessage) -> Result<Option<String>> {
        let to = format!("+{}", message.destination.trim_start_matches('+'));
        let text = message.text();
        let mut form = vec![
            ("username", self.config.username.as_str()),
            ("to", to.as_str()),
            ("message", text.as_str()),
        ];
        if let Some(from) = &self.config.sender_id {
            form.push(("from", from.as_str()));
        }

        let resp = self
            .client
            .post(&self.config.api_url)
            .header("apiKey", &self.config.api_key)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(AppError::Gateway(format!("SMS gateway returned HTTP {status}")));
        }

        let body: SmsResponse = resp.json().await?;
        let recipient = body.data.and_then(|d| d.recipients.into_iter().next());
        match recipient {
            Some(r) if r.status.as_deref() == Some("Success") => Ok(r.message_id),
            Some(r) => Err(AppError::Gateway(format!(
                "SMS rejected: {}",
                r.status.unwrap_or_default()
            ))),
            None => Err(AppError::Gateway("SMS gateway returned no recipients".to_string())),
        }
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    async fn send_code(&self, message: &CodeMessage) -> Result<DeliveryReport> {
        let mut backoff = INITIAL_BACKOFF_MILLIS;
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.send_once(message).await {
                Ok(message_id) => {
                    return Ok(DeliveryReport {
                        delivered: true,
                        provider_message_id: message_id,
                        attempts,
                    })
                }
                Err(e) if attempts <= self.config.max_retries => {
                    warn!("SMS send failed (will retry in {backoff}ms): {e}");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_MILLIS);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keep the last three digits of a phone number for logs.
fn mask(destination: &str) -> String {
    let hidden = destination.chars().count().saturating_sub(3);
    destination
        .chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_mentions_code_liters_and_ttl() {
        let msg = CodeMessage {
            destination: "254712345678".into(),
            code: "123456".into(),
            liters: 10.0,
            ttl_minutes: 10,
            reference: "FD-1".into(),
        };
        let text = msg.text();
        assert!(text.contains("123456"));
        assert!(text.contains("10 liters"));
        assert!(text.contains("10 minutes"));
    }

    #[test]
    fn mask_hides_all_but_last_digits() {
        assert_eq!(mask("254712345678"), "*********678");
        assert_eq!(mask("12"), "12");
    }
}
