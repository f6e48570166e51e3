//! Paystack hosted checkout adapter — the `hosted_checkout` variant.
//!
//! Webhooks are authenticated with `x-paystack-signature`, the hex
//! HMAC-SHA512 of the raw body keyed with the secret key.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha512;
use tracing::debug;

use super::{
    parse_iso_to_unix, CallbackEvent, InitiateRequest, Initiation, PaymentGateway,
    ProviderMetadata, ProviderOutcome, Verification,
};
use crate::config::PaystackConfig;
use crate::errors::{AppError, Result};
use crate::models::PaymentVariant;

type HmacSha512 = Hmac<Sha512>;

pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Constant-time check of a webhook signature.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha512::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Hex signature for `body`, as Paystack computes it.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Map a transaction `status` string from the verify endpoint.
pub fn outcome_for_status(status: &str) -> ProviderOutcome {
    match status {
        "success" => ProviderOutcome::Succeeded,
        "failed" => ProviderOutcome::Failed,
        "abandoned" | "reversed" => ProviderOutcome::Cancelled,
        _ => ProviderOutcome::Pending,
    }
}

/// Map a webhook `event` name.
pub fn outcome_for_event(event: &str) -> ProviderOutcome {
    match event {
        "charge.success" => ProviderOutcome::Succeeded,
        "charge.failed" => ProviderOutcome::Failed,
        "charge.abandoned" | "charge.reversed" | "refund.processed" => ProviderOutcome::Cancelled,
        _ => ProviderOutcome::Pending,
    }
}

// ─────────────────────────────────────────────────────────
// API response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct InitializeData {
    authorization_url: String,
    access_code: Option<String>,
    reference: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    id: Option<i64>,
    status: Option<String>,
    reference: Option<String>,
    paid_at: Option<String>,
    channel: Option<String>,
    gateway_response: Option<String>,
    authorization: Option<Authorization>,
}

#[derive(Debug, Deserialize)]
struct Authorization {
    card_type: Option<String>,
    last4: Option<String>,
    bank: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event: String,
    data: TransactionData,
}

impl TransactionData {
    fn into_metadata(self) -> ProviderMetadata {
        let auth = self.authorization;
        ProviderMetadata {
            receipt: self.id.map(|id| id.to_string()),
            message: self.gateway_response,
            channel: self.channel,
            paid_at: self.paid_at.as_deref().and_then(parse_iso_to_unix),
            card_type: auth.as_ref().and_then(|a| a.card_type.clone()),
            last4: auth.as_ref().and_then(|a| a.last4.clone()),
            bank: auth.and_then(|a| a.bank),
            ..Default::default()
        }
    }
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct PaystackGateway {
    client: Client,
    config: PaystackConfig,
}

impl PaystackGateway {
    pub fn new(client: Client, config: PaystackConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn variant(&self) -> PaymentVariant {
        PaymentVariant::HostedCheckout
    }

    async fn initiate(&self, request: &InitiateRequest<'_>) -> Result<Initiation> {
        let email = request
            .destination
            .email
            .as_deref()
            .unwrap_or(&self.config.default_email);

        let mut payload = json!({
            "email": email,
            // Paystack amounts are in minor units.
            "amount": (request.amount * 100.0).round() as i64,
            "currency": request.currency,
            "reference": request.reference,
            "metadata": { "phone_number": request.destination.phone_number },
        });
        if let Some(url) = &self.config.callback_url {
            payload["callback_url"] = json!(url);
        }

        let resp = self
            .client
            .post(format!("{}/transaction/initialize", self.config.base_url))
            .bearer_auth(&self.config.secret_key)
            .json(&payload)
            .send()
            .await?;
        let body: Envelope<InitializeData> = resp.json().await?;

        match body.data {
            Some(data) if body.status => Ok(Initiation {
                provider_handle: data.reference,
                correlation_id: data.access_code,
                customer_message: body.message,
                redirect_url: Some(data.authorization_url),
            }),
            _ => Err(AppError::Gateway(
                body.message
                    .unwrap_or_else(|| "Checkout initialization failed".to_string()),
            )),
        }
    }

    async fn verify(&self, provider_handle: &str) -> Result<Verification> {
        let resp = self
            .client
            .get(format!(
                "{}/transaction/verify/{}",
                self.config.base_url, provider_handle
            ))
            .bearer_auth(&self.config.secret_key)
            .send()
            .await?;
        let body: Envelope<TransactionData> = resp.json().await?;

        let data = match body.data {
            Some(data) if body.status => data,
            _ => {
                return Err(AppError::Gateway(
                    body.message
                        .unwrap_or_else(|| "Transaction verification failed".to_string()),
                ))
            }
        };
        let outcome = outcome_for_status(data.status.as_deref().unwrap_or_default());
        debug!("Verified {provider_handle}: {outcome:?}");

        Ok(Verification {
            outcome,
            metadata: data.into_metadata(),
        })
    }

    fn parse_callback(&self, raw: &[u8], signature: Option<&str>) -> Result<CallbackEvent> {
        match signature {
            Some(sig) if verify_signature(&self.config.secret_key, raw, sig) => {}
            _ => return Err(AppError::InvalidSignature),
        }
        parse_webhook(raw)
    }
}

/// Decode an already-authenticated webhook body.
pub fn parse_webhook(raw: &[u8]) -> Result<CallbackEvent> {
    let payload: WebhookPayload = serde_json::from_slice(raw)
        .map_err(|e| AppError::CallbackParse(format!("webhook: {e}")))?;
    let reference = payload
        .data
        .reference
        .clone()
        .ok_or_else(|| AppError::CallbackParse("webhook without reference".to_string()))?;

    Ok(CallbackEvent {
        provider_handle: reference,
        outcome: outcome_for_event(&payload.event),
        metadata: payload.data.into_metadata(),
    })
}
