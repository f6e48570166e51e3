//! M-Pesa (Daraja) STK push adapter — the `mobile_push` variant.
//!
//! Payment initiation is never retried here: a second STK push for the same
//! reference would prompt the customer to pay twice.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    CallbackEvent, InitiateRequest, Initiation, PaymentGateway, ProviderMetadata,
    ProviderOutcome, Verification,
};
use crate::config::MpesaConfig;
use crate::errors::{AppError, Result};
use crate::models::PaymentVariant;

pub const RESULT_SUCCESS: i64 = 0;
pub const RESULT_CANCELLED_BY_USER: i64 = 1032;
pub const RESULT_USER_UNREACHABLE: i64 = 1037;
pub const RESULT_REQUEST_EXPIRED: i64 = 1019;

/// Error code the STK query returns while the customer has not answered yet.
const STILL_PROCESSING: &str = "500.001.1001";
/// Refresh the OAuth token this long before the provider says it expires.
const TOKEN_SLACK_SECS: u64 = 60;

/// Map an STK result code onto a normalized outcome.
pub fn outcome_for_result_code(code: i64) -> ProviderOutcome {
    match code {
        RESULT_SUCCESS => ProviderOutcome::Succeeded,
        RESULT_CANCELLED_BY_USER => ProviderOutcome::Cancelled,
        RESULT_USER_UNREACHABLE | RESULT_REQUEST_EXPIRED => ProviderOutcome::TimedOut,
        _ => ProviderOutcome::Failed,
    }
}

/// Normalize a Kenyan MSISDN to the `2547XXXXXXXX` form the API expects.
pub fn normalize_msisdn(raw: &str) -> Result<String> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{rest}")
    } else if digits.len() == 9 {
        format!("254{digits}")
    } else {
        digits.to_string()
    };

    if normalized.len() != 12
        || !normalized.starts_with("254")
        || !normalized.chars().all(|c| c.is_ascii_digit())
    {
        return Err(AppError::InvalidInput(format!(
            "Invalid phone number: {raw}"
        )));
    }
    Ok(normalized)
}

// ─────────────────────────────────────────────────────────
// Daraja response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: Option<String>,
    response_code: Option<String>,
    response_description: Option<String>,
    customer_message: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    result_code: Option<Value>,
    result_desc: Option<String>,
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    #[serde(rename = "Body")]
    body: CallbackBody,
}

#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "MerchantRequestID")]
    merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    result_code: i64,
    result_desc: Option<String>,
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<CallbackItem>,
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: Option<Value>,
}

// ─────────────────────────────────────────────────────────
// Adapter
// ─────────────────────────────────────────────────────────

pub struct MpesaGateway {
    client: Client,
    config: MpesaConfig,
    token: Mutex<Option<(String, Instant)>>,
}

impl MpesaGateway {
    pub fn new(client: Client, config: MpesaConfig) -> Self {
        Self {
            client,
            config,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some((token, valid_until)) = cached.as_ref() {
            if Instant::now() < *valid_until {
                return Ok(token.clone());
            }
        }

        let url = format!(
            "{}/oauth/v1/generate?grant_type=client_credentials",
            self.config.base_url
        );
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.config.consumer_key, Some(&self.config.consumer_secret))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AppError::Gateway(format!(
                "M-Pesa authentication failed with HTTP {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp.json().await?;
        let ttl = body
            .expires_in
            .as_ref()
            .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
            .unwrap_or(3599)
            .saturating_sub(TOKEN_SLACK_SECS);
        *cached = Some((
            body.access_token.clone(),
            Instant::now() + Duration::from_secs(ttl),
        ));
        Ok(body.access_token)
    }

    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }
}

/// STK push only charges whole shillings; anything else would bill the
/// customer a different amount than the one recorded.
pub fn whole_amount(amount: f64) -> Result<i64> {
    if !amount.is_finite() || amount <= 0.0 || amount.fract() != 0.0 {
        return Err(AppError::InvalidInput(format!(
            "M-Pesa amounts must be whole shillings, got {amount}"
        )));
    }
    Ok(amount as i64)
}

fn daraja_timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn variant(&self) -> PaymentVariant {
        PaymentVariant::MobilePush
    }

    async fn initiate(&self, request: &InitiateRequest<'_>) -> Result<Initiation> {
        let amount = whole_amount(request.amount)?;
        let phone = request
            .destination
            .phone_number
            .as_deref()
            .ok_or_else(|| AppError::InvalidInput("Phone number is required".to_string()))?;
        let phone = normalize_msisdn(phone)?;
        let token = self.access_token().await?;
        let timestamp = daraja_timestamp();
        // AccountReference is capped at 12 characters by the API.
        let account_ref: String = request.reference.chars().take(12).collect();

        let resp = self
            .client
            .post(format!(
                "{}/mpesa/stkpush/v1/processrequest",
                self.config.base_url
            ))
            .bearer_auth(token)
            .json(&json!({
                "BusinessShortCode": self.config.shortcode,
                "Password": self.password(&timestamp),
                "Timestamp": timestamp,
                "TransactionType": "CustomerPayBillOnline",
                "Amount": amount,
                "PartyA": phone,
                "PartyB": self.config.shortcode,
                "PhoneNumber": phone,
                "CallBackURL": self.config.callback_url,
                "AccountReference": account_ref,
                "TransactionDesc": format!("Payment {}", request.reference),
            }))
            .send()
            .await?;

        let body: StkPushResponse = resp.json().await?;
        debug!("STK push response for {}: {:?}", request.reference, body);

        match (body.response_code.as_deref(), body.checkout_request_id) {
            (Some("0"), Some(checkout_request_id)) => Ok(Initiation {
                provider_handle: checkout_request_id,
                correlation_id: body.merchant_request_id,
                customer_message: body.customer_message.or(body.response_description),
                redirect_url: None,
            }),
            _ => Err(AppError::Gateway(
                body.error_message
                    .or(body.response_description)
                    .unwrap_or_else(|| "STK push was rejected".to_string()),
            )),
        }
    }

    async fn verify(&self, provider_handle: &str) -> Result<Verification> {
        let token = self.access_token().await?;
        let timestamp = daraja_timestamp();

        let resp = self
            .client
            .post(format!("{}/mpesa/stkpushquery/v1/query", self.config.base_url))
            .bearer_auth(token)
            .json(&json!({
                "BusinessShortCode": self.config.shortcode,
                "Password": self.password(&timestamp),
                "Timestamp": timestamp,
                "CheckoutRequestID": provider_handle,
            }))
            .send()
            .await?;
        let body: StkQueryResponse = resp.json().await?;

        if body.error_code.as_deref() == Some(STILL_PROCESSING) {
            return Ok(Verification {
                outcome: ProviderOutcome::Pending,
                metadata: ProviderMetadata::default(),
            });
        }

        let code = body
            .result_code
            .as_ref()
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()));
        let Some(code) = code else {
            warn!(
                "STK query for {provider_handle} returned no result code: {:?}",
                body.error_message
            );
            return Ok(Verification {
                outcome: ProviderOutcome::Pending,
                metadata: ProviderMetadata::default(),
            });
        };

        Ok(Verification {
            outcome: outcome_for_result_code(code),
            metadata: ProviderMetadata {
                result_code: Some(code),
                message: body.result_desc,
                ..Default::default()
            },
        })
    }

    fn parse_callback(&self, raw: &[u8], _signature: Option<&str>) -> Result<CallbackEvent> {
        parse_stk_callback(raw)
    }
}

/// Decode a Daraja STK callback body.
pub fn parse_stk_callback(raw: &[u8]) -> Result<CallbackEvent> {
    let envelope: CallbackEnvelope = serde_json::from_slice(raw)
        .map_err(|e| AppError::CallbackParse(format!("STK callback: {e}")))?;
    let cb = envelope.body.stk_callback;

    let mut metadata = ProviderMetadata {
        correlation_id: cb.merchant_request_id,
        result_code: Some(cb.result_code),
        message: cb.result_desc,
        ..Default::default()
    };
    for item in cb.callback_metadata.map(|m| m.items).unwrap_or_default() {
        match (item.name.as_str(), item.value) {
            ("MpesaReceiptNumber", Some(v)) => metadata.receipt = v.as_str().map(String::from),
            ("TransactionDate", Some(v)) => metadata.paid_at = parse_transaction_date(&v),
            _ => {}
        }
    }

    Ok(CallbackEvent {
        provider_handle: cb.checkout_request_id,
        outcome: outcome_for_result_code(cb.result_code),
        metadata,
    })
}

/// `TransactionDate` is a `yyyyMMddHHmmss` number in East Africa Time.
fn parse_transaction_date(value: &Value) -> Option<i64> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    let naive = NaiveDateTime::parse_from_str(&raw, "%Y%m%d%H%M%S").ok()?;
    let eat = FixedOffset::east_opt(3 * 3600)?;
    eat.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}
