//! Domain records shared by the ledger, the credential machinery and the API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Mobile push payments without a terminal callback time out after 30 minutes.
pub const MOBILE_PUSH_TIMEOUT_SECS: i64 = 30 * 60;
/// Hosted checkout sessions stay payable for 24 hours.
pub const HOSTED_CHECKOUT_WINDOW_SECS: i64 = 24 * 60 * 60;

/// The two supported payment networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentVariant {
    /// Push-to-pay prompt on the customer's phone (M-Pesa STK push).
    MobilePush,
    /// Redirect to a hosted card/bank checkout page (Paystack).
    HostedCheckout,
}

impl PaymentVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MobilePush => "mobile_push",
            Self::HostedCheckout => "hosted_checkout",
        }
    }

    /// Status a stale, unconfirmed transaction of this variant ends in.
    pub fn stale_status(&self) -> TransactionStatus {
        match self {
            Self::MobilePush => TransactionStatus::Timeout,
            Self::HostedCheckout => TransactionStatus::Expired,
        }
    }
}

impl FromStr for PaymentVariant {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mobile_push" | "mobile-push" | "mpesa" => Ok(Self::MobilePush),
            "hosted_checkout" | "hosted-checkout" | "paystack" => Ok(Self::HostedCheckout),
            other => Err(AppError::UnknownVariant(other.to_string())),
        }
    }
}

impl fmt::Display for PaymentVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
    Timeout,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    /// Whether `self → next` is an edge of `variant`'s state machine.
    pub fn can_transition_to(&self, next: TransactionStatus, variant: PaymentVariant) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            // Initiation failures are recorded straight from pending.
            (Pending, Failed) => true,
            (Pending | Processing, Completed | Cancelled) => true,
            (Processing, Failed) => true,
            (Pending | Processing, Timeout) => variant == PaymentVariant::MobilePush,
            (Pending | Processing, Expired) => variant == PaymentVariant::HostedCheckout,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mobile push transaction as stored in `mobile_push_transactions`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MobilePushRecord {
    pub reference: String,
    pub amount: f64,
    pub liters: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub phone_number: String,
    pub checkout_request_id: Option<String>,
    pub merchant_request_id: Option<String>,
    pub receipt_number: Option<String>,
    pub result_code: Option<i64>,
    pub result_desc: Option<String>,
    pub paid_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A hosted checkout transaction as stored in `hosted_checkout_transactions`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HostedCheckoutRecord {
    pub reference: String,
    pub amount: f64,
    pub liters: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub email: String,
    pub phone_number: Option<String>,
    pub access_code: Option<String>,
    pub authorization_url: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub channel: Option<String>,
    pub card_type: Option<String>,
    pub last4: Option<String>,
    pub bank: Option<String>,
    pub gateway_response: Option<String>,
    pub paid_at: Option<i64>,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Variant-independent read view of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionView {
    pub reference: String,
    pub variant: PaymentVariant,
    pub amount: f64,
    pub liters: f64,
    pub currency: String,
    pub status: TransactionStatus,
    pub provider_handle: Option<String>,
    pub receipt: Option<String>,
    pub channel: Option<String>,
    pub message: Option<String>,
    pub phone_number: Option<String>,
    pub paid_at: Option<i64>,
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TransactionView {
    /// Past its payable window while still unconfirmed.
    pub fn is_stale(&self, now: i64) -> bool {
        !self.status.is_terminal() && self.expires_at < now
    }
}

impl From<MobilePushRecord> for TransactionView {
    fn from(r: MobilePushRecord) -> Self {
        Self {
            expires_at: r.created_at + MOBILE_PUSH_TIMEOUT_SECS,
            reference: r.reference,
            variant: PaymentVariant::MobilePush,
            amount: r.amount,
            liters: r.liters,
            currency: r.currency,
            status: r.status,
            provider_handle: r.checkout_request_id,
            receipt: r.receipt_number,
            channel: Some("mpesa".to_string()),
            message: r.result_desc,
            phone_number: Some(r.phone_number),
            paid_at: r.paid_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

impl From<HostedCheckoutRecord> for TransactionView {
    fn from(r: HostedCheckoutRecord) -> Self {
        Self {
            // The provider handle for hosted checkout is our own reference.
            provider_handle: Some(r.reference.clone()),
            reference: r.reference,
            variant: PaymentVariant::HostedCheckout,
            amount: r.amount,
            liters: r.liters,
            currency: r.currency,
            status: r.status,
            receipt: r.provider_transaction_id,
            channel: r.channel,
            message: r.gateway_response,
            phone_number: r.phone_number,
            paid_at: r.paid_at,
            expires_at: r.expires_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    InProgress,
    Used,
    Expired,
    Blocked,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::InProgress => "in_progress",
            Self::Used => "used",
            Self::Expired => "expired",
            Self::Blocked => "blocked",
        }
    }
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-time dispensing code as stored in `credentials`. The plaintext
/// code is never part of this record.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub id: i64,
    pub transaction_reference: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub liters: f64,
    pub status: CredentialStatus,
    pub station_id: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub expires_at: i64,
    pub verified_at: Option<i64>,
    pub used_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Credential {
    pub fn remaining_attempts(&self) -> i64 {
        (self.max_attempts - self.attempts).max(0)
    }

    /// Expired either by status or by wall clock.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.status == CredentialStatus::Expired
            || (self.status == CredentialStatus::Active && self.expires_at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_from_path_segment() {
        assert_eq!("mpesa".parse::<PaymentVariant>().unwrap(), PaymentVariant::MobilePush);
        assert_eq!(
            "hosted_checkout".parse::<PaymentVariant>().unwrap(),
            PaymentVariant::HostedCheckout
        );
        assert!(matches!(
            "paypal".parse::<PaymentVariant>(),
            Err(AppError::UnknownVariant(_))
        ));
    }

    #[test]
    fn completed_never_expires() {
        use TransactionStatus::*;
        for variant in [PaymentVariant::MobilePush, PaymentVariant::HostedCheckout] {
            assert!(!Completed.can_transition_to(Expired, variant));
            assert!(!Completed.can_transition_to(Timeout, variant));
            assert!(!Failed.can_transition_to(Completed, variant));
        }
    }

    #[test]
    fn stale_edges_are_variant_specific() {
        use TransactionStatus::*;
        assert!(Processing.can_transition_to(Timeout, PaymentVariant::MobilePush));
        assert!(!Processing.can_transition_to(Expired, PaymentVariant::MobilePush));
        assert!(Pending.can_transition_to(Expired, PaymentVariant::HostedCheckout));
        assert!(!Pending.can_transition_to(Timeout, PaymentVariant::HostedCheckout));
    }

    #[test]
    fn active_credential_past_expiry_counts_as_expired() {
        let cred = Credential {
            id: 1,
            transaction_reference: "REF".into(),
            secret_hash: String::new(),
            liters: 10.0,
            status: CredentialStatus::Active,
            station_id: None,
            attempts: 1,
            max_attempts: 3,
            expires_at: 100,
            verified_at: None,
            used_at: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!cred.is_expired_at(99));
        assert!(cred.is_expired_at(100));
        assert_eq!(cred.remaining_attempts(), 2);
    }
}
