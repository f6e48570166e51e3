//! Payment network adapters.
//!
//! Each adapter normalizes its provider's vocabulary (result codes, event
//! names, status strings) into a [`ProviderOutcome`]; the ledger maps that
//! outcome onto the variant's state machine.

pub mod mpesa;
pub mod paystack;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::PaymentVariant;

/// Where the payment prompt goes.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitiateRequest<'a> {
    pub reference: &'a str,
    /// Adjusted amount in major currency units.
    pub amount: f64,
    pub currency: &'a str,
    pub destination: &'a Destination,
}

/// Provider acknowledgement of a payment request.
#[derive(Debug, Clone, Default)]
pub struct Initiation {
    /// Key the provider uses in callbacks and status queries.
    pub provider_handle: String,
    pub correlation_id: Option<String>,
    /// Prompt text for push payments.
    pub customer_message: Option<String>,
    /// Checkout page for hosted payments.
    pub redirect_url: Option<String>,
}

/// A provider's verdict on a payment, in variant-independent terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderOutcome {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
    /// Not settled yet; carries no transition.
    Pending,
}

/// Optional confirmation details. Every field is write-once on the
/// transaction row and none of them is needed for correctness.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderMetadata {
    pub provider_handle: Option<String>,
    pub correlation_id: Option<String>,
    pub redirect_url: Option<String>,
    pub receipt: Option<String>,
    pub result_code: Option<i64>,
    pub message: Option<String>,
    pub channel: Option<String>,
    pub card_type: Option<String>,
    pub last4: Option<String>,
    pub bank: Option<String>,
    pub paid_at: Option<i64>,
}

/// Fields of [`ProviderMetadata`] that a store may map onto a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataField {
    ProviderHandle,
    CorrelationId,
    RedirectUrl,
    Receipt,
    ResultCode,
    Message,
    Channel,
    CardType,
    Last4,
    Bank,
    PaidAt,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue<'a> {
    Text(&'a str),
    Int(i64),
}

impl ProviderMetadata {
    pub fn value(&self, field: MetadataField) -> Option<MetadataValue<'_>> {
        fn text(v: &Option<String>) -> Option<MetadataValue<'_>> {
            v.as_deref().map(MetadataValue::Text)
        }

        match field {
            MetadataField::ProviderHandle => text(&self.provider_handle),
            MetadataField::CorrelationId => text(&self.correlation_id),
            MetadataField::RedirectUrl => text(&self.redirect_url),
            MetadataField::Receipt => text(&self.receipt),
            MetadataField::ResultCode => self.result_code.map(MetadataValue::Int),
            MetadataField::Message => text(&self.message),
            MetadataField::Channel => text(&self.channel),
            MetadataField::CardType => text(&self.card_type),
            MetadataField::Last4 => text(&self.last4),
            MetadataField::Bank => text(&self.bank),
            MetadataField::PaidAt => self.paid_at.map(MetadataValue::Int),
        }
    }
}

/// The prompt text is returned to the customer, not stored: the message
/// column is reserved for the provider's final result description.
impl From<&Initiation> for ProviderMetadata {
    fn from(init: &Initiation) -> Self {
        Self {
            provider_handle: Some(init.provider_handle.clone()),
            correlation_id: init.correlation_id.clone(),
            redirect_url: init.redirect_url.clone(),
            ..Default::default()
        }
    }
}

/// Result of actively querying the provider.
#[derive(Debug, Clone)]
pub struct Verification {
    pub outcome: ProviderOutcome,
    pub metadata: ProviderMetadata,
}

/// A decoded asynchronous notification from the provider.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub provider_handle: String,
    pub outcome: ProviderOutcome,
    pub metadata: ProviderMetadata,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn variant(&self) -> PaymentVariant;

    /// Ask the provider to collect `request.amount`.
    async fn initiate(&self, request: &InitiateRequest<'_>) -> Result<Initiation>;

    /// Query the provider for the current state of a payment.
    async fn verify(&self, provider_handle: &str) -> Result<Verification>;

    /// Authenticate and decode a raw callback body. Adapters whose provider
    /// signs notifications reject a missing or wrong `signature` with
    /// `AppError::InvalidSignature`.
    fn parse_callback(&self, raw: &[u8], signature: Option<&str>) -> Result<CallbackEvent>;
}

/// Parse an RFC 3339 timestamp into Unix seconds.
pub(crate) fn parse_iso_to_unix(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}
