#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use dispenser::api::ApiState;
use dispenser::cache::CredentialCache;
use dispenser::config::{OtpConfig, PricingConfig, StationConfig};
use dispenser::db;
use dispenser::errors::{AppError, Result};
use dispenser::gateway::{
    mpesa, paystack, CallbackEvent, InitiateRequest, Initiation, PaymentGateway,
    ProviderMetadata, ProviderOutcome, Verification,
};
use dispenser::ledger::{InitiateInput, TransactionLedger};
use dispenser::models::PaymentVariant;
use dispenser::notify::{CodeMessage, DeliveryReport, NotificationDispatcher, Notifier};
use dispenser::otp::CredentialIssuer;
use dispenser::pricing::{PricingEngine, RoundingStrategy};
use dispenser::station::DispensingAuthorizer;

pub const WEBHOOK_SECRET: &str = "sk_test_webhook";
pub const PULSES_PER_LITER: f64 = 450.0;

// ─────────────────────────────────────────────────────────
// Doubles
// ─────────────────────────────────────────────────────────

/// Provider double: accepts or rejects initiation as configured and
/// answers status queries with a settable outcome.
pub struct ScriptedGateway {
    variant: PaymentVariant,
    fail_initiation: Option<String>,
    verify_outcome: Mutex<ProviderOutcome>,
    initiated: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new(variant: PaymentVariant, fail_initiation: Option<String>) -> Self {
        Self {
            variant,
            fail_initiation,
            verify_outcome: Mutex::new(ProviderOutcome::Pending),
            initiated: AtomicUsize::new(0),
        }
    }

    pub fn set_verify_outcome(&self, outcome: ProviderOutcome) {
        *self.verify_outcome.lock().unwrap() = outcome;
    }

    pub fn initiated(&self) -> usize {
        self.initiated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn variant(&self) -> PaymentVariant {
        self.variant
    }

    async fn initiate(&self, request: &InitiateRequest<'_>) -> Result<Initiation> {
        let n = self.initiated.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_initiation {
            return Err(AppError::Gateway(message.clone()));
        }
        Ok(match self.variant {
            PaymentVariant::MobilePush => Initiation {
                provider_handle: format!("ws_CO_{n}_{}", request.reference),
                correlation_id: Some(format!("m-{n}")),
                customer_message: Some("Success. Request accepted for processing".into()),
                redirect_url: None,
            },
            PaymentVariant::HostedCheckout => Initiation {
                provider_handle: request.reference.to_string(),
                correlation_id: Some(format!("ac_{n}")),
                customer_message: Some("Authorization URL created".into()),
                redirect_url: Some(format!("https://checkout.test/{}", request.reference)),
            },
        })
    }

    async fn verify(&self, _provider_handle: &str) -> Result<Verification> {
        Ok(Verification {
            outcome: *self.verify_outcome.lock().unwrap(),
            metadata: ProviderMetadata::default(),
        })
    }

    fn parse_callback(&self, raw: &[u8], signature: Option<&str>) -> Result<CallbackEvent> {
        match self.variant {
            PaymentVariant::MobilePush => mpesa::parse_stk_callback(raw),
            PaymentVariant::HostedCheckout => match signature {
                Some(sig) if paystack::verify_signature(WEBHOOK_SECRET, raw, sig) => {
                    paystack::parse_webhook(raw)
                }
                _ => Err(AppError::InvalidSignature),
            },
        }
    }
}

/// Keeps every code handed to it so tests can read the plaintext back.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<CodeMessage>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<CodeMessage> {
        self.sent.lock().unwrap().clone()
    }

    /// Delivery runs on a spawned task; wait for it to land.
    pub async fn code_for(&self, reference: &str) -> String {
        for _ in 0..100 {
            if let Some(msg) = self.sent().into_iter().find(|m| m.reference == reference) {
                return msg.code;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no code delivered for {reference}");
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_code(&self, message: &CodeMessage) -> Result<DeliveryReport> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReport {
            delivered: true,
            provider_message_id: None,
            attempts: 1,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

pub struct Options {
    pub lock_enabled: bool,
    pub max_attempts: i64,
    pub ttl_minutes: i64,
    pub fail_initiation: Option<String>,
    pub cache: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            max_attempts: 3,
            ttl_minutes: 10,
            fail_initiation: None,
            cache: true,
        }
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub cache: Option<Arc<CredentialCache>>,
    pub pricing: Arc<PricingEngine>,
    pub issuer: Arc<CredentialIssuer>,
    pub authorizer: Arc<DispensingAuthorizer>,
    pub ledger: Arc<TransactionLedger>,
    pub notifier: Arc<RecordingNotifier>,
    pub mobile: Arc<ScriptedGateway>,
    pub hosted: Arc<ScriptedGateway>,
}

pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    db::migrate(&pool).await.unwrap();
    pool
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Options::default()).await
    }

    pub async fn with(opts: Options) -> Self {
        let pool = memory_pool().await;
        let cache = opts
            .cache
            .then(|| Arc::new(CredentialCache::new(Duration::from_secs(30))));
        let notifier = Arc::new(RecordingNotifier::default());
        let dispatcher = NotificationDispatcher::new(notifier.clone(), Duration::from_secs(1));

        let pricing = Arc::new(PricingEngine::new(PricingConfig {
            price_per_liter: 5.0,
            currency: "KES".into(),
            min_amount: 5.0,
            max_amount: 10_000.0,
            rounding: RoundingStrategy::Nearest,
        }));
        let issuer = Arc::new(CredentialIssuer::new(
            pool.clone(),
            OtpConfig {
                length: 6,
                ttl_minutes: opts.ttl_minutes,
                max_attempts: opts.max_attempts,
                secret: "test-otp-secret".into(),
            },
            cache.clone(),
            dispatcher,
        ));
        let authorizer = Arc::new(DispensingAuthorizer::new(
            pool.clone(),
            issuer.hasher().clone(),
            StationConfig {
                lock_enabled: opts.lock_enabled,
                pulses_per_liter: PULSES_PER_LITER,
            },
            cache.clone(),
        ));

        let mobile = Arc::new(ScriptedGateway::new(
            PaymentVariant::MobilePush,
            opts.fail_initiation.clone(),
        ));
        let hosted = Arc::new(ScriptedGateway::new(
            PaymentVariant::HostedCheckout,
            opts.fail_initiation,
        ));
        let ledger = Arc::new(
            TransactionLedger::new(pool.clone(), pricing.clone(), issuer.clone())
                .with_gateway(mobile.clone())
                .with_gateway(hosted.clone()),
        );

        Self {
            pool,
            cache,
            pricing,
            issuer,
            authorizer,
            ledger,
            notifier,
            mobile,
            hosted,
        }
    }

    pub fn api_state(&self) -> Arc<ApiState> {
        Arc::new(ApiState {
            pricing: self.pricing.clone(),
            ledger: self.ledger.clone(),
            issuer: self.issuer.clone(),
            authorizer: self.authorizer.clone(),
        })
    }

    /// Initiate a mobile push payment and confirm it with result code 0.
    /// Returns the reference and the code delivered to the customer.
    pub async fn paid_mobile_push(&self, amount: f64) -> (String, String) {
        let payment = self
            .ledger
            .initiate(
                PaymentVariant::MobilePush,
                InitiateInput {
                    amount: Some(amount),
                    phone_number: Some("0712345678".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        self.ledger
            .handle_callback(
                PaymentVariant::MobilePush,
                &stk_callback(&payment.provider_handle, 0),
            )
            .await
            .unwrap();
        let code = self.notifier.code_for(&payment.transaction_reference).await;
        (payment.transaction_reference, code)
    }
}

// ─────────────────────────────────────────────────────────
// Provider payloads
// ─────────────────────────────────────────────────────────

pub fn stk_callback(checkout_request_id: &str, result_code: i64) -> Vec<u8> {
    let desc = match result_code {
        0 => "The service request is processed successfully.",
        1032 => "Request cancelled by user",
        1037 => "DS timeout user cannot be reached",
        _ => "The balance is insufficient for the transaction",
    };
    let mut callback = json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": checkout_request_id,
        "ResultCode": result_code,
        "ResultDesc": desc,
    });
    if result_code == 0 {
        callback["CallbackMetadata"] = json!({
            "Item": [
                { "Name": "Amount", "Value": 50.0 },
                { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                { "Name": "TransactionDate", "Value": 20191219102115_u64 },
            ]
        });
    }
    json!({ "Body": { "stkCallback": callback } })
        .to_string()
        .into_bytes()
}

pub fn paystack_event(event: &str, reference: &str) -> Vec<u8> {
    json!({
        "event": event,
        "data": {
            "id": 302961,
            "status": "success",
            "reference": reference,
            "paid_at": "2024-01-01T00:00:00.000Z",
            "channel": "card",
            "gateway_response": "Approved",
            "authorization": { "card_type": "visa", "last4": "4081", "bank": "TEST BANK" }
        }
    })
    .to_string()
    .into_bytes()
}
