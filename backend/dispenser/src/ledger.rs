//! Payment lifecycle across both variants.
//!
//! Every status change is a conditional write from the statuses the variant's
//! state machine allows. Only the caller whose write moved a transaction to
//! `completed` triggers credential issuance.

use std::collections::HashMap;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::db;
use crate::db::transactions::{NewTransaction, OPEN_STATUSES};
use crate::errors::{AppError, Result};
use crate::gateway::mpesa::normalize_msisdn;
use crate::gateway::{CallbackEvent, Destination, InitiateRequest, PaymentGateway, ProviderMetadata, ProviderOutcome};
use crate::models::{PaymentVariant, TransactionStatus, TransactionView};
use crate::otp::CredentialIssuer;
use crate::pricing::PricingEngine;

/// A payment request as received from the customer. Exactly one of
/// `amount` and `liters` is expected; `amount` wins when both are set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateInput {
    pub amount: Option<f64>,
    pub liters: Option<f64>,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatedPayment {
    pub transaction_reference: String,
    pub variant: PaymentVariant,
    pub status: TransactionStatus,
    pub provider_handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_url: Option<String>,
    pub amount: f64,
    pub liters: f64,
    pub currency: String,
}

/// Body of the hosted checkout redirect.
#[derive(Debug, Deserialize)]
struct RedirectCallback {
    reference: Option<String>,
    trxref: Option<String>,
}

pub struct TransactionLedger {
    pool: SqlitePool,
    pricing: Arc<PricingEngine>,
    issuer: Arc<CredentialIssuer>,
    gateways: HashMap<PaymentVariant, Arc<dyn PaymentGateway>>,
}

impl TransactionLedger {
    pub fn new(pool: SqlitePool, pricing: Arc<PricingEngine>, issuer: Arc<CredentialIssuer>) -> Self {
        Self {
            pool,
            pricing,
            issuer,
            gateways: HashMap::new(),
        }
    }

    /// Register the adapter for the variant it reports.
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.variant(), gateway);
        self
    }

    fn gateway(&self, variant: PaymentVariant) -> Result<&Arc<dyn PaymentGateway>> {
        self.gateways.get(&variant).ok_or_else(|| {
            AppError::Gateway(format!("Payment variant {variant} is not configured"))
        })
    }

    // ─────────────────────────────────────────────────────────
    // Initiation
    // ─────────────────────────────────────────────────────────

    /// Price the request, record it as `pending` and hand it to the provider.
    /// A provider failure marks the transaction `failed`; it is not retried.
    pub async fn initiate(&self, variant: PaymentVariant, input: InitiateInput) -> Result<InitiatedPayment> {
        let gateway = Arc::clone(self.gateway(variant)?);

        let preview = match (input.amount, input.liters) {
            (Some(amount), _) => self.pricing.preview(amount)?,
            (None, Some(liters)) => self.pricing.preview_liters(liters)?,
            (None, None) => {
                return Err(AppError::InvalidInput(
                    "Either amount or liters is required".to_string(),
                ))
            }
        };

        let phone_number = match (variant, non_blank(input.phone_number)) {
            (PaymentVariant::MobilePush, None) => {
                return Err(AppError::InvalidInput("Phone number is required".to_string()))
            }
            (PaymentVariant::MobilePush, Some(phone)) => Some(normalize_msisdn(&phone)?),
            (PaymentVariant::HostedCheckout, phone) => phone,
        };
        let email = non_blank(input.email);
        if variant == PaymentVariant::HostedCheckout && email.is_none() {
            return Err(AppError::InvalidInput("Email is required".to_string()));
        }

        let reference = new_reference();
        let now = db::now();
        db::transactions::insert(
            &self.pool,
            variant,
            &NewTransaction {
                reference: reference.clone(),
                amount: preview.amount,
                liters: preview.liters,
                currency: preview.currency.clone(),
                phone_number: phone_number.clone(),
                email: email.clone(),
            },
            now,
        )
        .await?;
        info!(
            "Created {variant} transaction {reference}: {} {} for {} L",
            preview.amount, preview.currency, preview.liters
        );

        let destination = Destination {
            phone_number,
            email,
        };
        let request = InitiateRequest {
            reference: &reference,
            amount: preview.amount,
            currency: &preview.currency,
            destination: &destination,
        };

        let initiation = match gateway.initiate(&request).await {
            Ok(initiation) => initiation,
            Err(e) => {
                let message = match e {
                    AppError::Gateway(msg) => msg,
                    other => other.to_string(),
                };
                warn!("Initiation of {reference} failed: {message}");
                let metadata = ProviderMetadata {
                    message: Some(message.clone()),
                    ..Default::default()
                };
                db::transactions::transition(
                    &self.pool,
                    variant,
                    &reference,
                    &[TransactionStatus::Pending],
                    TransactionStatus::Failed,
                    &metadata,
                    db::now(),
                )
                .await?;
                return Err(AppError::Gateway(message));
            }
        };

        db::transactions::transition(
            &self.pool,
            variant,
            &reference,
            &[TransactionStatus::Pending],
            TransactionStatus::Processing,
            &ProviderMetadata::from(&initiation),
            db::now(),
        )
        .await?;
        debug!("{reference} accepted by provider as {}", initiation.provider_handle);

        Ok(InitiatedPayment {
            transaction_reference: reference,
            variant,
            status: TransactionStatus::Processing,
            provider_handle: initiation.provider_handle,
            customer_message: initiation.customer_message,
            authorization_url: initiation.redirect_url,
            amount: preview.amount,
            liters: preview.liters,
            currency: preview.currency,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Provider notifications
    // ─────────────────────────────────────────────────────────

    /// Handle the variant's callback. For mobile push this is the provider's
    /// result notification; for hosted checkout it is the customer redirect,
    /// which is only trusted after verifying with the provider.
    pub async fn handle_callback(&self, variant: PaymentVariant, raw: &[u8]) -> Result<()> {
        match variant {
            PaymentVariant::MobilePush => self.handle_webhook(variant, raw, None).await,
            PaymentVariant::HostedCheckout => {
                let body: RedirectCallback = serde_json::from_slice(raw)
                    .map_err(|e| AppError::CallbackParse(format!("redirect: {e}")))?;
                let reference = body
                    .reference
                    .or(body.trxref)
                    .ok_or_else(|| AppError::CallbackParse("redirect without reference".to_string()))?;
                let view = db::transactions::find_view(&self.pool, &reference)
                    .await?
                    .filter(|v| v.variant == variant)
                    .ok_or_else(|| AppError::TransactionNotFound(reference.clone()))?;
                self.poll_provider(&view).await
            }
        }
    }

    /// Authenticate and apply a provider notification. Signature failures are
    /// returned before anything is written.
    pub async fn handle_webhook(
        &self,
        variant: PaymentVariant,
        raw: &[u8],
        signature: Option<&str>,
    ) -> Result<()> {
        let event = self.gateway(variant)?.parse_callback(raw, signature)?;
        self.apply_event(variant, event).await
    }

    async fn apply_event(&self, variant: PaymentVariant, event: CallbackEvent) -> Result<()> {
        let reference =
            db::transactions::reference_for_handle(&self.pool, variant, &event.provider_handle).await?;
        let Some(reference) = reference else {
            warn!(
                "{variant} notification for unknown handle {}",
                event.provider_handle
            );
            return Ok(());
        };
        self.apply_outcome(variant, &reference, event.outcome, &event.metadata)
            .await?;
        Ok(())
    }

    /// Move `reference` according to a normalized provider outcome. Returns
    /// the new status when this call performed the transition.
    pub async fn apply_outcome(
        &self,
        variant: PaymentVariant,
        reference: &str,
        outcome: ProviderOutcome,
        metadata: &ProviderMetadata,
    ) -> Result<Option<TransactionStatus>> {
        let target = match outcome {
            ProviderOutcome::Succeeded => TransactionStatus::Completed,
            ProviderOutcome::Failed => TransactionStatus::Failed,
            ProviderOutcome::Cancelled => TransactionStatus::Cancelled,
            ProviderOutcome::TimedOut => match variant {
                PaymentVariant::MobilePush => TransactionStatus::Timeout,
                PaymentVariant::HostedCheckout => TransactionStatus::Failed,
            },
            ProviderOutcome::Pending => return Ok(None),
        };
        let from: Vec<TransactionStatus> = OPEN_STATUSES
            .into_iter()
            .filter(|s| s.can_transition_to(target, variant))
            .collect();

        let moved = db::transactions::transition(
            &self.pool,
            variant,
            reference,
            &from,
            target,
            metadata,
            db::now(),
        )
        .await?;
        if !moved {
            debug!("{reference} already settled; ignoring {outcome:?}");
            return Ok(None);
        }
        info!("{variant} transaction {reference} → {target}");

        if target == TransactionStatus::Completed {
            self.on_completed(reference).await;
        }
        Ok(Some(target))
    }

    /// Issue the first credential. Payment state is already durable, so a
    /// failure here is logged and left to an explicit `otp/generate`.
    async fn on_completed(&self, reference: &str) {
        let view = match db::transactions::find_view(&self.pool, reference).await {
            Ok(Some(view)) => view,
            Ok(None) => return,
            Err(e) => {
                error!("Could not reload completed {reference}: {e}");
                return;
            }
        };
        if let Err(e) = self.issuer.issue_on_completion(&view).await {
            error!("Credential issuance for {reference} failed: {e}");
        }
    }

    // ─────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────

    /// Unified lookup. Stale transactions are expired on read; open ones
    /// are checked with the provider first.
    pub async fn status(&self, reference: &str) -> Result<TransactionView> {
        let view = self.find(reference).await?;
        let now = db::now();

        if view.is_stale(now) {
            let stale = view.variant.stale_status();
            let moved = db::transactions::transition(
                &self.pool,
                view.variant,
                reference,
                &OPEN_STATUSES,
                stale,
                &ProviderMetadata::default(),
                now,
            )
            .await?;
            if moved {
                info!("{} transaction {reference} → {stale} on read", view.variant);
            }
            return self.find(reference).await;
        }

        if !view.status.is_terminal() && self.gateways.contains_key(&view.variant) {
            if let Err(e) = self.poll_provider(&view).await {
                warn!("Provider status check for {reference} failed: {e}");
            }
            return self.find(reference).await;
        }
        Ok(view)
    }

    async fn poll_provider(&self, view: &TransactionView) -> Result<()> {
        let Some(handle) = view.provider_handle.as_deref() else {
            return Ok(());
        };
        let verification = self.gateway(view.variant)?.verify(handle).await?;
        self.apply_outcome(
            view.variant,
            &view.reference,
            verification.outcome,
            &verification.metadata,
        )
        .await?;
        Ok(())
    }

    async fn find(&self, reference: &str) -> Result<TransactionView> {
        db::transactions::find_view(&self.pool, reference)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(reference.to_string()))
    }
}

/// `FD-<unix seconds>-<8 hex chars>`
fn new_reference() -> String {
    let mut suffix = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("FD-{}-{}", db::now(), hex::encode(suffix))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn references_are_prefixed_and_distinct() {
        let a = new_reference();
        let b = new_reference();
        assert!(a.starts_with("FD-"));
        assert_eq!(a.rsplit('-').next().map(str::len), Some(8));
        assert_ne!(a, b);
    }

    #[test]
    fn blank_values_are_dropped() {
        assert_eq!(non_blank(Some("  ".into())), None);
        assert_eq!(non_blank(Some(" a@b.c ".into())), Some("a@b.c".to_string()));
        assert_eq!(non_blank(None), None);
    }
}
