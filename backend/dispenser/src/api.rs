//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::errors::{AppError, Result};
use crate::gateway::paystack::SIGNATURE_HEADER;
use crate::ledger::{InitiateInput, TransactionLedger};
use crate::models::PaymentVariant;
use crate::otp::CredentialIssuer;
use crate::pricing::PricingEngine;
use crate::station::DispensingAuthorizer;

pub struct ApiState {
    pub pricing: Arc<PricingEngine>,
    pub ledger: Arc<TransactionLedger>,
    pub issuer: Arc<CredentialIssuer>,
    pub authorizer: Arc<DispensingAuthorizer>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let api = Router::new()
        .route("/preview", post(preview))
        .route("/payments/status/:reference", get(payment_status))
        .route("/payments/:variant/initiate", post(initiate_payment))
        .route("/payments/:variant/callback", post(payment_callback))
        .route("/payments/:variant/webhook", post(payment_webhook))
        .route("/otp/generate", post(generate_code))
        .route("/otp/verify", post(verify_code))
        .route("/otp/status/:reference", get(code_status))
        .route("/stations/otp/verify", post(station_verify))
        .route("/stations/otp/status/:reference", get(station_status))
        .route("/stations/otp/complete", post(station_complete));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub amount: Option<f64>,
    pub liters: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateCodeRequest {
    pub transaction_reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCodeRequest {
    pub transaction_reference: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationVerifyRequest {
    pub transaction_reference: String,
    pub code: String,
    pub station_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationCompleteRequest {
    pub transaction_reference: String,
    pub station_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStatusQuery {
    pub station_id: Option<String>,
}

fn success<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "success": true, "data": data }))
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/preview`
async fn preview(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<PreviewRequest>,
) -> Result<Json<Value>> {
    let preview = match (req.amount, req.liters) {
        (Some(amount), _) => state.pricing.preview(amount)?,
        (None, Some(liters)) => state.pricing.preview_liters(liters)?,
        (None, None) => {
            return Err(AppError::InvalidInput(
                "Either amount or liters is required".to_string(),
            ))
        }
    };
    Ok(success(preview))
}

/// `POST /api/payments/:variant/initiate`
async fn initiate_payment(
    State(state): State<Arc<ApiState>>,
    Path(variant): Path<String>,
    Json(input): Json<InitiateInput>,
) -> Result<Json<Value>> {
    let variant: PaymentVariant = variant.parse()?;
    let payment = state.ledger.initiate(variant, input).await?;
    Ok(success(payment))
}

/// `POST /api/payments/:variant/callback`
///
/// Always acknowledged; processing failures are only logged.
async fn payment_callback(
    State(state): State<Arc<ApiState>>,
    Path(variant): Path<String>,
    body: Bytes,
) -> Response {
    let result = match variant.parse::<PaymentVariant>() {
        Ok(variant) => state.ledger.handle_callback(variant, &body).await,
        Err(e) => Err(e),
    };
    acknowledge("callback", result)
}

/// `POST /api/payments/:variant/webhook`
///
/// Rejects a bad signature with 401; anything after authentication is
/// acknowledged.
async fn payment_webhook(
    State(state): State<Arc<ApiState>>,
    Path(variant): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    let result = match variant.parse::<PaymentVariant>() {
        Ok(variant) => state.ledger.handle_webhook(variant, &body, signature).await,
        Err(e) => Err(e),
    };
    acknowledge("webhook", result)
}

fn acknowledge(kind: &str, result: Result<()>) -> Response {
    match result {
        Ok(()) => {}
        Err(AppError::InvalidSignature) => return AppError::InvalidSignature.into_response(),
        Err(e) => warn!("Payment {kind} not applied: {e}"),
    }
    Json(json!({ "success": true })).into_response()
}

/// `GET /api/payments/status/:reference`
async fn payment_status(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
) -> Result<Json<Value>> {
    Ok(success(state.ledger.status(&reference).await?))
}

/// `POST /api/otp/generate`
///
/// The only response that ever carries a plaintext code.
async fn generate_code(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<GenerateCodeRequest>,
) -> Result<Json<Value>> {
    Ok(success(state.issuer.issue(&req.transaction_reference).await?))
}

/// `POST /api/otp/verify`
async fn verify_code(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<VerifyCodeRequest>,
) -> Result<Json<Value>> {
    let check = state
        .authorizer
        .check(&req.transaction_reference, &req.code)
        .await?;
    Ok(success(check))
}

/// `GET /api/otp/status/:reference`
async fn code_status(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
) -> Result<Json<Value>> {
    Ok(success(state.issuer.status(&reference).await?))
}

/// `POST /api/stations/otp/verify`
async fn station_verify(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<StationVerifyRequest>,
) -> Result<Json<Value>> {
    let authorization = state
        .authorizer
        .verify(&req.transaction_reference, &req.code, &req.station_id)
        .await?;
    Ok(success(authorization))
}

/// `GET /api/stations/otp/status/:reference?stationId=`
async fn station_status(
    State(state): State<Arc<ApiState>>,
    Path(reference): Path<String>,
    Query(query): Query<StationStatusQuery>,
) -> Result<Json<Value>> {
    let status = state
        .authorizer
        .status(&reference, query.station_id.as_deref())
        .await?;
    Ok(success(status))
}

/// `POST /api/stations/otp/complete`
async fn station_complete(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<StationCompleteRequest>,
) -> Result<Json<Value>> {
    let completion = state
        .authorizer
        .complete(&req.transaction_reference, &req.station_id)
        .await?;
    Ok(success(completion))
}
