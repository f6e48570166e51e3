//! Application-wide error types and their HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("Unknown payment variant: {0}")]
    UnknownVariant(String),

    #[error("Transaction {0} not found")]
    TransactionNotFound(String),

    #[error("Transaction {0} is not completed")]
    TransactionNotCompleted(String),

    #[error("Transaction reference {0} is already in use")]
    DuplicateReference(String),

    #[error("No dispensing code found for transaction {0}")]
    CredentialNotFound(String),

    #[error("Dispensing code has expired")]
    Expired,

    #[error("Dispensing code has already been used")]
    AlreadyUsed,

    #[error("Dispensing code is blocked after too many failed attempts")]
    Blocked,

    #[error("Invalid code, {remaining} attempt(s) remaining")]
    InvalidCode { remaining: i64 },

    #[error("Dispensing code is locked to another station")]
    ForbiddenStationLock,

    #[error("Dispensing code is in use at another station")]
    InUseElsewhere,

    #[error("Dispensing code is not in progress at this station")]
    NotInProgress,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Malformed provider payload: {0}")]
    CallbackParse(String),

    #[error("Payment provider error: {0}")]
    Gateway(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Stable machine-readable code returned to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => {
                "INTERNAL_ERROR"
            }
            Self::Http(_) | Self::Gateway(_) => "GATEWAY_ERROR",
            Self::InvalidInput(_) | Self::UnknownVariant(_) | Self::CallbackParse(_) => {
                "INVALID_INPUT"
            }
            Self::OutOfRange(_) => "OUT_OF_RANGE",
            Self::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            Self::TransactionNotCompleted(_) => "TRANSACTION_NOT_COMPLETED",
            Self::DuplicateReference(_) => "DUPLICATE_REFERENCE",
            Self::CredentialNotFound(_) => "NOT_FOUND",
            Self::Expired => "EXPIRED",
            Self::AlreadyUsed => "ALREADY_USED",
            Self::Blocked => "BLOCKED",
            Self::InvalidCode { .. } => "INVALID_CODE",
            Self::ForbiddenStationLock => "FORBIDDEN_STATION_LOCK",
            Self::InUseElsewhere => "IN_USE_ELSEWHERE",
            Self::NotInProgress => "NOT_IN_PROGRESS",
            Self::InvalidSignature => "INVALID_SIGNATURE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Http(_) | Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::TransactionNotFound(_) | Self::CredentialNotFound(_) => StatusCode::NOT_FOUND,
            Self::ForbiddenStationLock => StatusCode::FORBIDDEN,
            Self::InUseElsewhere | Self::DuplicateReference(_) => StatusCode::CONFLICT,
            Self::InvalidSignature => StatusCode::UNAUTHORIZED,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Expected, user-correctable errors whose message is safe to return.
    pub fn is_operational(&self) -> bool {
        !matches!(
            self,
            Self::Database(_) | Self::Migrate(_) | Self::Json(_) | Self::Config(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = if self.is_operational() {
            self.to_string()
        } else {
            error!("Internal error: {self:?}");
            "Internal server error".to_string()
        };

        let mut error = json!({
            "code": self.code(),
            "message": message,
        });
        if let Self::InvalidCode { remaining } = &self {
            error["remainingAttempts"] = json!(remaining);
        }

        (
            self.status(),
            Json(json!({ "success": false, "error": error })),
        )
            .into_response()
    }
}
