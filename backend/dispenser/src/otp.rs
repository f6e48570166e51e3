//! One-time dispensing codes: generation, hashing and issuance.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use sqlx::SqlitePool;
use tracing::info;

use crate::cache::CredentialCache;
use crate::config::OtpConfig;
use crate::db;
use crate::db::credentials::NewCredential;
use crate::errors::{AppError, Result};
use crate::models::{Credential, CredentialStatus, TransactionStatus, TransactionView};
use crate::notify::{CodeMessage, NotificationDispatcher};

type HmacSha256 = Hmac<Sha256>;

/// Largest multiple of 10 that fits in a byte; higher draws are resampled.
const DIGIT_ZONE: u8 = 250;

/// A uniformly distributed numeric code of `length` digits from the OS CSPRNG.
pub fn generate_code(length: usize) -> String {
    let mut code = String::with_capacity(length);
    let mut buf = [0u8; 16];
    while code.len() < length {
        OsRng.fill_bytes(&mut buf);
        for b in buf {
            if b < DIGIT_ZONE && code.len() < length {
                code.push(char::from(b'0' + b % 10));
            }
        }
    }
    code
}

/// Keyed one-way digest of codes. The transaction reference is part of the
/// message so a digest is only valid for the transaction it was issued for.
#[derive(Clone)]
pub struct CodeHasher {
    key: Arc<[u8]>,
}

impl CodeHasher {
    pub fn new(secret: &str) -> Self {
        Self {
            key: Arc::from(secret.as_bytes()),
        }
    }

    fn mac(&self, reference: &str, code: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AppError::Config(format!("Invalid OTP secret: {e}")))?;
        mac.update(reference.as_bytes());
        mac.update(b":");
        mac.update(code.as_bytes());
        Ok(mac)
    }

    pub fn hash(&self, reference: &str, code: &str) -> Result<String> {
        Ok(hex::encode(self.mac(reference, code)?.finalize().into_bytes()))
    }

    /// Constant-time comparison of `code` against a stored digest.
    pub fn matches(&self, reference: &str, code: &str, stored_hash: &str) -> Result<bool> {
        let Ok(expected) = hex::decode(stored_hash) else {
            return Ok(false);
        };
        Ok(self.mac(reference, code)?.verify_slice(&expected).is_ok())
    }
}

/// The one response that carries a plaintext code.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCredential {
    pub transaction_reference: String,
    pub code: String,
    pub liters: f64,
    pub expires_at: i64,
    pub ttl_minutes: i64,
}

/// Customer-facing metadata for the current credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSummary {
    pub transaction_reference: String,
    pub status: CredentialStatus,
    pub liters: f64,
    pub expires_at: i64,
    pub expired: bool,
    pub attempts_remaining: i64,
    pub station_id: Option<String>,
    pub verified_at: Option<i64>,
    pub used_at: Option<i64>,
}

impl CredentialSummary {
    pub fn of(cred: &Credential, now: i64) -> Self {
        let expired = cred.is_expired_at(now);
        Self {
            transaction_reference: cred.transaction_reference.clone(),
            status: if expired {
                CredentialStatus::Expired
            } else {
                cred.status
            },
            liters: cred.liters,
            expires_at: cred.expires_at,
            expired,
            attempts_remaining: cred.remaining_attempts(),
            station_id: cred.station_id.clone(),
            verified_at: cred.verified_at,
            used_at: cred.used_at,
        }
    }
}

pub struct CredentialIssuer {
    pool: SqlitePool,
    hasher: CodeHasher,
    config: OtpConfig,
    cache: Option<Arc<CredentialCache>>,
    dispatcher: NotificationDispatcher,
}

impl CredentialIssuer {
    pub fn new(
        pool: SqlitePool,
        config: OtpConfig,
        cache: Option<Arc<CredentialCache>>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        Self {
            pool,
            hasher: CodeHasher::new(&config.secret),
            config,
            cache,
            dispatcher,
        }
    }

    pub fn hasher(&self) -> &CodeHasher {
        &self.hasher
    }

    fn new_code(&self, reference: &str) -> Result<(String, String)> {
        let code = generate_code(self.config.length);
        let hash = self.hasher.hash(reference, &code)?;
        Ok((code, hash))
    }

    /// Issue a credential for a completed transaction, expiring any live one.
    /// A code already claimed by a station is expired as well: the station
    /// keeps the pulses it was granted but can no longer `complete`.
    pub async fn issue(&self, reference: &str) -> Result<IssuedCredential> {
        let txn = db::transactions::find_view(&self.pool, reference)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(reference.to_string()))?;
        if txn.status != TransactionStatus::Completed {
            return Err(AppError::TransactionNotCompleted(reference.to_string()));
        }
        if db::credentials::has_used(&self.pool, reference).await? {
            return Err(AppError::AlreadyUsed);
        }

        let now = db::now();
        let (code, hash) = self.new_code(reference)?;
        let cred = db::credentials::replace(
            &self.pool,
            &NewCredential {
                transaction_reference: reference,
                secret_hash: &hash,
                liters: txn.liters,
                max_attempts: self.config.max_attempts,
                expires_at: now + self.config.ttl_minutes * 60,
            },
            now,
        )
        .await?;
        self.refresh_cache(&cred).await;
        info!("Issued credential #{} for {reference}", cred.id);

        Ok(IssuedCredential {
            transaction_reference: reference.to_string(),
            code,
            liters: cred.liters,
            expires_at: cred.expires_at,
            ttl_minutes: self.config.ttl_minutes,
        })
    }

    /// Issue the first credential for a transaction that just completed and
    /// hand the code to the notification dispatcher. A no-op when the
    /// transaction already has a credential.
    pub async fn issue_on_completion(&self, txn: &TransactionView) -> Result<bool> {
        let now = db::now();
        let (code, hash) = self.new_code(&txn.reference)?;
        let inserted = db::credentials::insert_first(
            &self.pool,
            &NewCredential {
                transaction_reference: &txn.reference,
                secret_hash: &hash,
                liters: txn.liters,
                max_attempts: self.config.max_attempts,
                expires_at: now + self.config.ttl_minutes * 60,
            },
            now,
        )
        .await?;

        let Some(cred) = inserted else {
            info!("Credential for {} already exists; not reissuing", txn.reference);
            return Ok(false);
        };
        self.refresh_cache(&cred).await;
        info!("Issued credential #{} for completed {}", cred.id, txn.reference);

        if let Some(phone) = &txn.phone_number {
            self.dispatcher.dispatch(CodeMessage {
                destination: phone.clone(),
                code,
                liters: cred.liters,
                ttl_minutes: self.config.ttl_minutes,
                reference: txn.reference.clone(),
            });
        }
        Ok(true)
    }

    /// Metadata of the current credential; never exposes the code.
    pub async fn status(&self, reference: &str) -> Result<CredentialSummary> {
        let cred = self.current(reference).await?;
        Ok(CredentialSummary::of(&cred, db::now()))
    }

    async fn current(&self, reference: &str) -> Result<Credential> {
        load_current(&self.pool, self.cache.as_deref(), reference).await
    }

    async fn refresh_cache(&self, cred: &Credential) {
        if let Some(cache) = &self.cache {
            cache.put(cred).await;
        }
    }
}

/// The latest credential for a reference, from the cache when possible.
/// Only for read paths: decisions that mutate a credential read the store.
pub(crate) async fn load_current(
    pool: &SqlitePool,
    cache: Option<&CredentialCache>,
    reference: &str,
) -> Result<Credential> {
    if let Some(cred) = match cache {
        Some(cache) => cache.get(reference).await,
        None => None,
    } {
        return Ok(cred);
    }
    let cred = db::credentials::latest(pool, reference)
        .await?
        .ok_or_else(|| AppError::CredentialNotFound(reference.to_string()))?;
    if let Some(cache) = cache {
        cache.put(&cred).await;
    }
    Ok(cred)
}
