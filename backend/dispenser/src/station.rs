//! Station-facing verification of dispensing codes.
//!
//! Credential lifecycle: `active → in_progress → used`, `active → expired`,
//! `active → blocked`. Failed attempts are only counted while `active`. Every decision that changes a credential
//! is taken by a conditional write against the store; when that write loses
//! a race the fresh row is re-evaluated and reported.

use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::cache::CredentialCache;
use crate::config::StationConfig;
use crate::db;
use crate::errors::{AppError, Result};
use crate::models::{Credential, CredentialStatus};
use crate::otp::{load_current, CodeHasher};

/// Successful station verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub transaction_reference: String,
    pub station_id: String,
    pub liters: f64,
    pub pulses: i64,
    pub status: CredentialStatus,
    pub verified_at: i64,
    pub expires_at: i64,
}

/// Successful customer-side code check. Nothing is claimed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeCheck {
    pub transaction_reference: String,
    pub valid: bool,
    pub liters: f64,
    pub expires_at: i64,
    pub attempts_remaining: i64,
}

/// Read-only station view of a credential.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationStatus {
    pub transaction_reference: String,
    pub status: CredentialStatus,
    pub liters: f64,
    pub pulses: i64,
    pub expires_at: i64,
    pub expired: bool,
    pub station_id: Option<String>,
    pub locked_to_other_station: bool,
    pub attempts_remaining: i64,
    pub can_use: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub transaction_reference: String,
    pub station_id: String,
    pub liters: f64,
    pub status: CredentialStatus,
    pub used_at: i64,
}

pub struct DispensingAuthorizer {
    pool: SqlitePool,
    hasher: CodeHasher,
    config: StationConfig,
    cache: Option<Arc<CredentialCache>>,
}

impl DispensingAuthorizer {
    pub fn new(
        pool: SqlitePool,
        hasher: CodeHasher,
        config: StationConfig,
        cache: Option<Arc<CredentialCache>>,
    ) -> Self {
        Self {
            pool,
            hasher,
            config,
            cache,
        }
    }

    pub fn pulses_for(&self, liters: f64) -> i64 {
        (liters * self.config.pulses_per_liter).round() as i64
    }

    /// Verify `code` at `station_id` and claim the credential for dispensing.
    pub async fn verify(&self, reference: &str, code: &str, station_id: &str) -> Result<Authorization> {
        require("stationId", station_id)?;
        require("code", code)?;
        let now = db::now();

        let cred = self.latest(reference).await?;
        self.check_state(&cred, Some(station_id), now).await?;
        self.check_code(&cred, reference, code, now).await?;

        let claimed = db::credentials::claim(
            &self.pool,
            cred.id,
            station_id,
            self.config.lock_enabled,
            now,
        )
        .await?;

        let Some(claimed) = claimed else {
            return Err(self.lost_claim(&cred, station_id, now).await);
        };
        self.refresh_cache(&claimed).await;

        info!(
            "Credential #{} for {reference} claimed by station {station_id}",
            claimed.id
        );
        Ok(Authorization {
            transaction_reference: reference.to_string(),
            station_id: station_id.to_string(),
            liters: claimed.liters,
            pulses: self.pulses_for(claimed.liters),
            status: claimed.status,
            verified_at: claimed.verified_at.unwrap_or(now),
            expires_at: claimed.expires_at,
        })
    }

    /// Customer-side check of a code. Wrong codes count against the
    /// attempt limit exactly like station verifications.
    pub async fn check(&self, reference: &str, code: &str) -> Result<CodeCheck> {
        require("code", code)?;
        let now = db::now();

        let cred = self.latest(reference).await?;
        self.check_state(&cred, None, now).await?;
        self.check_code(&cred, reference, code, now).await?;

        Ok(CodeCheck {
            transaction_reference: reference.to_string(),
            valid: true,
            liters: cred.liters,
            expires_at: cred.expires_at,
            attempts_remaining: cred.remaining_attempts(),
        })
    }

    /// Read-only status as seen from `station_id`.
    pub async fn status(&self, reference: &str, station_id: Option<&str>) -> Result<StationStatus> {
        let cred = load_current(&self.pool, self.cache.as_deref(), reference).await?;
        let now = db::now();

        let expired = cred.is_expired_at(now);
        let other_station = match (cred.station_id.as_deref(), station_id) {
            (Some(holder), Some(caller)) => holder != caller,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let locked_to_other_station = other_station
            && (self.config.lock_enabled || cred.status == CredentialStatus::InProgress);
        let can_use = !expired
            && !matches!(cred.status, CredentialStatus::Used | CredentialStatus::Blocked)
            && !locked_to_other_station;

        Ok(StationStatus {
            transaction_reference: cred.transaction_reference.clone(),
            status: if expired {
                CredentialStatus::Expired
            } else {
                cred.status
            },
            liters: cred.liters,
            pulses: self.pulses_for(cred.liters),
            expires_at: cred.expires_at,
            expired,
            station_id: cred.station_id.clone(),
            locked_to_other_station,
            attempts_remaining: cred.remaining_attempts(),
            can_use,
        })
    }

    /// Close the loop once the station has finished dispensing:
    /// `in_progress → used`, only for the station holding the credential.
    pub async fn complete(&self, reference: &str, station_id: &str) -> Result<Completion> {
        require("stationId", station_id)?;
        let now = db::now();

        if let Some(used) = db::credentials::complete(&self.pool, reference, station_id, now).await? {
            self.refresh_cache(&used).await;
            info!("Credential #{} for {reference} used at station {station_id}", used.id);
            return Ok(Completion {
                transaction_reference: reference.to_string(),
                station_id: station_id.to_string(),
                liters: used.liters,
                status: used.status,
                used_at: used.used_at.unwrap_or(now),
            });
        }

        let fresh = self.latest(reference).await?;
        Err(match fresh.status {
            CredentialStatus::Used => AppError::AlreadyUsed,
            CredentialStatus::Blocked => AppError::Blocked,
            CredentialStatus::Expired => AppError::Expired,
            CredentialStatus::InProgress => AppError::InUseElsewhere,
            CredentialStatus::Active => AppError::NotInProgress,
        })
    }

    /// Someone else moved the credential between our read and write. The
    /// row we read is re-evaluated, not whatever is now latest for the
    /// reference, so a code superseded mid-verify reports `EXPIRED`.
    async fn lost_claim(&self, cred: &Credential, station_id: &str, now: i64) -> AppError {
        let fresh = match db::credentials::find(&self.pool, cred.id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => return AppError::CredentialNotFound(cred.transaction_reference.clone()),
            Err(e) => return e,
        };
        match self.check_state(&fresh, Some(station_id), now).await {
            Err(e) => e,
            Ok(()) => AppError::InUseElsewhere,
        }
    }

    async fn latest(&self, reference: &str) -> Result<Credential> {
        db::credentials::latest(&self.pool, reference)
            .await?
            .ok_or_else(|| AppError::CredentialNotFound(reference.to_string()))
    }

    /// Lifecycle and station checks that precede the code comparison.
    async fn check_state(&self, cred: &Credential, station_id: Option<&str>, now: i64) -> Result<()> {
        if cred.status == CredentialStatus::Active && cred.expires_at <= now {
            if db::credentials::expire_if_due(&self.pool, cred.id, now).await? {
                self.invalidate_cache(&cred.transaction_reference).await;
            }
            return Err(AppError::Expired);
        }

        match cred.status {
            CredentialStatus::Used => return Err(AppError::AlreadyUsed),
            CredentialStatus::Blocked => return Err(AppError::Blocked),
            CredentialStatus::Expired => return Err(AppError::Expired),
            CredentialStatus::Active | CredentialStatus::InProgress => {}
        }

        if let Some(station_id) = station_id {
            let holder = cred.station_id.as_deref();
            if self.config.lock_enabled && holder.is_some_and(|h| h != station_id) {
                return Err(AppError::ForbiddenStationLock);
            }
            if cred.status == CredentialStatus::InProgress && holder != Some(station_id) {
                return Err(AppError::InUseElsewhere);
            }
        }

        if cred.expires_at <= now {
            return Err(AppError::Expired);
        }
        Ok(())
    }

    /// Constant-time code comparison; a mismatch is counted atomically.
    async fn check_code(&self, cred: &Credential, reference: &str, code: &str, now: i64) -> Result<()> {
        if self.hasher.matches(reference, code, &cred.secret_hash)? {
            return Ok(());
        }

        // A code from a replaced credential is stale, not a guess.
        for hash in db::credentials::superseded_hashes(&self.pool, reference, cred.id).await? {
            if self.hasher.matches(reference, code, &hash)? {
                return Err(AppError::Expired);
            }
        }

        match db::credentials::record_failed_attempt(&self.pool, cred.id, now).await? {
            Some(updated) => {
                self.refresh_cache(&updated).await;
                if updated.status == CredentialStatus::Blocked {
                    warn!(
                        "Credential #{} for {reference} blocked after {} failed attempts",
                        updated.id, updated.attempts
                    );
                    Err(AppError::Blocked)
                } else {
                    Err(AppError::InvalidCode {
                        remaining: updated.remaining_attempts(),
                    })
                }
            }
            None => {
                let fresh = self.latest(reference).await?;
                self.check_state(&fresh, None, now).await?;
                Err(AppError::InvalidCode {
                    remaining: fresh.remaining_attempts(),
                })
            }
        }
    }

    async fn refresh_cache(&self, cred: &Credential) {
        if let Some(cache) = &self.cache {
            cache.put(cred).await;
        }
    }

    async fn invalidate_cache(&self, reference: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(reference).await;
        }
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AppError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::credentials::NewCredential;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn authorizer() -> DispensingAuthorizer {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        db::migrate(&pool).await.unwrap();
        DispensingAuthorizer::new(
            pool,
            CodeHasher::new("station-test"),
            StationConfig {
                lock_enabled: true,
                pulses_per_liter: 450.0,
            },
            None,
        )
    }

    fn new_cred<'a>(reference: &'a str, hash: &'a str) -> NewCredential<'a> {
        NewCredential {
            transaction_reference: reference,
            secret_hash: hash,
            liters: 10.0,
            max_attempts: 3,
            expires_at: 10_000,
        }
    }

    #[tokio::test]
    async fn lost_claim_on_superseded_credential_is_expired() {
        let auth = authorizer().await;
        let old = db::credentials::replace(&auth.pool, &new_cred("REF", "a"), 1_000)
            .await
            .unwrap();
        db::credentials::replace(&auth.pool, &new_cred("REF", "b"), 1_005)
            .await
            .unwrap();

        let err = auth.lost_claim(&old, "ST-1", 1_010).await;
        assert!(matches!(err, AppError::Expired), "{err:?}");
    }

    #[tokio::test]
    async fn lost_claim_to_another_station() {
        let auth = authorizer().await;
        let cred = db::credentials::replace(&auth.pool, &new_cred("REF", "a"), 1_000)
            .await
            .unwrap();
        db::credentials::claim(&auth.pool, cred.id, "ST-2", true, 1_005)
            .await
            .unwrap()
            .unwrap();

        let err = auth.lost_claim(&cred, "ST-1", 1_010).await;
        assert!(matches!(err, AppError::ForbiddenStationLock), "{err:?}");
    }
}
