//! Credential store. Rows are never deleted, only state-transitioned.

use sqlx::SqlitePool;

use crate::errors::Result;
use crate::models::Credential;

#[derive(Debug, Clone)]
pub struct NewCredential<'a> {
    pub transaction_reference: &'a str,
    pub secret_hash: &'a str,
    pub liters: f64,
    pub max_attempts: i64,
    pub expires_at: i64,
}

// ─────────────────────────────────────────────────────────
// Issuance
// ─────────────────────────────────────────────────────────

/// Expire any live credential for the reference and insert a fresh one,
/// atomically. A credential still `in_progress` is expired too; its
/// station can no longer `complete` it.
pub async fn replace(pool: &SqlitePool, new: &NewCredential<'_>, now: i64) -> Result<Credential> {
    let mut db_tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE credentials
        SET    status = 'expired', updated_at = ?2
        WHERE  transaction_reference = ?1 AND status IN ('active', 'in_progress')
        "#,
    )
    .bind(new.transaction_reference)
    .bind(now)
    .execute(&mut *db_tx)
    .await?;

    let cred = sqlx::query_as::<_, Credential>(
        r#"
        INSERT INTO credentials
            (transaction_reference, secret_hash, liters, status, attempts, max_attempts,
             expires_at, created_at, updated_at)
        VALUES (?1, ?2, ?3, 'active', 0, ?4, ?5, ?6, ?6)
        RETURNING *
        "#,
    )
    .bind(new.transaction_reference)
    .bind(new.secret_hash)
    .bind(new.liters)
    .bind(new.max_attempts)
    .bind(new.expires_at)
    .bind(now)
    .fetch_one(&mut *db_tx)
    .await?;

    db_tx.commit().await?;
    Ok(cred)
}

/// Insert a credential only if the reference has never had one.
/// Returns `None` when one already exists.
pub async fn insert_first(
    pool: &SqlitePool,
    new: &NewCredential<'_>,
    now: i64,
) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>(
        r#"
        INSERT INTO credentials
            (transaction_reference, secret_hash, liters, status, attempts, max_attempts,
             expires_at, created_at, updated_at)
        SELECT ?1, ?2, ?3, 'active', 0, ?4, ?5, ?6, ?6
        WHERE NOT EXISTS (SELECT 1 FROM credentials WHERE transaction_reference = ?1)
        RETURNING *
        "#,
    )
    .bind(new.transaction_reference)
    .bind(new.secret_hash)
    .bind(new.liters)
    .bind(new.max_attempts)
    .bind(new.expires_at)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(cred)
}

// ─────────────────────────────────────────────────────────
// Verification writes
// ─────────────────────────────────────────────────────────

/// `active → expired` once the wall clock has passed `expires_at`.
pub async fn expire_if_due(pool: &SqlitePool, id: i64, now: i64) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE credentials
        SET    status = 'expired', updated_at = ?2
        WHERE  id = ?1 AND status = 'active' AND expires_at <= ?2
        "#,
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Count a failed attempt against an `active` credential, blocking it when
/// the limit is hit. Returns the updated row, or `None` if it was not
/// `active`; a credential being dispensed cannot be blocked.
pub async fn record_failed_attempt(
    pool: &SqlitePool,
    id: i64,
    now: i64,
) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>(
        r#"
        UPDATE credentials
        SET    attempts   = attempts + 1,
               status     = CASE WHEN attempts + 1 >= max_attempts THEN 'blocked' ELSE status END,
               updated_at = ?2
        WHERE  id = ?1 AND status = 'active'
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(cred)
}

/// Claim the credential for `station_id`: `active → in_progress`, or a
/// repeat claim by the station already holding it. With `lock_enabled`, a
/// credential bound to another station cannot be claimed.
pub async fn claim(
    pool: &SqlitePool,
    id: i64,
    station_id: &str,
    lock_enabled: bool,
    now: i64,
) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>(
        r#"
        UPDATE credentials
        SET    status      = 'in_progress',
               station_id  = COALESCE(station_id, ?2),
               verified_at = ?3,
               updated_at  = ?3
        WHERE  id = ?1
          AND  expires_at > ?3
          AND  (status = 'active' OR (status = 'in_progress' AND station_id = ?2))
          AND  (?4 = 0 OR station_id IS NULL OR station_id = ?2)
        RETURNING *
        "#,
    )
    .bind(id)
    .bind(station_id)
    .bind(now)
    .bind(lock_enabled)
    .fetch_optional(pool)
    .await?;
    Ok(cred)
}

/// `in_progress → used` for the station holding the credential.
pub async fn complete(
    pool: &SqlitePool,
    transaction_reference: &str,
    station_id: &str,
    now: i64,
) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>(
        r#"
        UPDATE credentials
        SET    status = 'used', used_at = ?3, updated_at = ?3
        WHERE  transaction_reference = ?1 AND status = 'in_progress' AND station_id = ?2
        RETURNING *
        "#,
    )
    .bind(transaction_reference)
    .bind(station_id)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(cred)
}

/// Bulk `active → expired` for every credential past its expiry.
pub async fn expire_stale(pool: &SqlitePool, now: i64) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        UPDATE credentials
        SET    status = 'expired', updated_at = ?1
        WHERE  status = 'active' AND expires_at < ?1
        "#,
    )
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn find(pool: &SqlitePool, id: i64) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>("SELECT * FROM credentials WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(cred)
}

/// The most recently issued credential for a reference.
pub async fn latest(pool: &SqlitePool, transaction_reference: &str) -> Result<Option<Credential>> {
    let cred = sqlx::query_as::<_, Credential>(
        r#"
        SELECT * FROM credentials
        WHERE  transaction_reference = ?1
        ORDER  BY id DESC
        LIMIT  1
        "#,
    )
    .bind(transaction_reference)
    .fetch_optional(pool)
    .await?;
    Ok(cred)
}

/// Digests of credentials replaced by a newer one for the same reference.
pub async fn superseded_hashes(
    pool: &SqlitePool,
    transaction_reference: &str,
    newer_than_id: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT secret_hash FROM credentials
        WHERE  transaction_reference = ?1 AND status = 'expired' AND id < ?2
        ORDER  BY id DESC
        "#,
    )
    .bind(transaction_reference)
    .bind(newer_than_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(h,)| h).collect())
}

pub async fn has_used(pool: &SqlitePool, transaction_reference: &str) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT 1 FROM credentials WHERE transaction_reference = ?1 AND status = 'used' LIMIT 1",
    )
    .bind(transaction_reference)
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}
