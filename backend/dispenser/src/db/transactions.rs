//! Transaction stores for both payment variants.
//!
//! A reference is first claimed in `transaction_references`, inside the same
//! database transaction as the variant row, so it is unique across variants.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::is_unique_violation;
use crate::errors::{AppError, Result};
use crate::gateway::{MetadataField, MetadataValue, ProviderMetadata};
use crate::models::{
    HostedCheckoutRecord, MobilePushRecord, PaymentVariant, TransactionStatus, TransactionView,
    HOSTED_CHECKOUT_WINDOW_SECS, MOBILE_PUSH_TIMEOUT_SECS,
};

/// Provider metadata fields each variant persists, and where.
const MOBILE_PUSH_COLUMNS: &[(MetadataField, &str)] = &[
    (MetadataField::ProviderHandle, "checkout_request_id"),
    (MetadataField::CorrelationId, "merchant_request_id"),
    (MetadataField::Receipt, "receipt_number"),
    (MetadataField::ResultCode, "result_code"),
    (MetadataField::Message, "result_desc"),
    (MetadataField::PaidAt, "paid_at"),
];

const HOSTED_CHECKOUT_COLUMNS: &[(MetadataField, &str)] = &[
    (MetadataField::CorrelationId, "access_code"),
    (MetadataField::RedirectUrl, "authorization_url"),
    (MetadataField::Receipt, "provider_transaction_id"),
    (MetadataField::Message, "gateway_response"),
    (MetadataField::Channel, "channel"),
    (MetadataField::CardType, "card_type"),
    (MetadataField::Last4, "last4"),
    (MetadataField::Bank, "bank"),
    (MetadataField::PaidAt, "paid_at"),
];

/// Statuses a transaction can still leave.
pub const OPEN_STATUSES: [TransactionStatus; 2] =
    [TransactionStatus::Pending, TransactionStatus::Processing];

fn table(variant: PaymentVariant) -> &'static str {
    match variant {
        PaymentVariant::MobilePush => "mobile_push_transactions",
        PaymentVariant::HostedCheckout => "hosted_checkout_transactions",
    }
}

fn columns(variant: PaymentVariant) -> &'static [(MetadataField, &'static str)] {
    match variant {
        PaymentVariant::MobilePush => MOBILE_PUSH_COLUMNS,
        PaymentVariant::HostedCheckout => HOSTED_CHECKOUT_COLUMNS,
    }
}

/// Fields common to a new transaction of either variant.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub reference: String,
    pub amount: f64,
    pub liters: f64,
    pub currency: String,
    pub phone_number: Option<String>,
    pub email: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Writes
// ─────────────────────────────────────────────────────────

/// Insert a `pending` transaction for `variant`.
pub async fn insert(
    pool: &SqlitePool,
    variant: PaymentVariant,
    tx: &NewTransaction,
    now: i64,
) -> Result<()> {
    let mut db_tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO transaction_references (reference, variant, created_at) VALUES (?1, ?2, ?3)",
    )
    .bind(&tx.reference)
    .bind(variant)
    .bind(now)
    .execute(&mut *db_tx)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            AppError::DuplicateReference(tx.reference.clone())
        } else {
            e.into()
        }
    })?;

    match variant {
        PaymentVariant::MobilePush => {
            let phone = tx.phone_number.as_deref().ok_or_else(|| {
                AppError::InvalidInput("Phone number is required".to_string())
            })?;
            sqlx::query(
                r#"
                INSERT INTO mobile_push_transactions
                    (reference, amount, liters, currency, status, phone_number, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?6)
                "#,
            )
            .bind(&tx.reference)
            .bind(tx.amount)
            .bind(tx.liters)
            .bind(&tx.currency)
            .bind(phone)
            .bind(now)
            .execute(&mut *db_tx)
            .await?;
        }
        PaymentVariant::HostedCheckout => {
            let email = tx
                .email
                .as_deref()
                .ok_or_else(|| AppError::InvalidInput("Email is required".to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO hosted_checkout_transactions
                    (reference, amount, liters, currency, status, email, phone_number,
                     expires_at, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8, ?8)
                "#,
            )
            .bind(&tx.reference)
            .bind(tx.amount)
            .bind(tx.liters)
            .bind(&tx.currency)
            .bind(email)
            .bind(&tx.phone_number)
            .bind(now + HOSTED_CHECKOUT_WINDOW_SECS)
            .bind(now)
            .execute(&mut *db_tx)
            .await?;
        }
    }

    db_tx.commit().await?;
    Ok(())
}

/// Move `reference` to `to` if it is currently in one of `from`, writing the
/// allow-listed metadata columns that are still empty. Returns whether this
/// call performed the transition.
pub async fn transition(
    pool: &SqlitePool,
    variant: PaymentVariant,
    reference: &str,
    from: &[TransactionStatus],
    to: TransactionStatus,
    metadata: &ProviderMetadata,
    now: i64,
) -> Result<bool> {
    if from.is_empty() {
        return Ok(false);
    }

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE ");
    qb.push(table(variant))
        .push(" SET status = ")
        .push_bind(to)
        .push(", updated_at = ")
        .push_bind(now);

    for (field, column) in columns(variant) {
        let Some(value) = metadata.value(*field) else {
            continue;
        };
        qb.push(format!(", {column} = COALESCE({column}, "));
        match value {
            MetadataValue::Text(s) => qb.push_bind(s.to_string()),
            MetadataValue::Int(i) => qb.push_bind(i),
        };
        qb.push(")");
    }

    qb.push(" WHERE reference = ").push_bind(reference.to_string());
    qb.push(" AND status IN (");
    let mut statuses = qb.separated(", ");
    for status in from {
        statuses.push_bind(*status);
    }
    statuses.push_unseparated(")");

    let rows = qb.build().execute(pool).await?.rows_affected();
    Ok(rows == 1)
}

/// Bulk-move unconfirmed transactions of `variant` past their window into
/// the variant's stale status. Returns the number of rows moved.
pub async fn expire_stale(pool: &SqlitePool, variant: PaymentVariant, now: i64) -> Result<u64> {
    let stale = variant.stale_status();
    let result = match variant {
        PaymentVariant::MobilePush => {
            sqlx::query(
                r#"
                UPDATE mobile_push_transactions
                SET    status = ?1, updated_at = ?2
                WHERE  status IN (?3, ?4) AND created_at < ?5
                "#,
            )
            .bind(stale)
            .bind(now)
            .bind(OPEN_STATUSES[0])
            .bind(OPEN_STATUSES[1])
            .bind(now - MOBILE_PUSH_TIMEOUT_SECS)
            .execute(pool)
            .await?
        }
        PaymentVariant::HostedCheckout => {
            sqlx::query(
                r#"
                UPDATE hosted_checkout_transactions
                SET    status = ?1, updated_at = ?2
                WHERE  status IN (?3, ?4) AND expires_at < ?2
                "#,
            )
            .bind(stale)
            .bind(now)
            .bind(OPEN_STATUSES[0])
            .bind(OPEN_STATUSES[1])
            .execute(pool)
            .await?
        }
    };
    Ok(result.rows_affected())
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn find_mobile_push(pool: &SqlitePool, reference: &str) -> Result<Option<MobilePushRecord>> {
    let row = sqlx::query_as::<_, MobilePushRecord>(
        "SELECT * FROM mobile_push_transactions WHERE reference = ?1",
    )
    .bind(reference)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_hosted_checkout(
    pool: &SqlitePool,
    reference: &str,
) -> Result<Option<HostedCheckoutRecord>> {
    let row = sqlx::query_as::<_, HostedCheckoutRecord>(
        "SELECT * FROM hosted_checkout_transactions WHERE reference = ?1",
    )
    .bind(reference)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Resolve a provider handle to our reference.
pub async fn reference_for_handle(
    pool: &SqlitePool,
    variant: PaymentVariant,
    provider_handle: &str,
) -> Result<Option<String>> {
    let sql = match variant {
        PaymentVariant::MobilePush => {
            "SELECT reference FROM mobile_push_transactions WHERE checkout_request_id = ?1"
        }
        // Hosted checkout uses our reference as the provider handle.
        PaymentVariant::HostedCheckout => {
            "SELECT reference FROM hosted_checkout_transactions WHERE reference = ?1"
        }
    };
    let row: Option<(String,)> = sqlx::query_as(sql)
        .bind(provider_handle)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(r,)| r))
}

/// Unified lookup: the mobile push store first, then hosted checkout.
pub async fn find_view(pool: &SqlitePool, reference: &str) -> Result<Option<TransactionView>> {
    if let Some(record) = find_mobile_push(pool, reference).await? {
        return Ok(Some(record.into()));
    }
    Ok(find_hosted_checkout(pool, reference).await?.map(Into::into))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::migrate(&pool).await.unwrap();
        pool
    }

    fn new_tx(reference: &str) -> NewTransaction {
        NewTransaction {
            reference: reference.to_string(),
            amount: 50.0,
            liters: 10.0,
            currency: "KES".to_string(),
            phone_number: Some("254712345678".to_string()),
            email: Some("a@b.co".to_string()),
        }
    }

    #[tokio::test]
    async fn reference_is_unique_across_variants() {
        let pool = pool().await;
        insert(&pool, PaymentVariant::MobilePush, &new_tx("REF-1"), 1_000)
            .await
            .unwrap();
        let err = insert(&pool, PaymentVariant::HostedCheckout, &new_tx("REF-1"), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateReference(_)));
        assert!(find_hosted_checkout(&pool, "REF-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transition_is_conditional_and_writes_metadata_once() {
        let pool = pool().await;
        insert(&pool, PaymentVariant::MobilePush, &new_tx("REF-2"), 1_000)
            .await
            .unwrap();

        let first = ProviderMetadata {
            receipt: Some("R1".into()),
            result_code: Some(0),
            ..Default::default()
        };
        let moved = transition(
            &pool,
            PaymentVariant::MobilePush,
            "REF-2",
            &OPEN_STATUSES,
            TransactionStatus::Completed,
            &first,
            1_010,
        )
        .await
        .unwrap();
        assert!(moved);

        let second = ProviderMetadata {
            receipt: Some("R2".into()),
            ..Default::default()
        };
        let moved_again = transition(
            &pool,
            PaymentVariant::MobilePush,
            "REF-2",
            &OPEN_STATUSES,
            TransactionStatus::Failed,
            &second,
            1_020,
        )
        .await
        .unwrap();
        assert!(!moved_again);

        let record = find_mobile_push(&pool, "REF-2").await.unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.receipt_number.as_deref(), Some("R1"));
        assert_eq!(record.updated_at, 1_010);
    }

    #[tokio::test]
    async fn unified_view_checks_both_stores() {
        let pool = pool().await;
        insert(&pool, PaymentVariant::HostedCheckout, &new_tx("REF-3"), 1_000)
            .await
            .unwrap();
        let view = find_view(&pool, "REF-3").await.unwrap().unwrap();
        assert_eq!(view.variant, PaymentVariant::HostedCheckout);
        assert_eq!(view.expires_at, 1_000 + HOSTED_CHECKOUT_WINDOW_SECS);
        assert!(find_view(&pool, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_sweep_skips_completed() {
        let pool = pool().await;
        insert(&pool, PaymentVariant::MobilePush, &new_tx("OLD"), 0).await.unwrap();
        insert(&pool, PaymentVariant::MobilePush, &new_tx("PAID"), 0).await.unwrap();
        transition(
            &pool,
            PaymentVariant::MobilePush,
            "PAID",
            &OPEN_STATUSES,
            TransactionStatus::Completed,
            &ProviderMetadata::default(),
            10,
        )
        .await
        .unwrap();

        let now = MOBILE_PUSH_TIMEOUT_SECS + 1;
        assert_eq!(expire_stale(&pool, PaymentVariant::MobilePush, now).await.unwrap(), 1);
        assert_eq!(expire_stale(&pool, PaymentVariant::MobilePush, now).await.unwrap(), 0);

        let paid = find_mobile_push(&pool, "PAID").await.unwrap().unwrap();
        assert_eq!(paid.status, TransactionStatus::Completed);
        let old = find_mobile_push(&pool, "OLD").await.unwrap().unwrap();
        assert_eq!(old.status, TransactionStatus::Timeout);
    }
}
