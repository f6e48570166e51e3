mod common;

use common::{Harness, Options};
use dispenser::db;
use dispenser::errors::AppError;
use dispenser::models::CredentialStatus;

/// A code guaranteed to differ from `code`.
fn wrong(code: &str) -> String {
    code.chars()
        .map(|c| if c == '9' { '0' } else { char::from(c as u8 + 1) })
        .collect()
}

#[tokio::test]
async fn blocks_after_max_attempts() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;
    let bad = wrong(&code);

    let err = h.authorizer.verify(&reference, &bad, "ST-1").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidCode { remaining: 2 }));
    let err = h.authorizer.verify(&reference, &bad, "ST-1").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidCode { remaining: 1 }));
    let err = h.authorizer.verify(&reference, &bad, "ST-1").await.unwrap_err();
    assert!(matches!(err, AppError::Blocked));

    // Even the right code is refused now.
    assert!(matches!(
        h.authorizer.verify(&reference, &code, "ST-1").await,
        Err(AppError::Blocked)
    ));
    let status = h.authorizer.status(&reference, Some("ST-1")).await.unwrap();
    assert_eq!(status.status, CredentialStatus::Blocked);
    assert!(!status.can_use);
    assert_eq!(status.attempts_remaining, 0);
}

#[tokio::test]
async fn customer_checks_count_as_attempts() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;

    assert!(h.authorizer.check(&reference, &code).await.unwrap().valid);
    assert!(matches!(
        h.authorizer.check(&reference, &wrong(&code)).await,
        Err(AppError::InvalidCode { remaining: 2 })
    ));
    let summary = h.issuer.status(&reference).await.unwrap();
    assert_eq!(summary.attempts_remaining, 2);
    assert_eq!(summary.status, CredentialStatus::Active);
}

#[tokio::test]
async fn reissue_invalidates_previous_code() {
    let h = Harness::new().await;
    let (reference, old_code) = h.paid_mobile_push(50.0).await;

    let issued = h.issuer.issue(&reference).await.unwrap();
    assert_eq!(issued.liters, 10.0);
    assert_eq!(issued.code.len(), 6);

    if issued.code != old_code {
        let err = h
            .authorizer
            .verify(&reference, &old_code, "ST-1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Expired | AppError::CredentialNotFound(_)));
        // A stale code is not a guess.
        assert_eq!(h.issuer.status(&reference).await.unwrap().attempts_remaining, 3);
    }

    let auth = h
        .authorizer
        .verify(&reference, &issued.code, "ST-1")
        .await
        .unwrap();
    assert_eq!(auth.status, CredentialStatus::InProgress);
}

#[tokio::test]
async fn station_lock_forbids_other_station() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;

    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();
    let err = h
        .authorizer
        .verify(&reference, &code, "ST-2")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ForbiddenStationLock));
    assert_eq!(err.status().as_u16(), 403);

    // Re-verifying at the holding station is allowed.
    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();

    let seen_by_other = h.authorizer.status(&reference, Some("ST-2")).await.unwrap();
    assert!(seen_by_other.locked_to_other_station);
    assert!(!seen_by_other.can_use);
}

#[tokio::test]
async fn without_lock_other_station_conflicts_while_in_progress() {
    let h = Harness::with(Options {
        lock_enabled: false,
        ..Default::default()
    })
    .await;
    let (reference, code) = h.paid_mobile_push(50.0).await;

    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();
    let err = h
        .authorizer
        .verify(&reference, &code, "ST-2")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InUseElsewhere));
    assert_eq!(err.status().as_u16(), 409);
}

#[tokio::test]
async fn complete_only_for_holding_station() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;

    assert!(matches!(
        h.authorizer.complete(&reference, "ST-1").await,
        Err(AppError::NotInProgress)
    ));

    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();
    assert!(matches!(
        h.authorizer.complete(&reference, "ST-2").await,
        Err(AppError::InUseElsewhere)
    ));

    let done = h.authorizer.complete(&reference, "ST-1").await.unwrap();
    assert_eq!(done.liters, 10.0);
    assert!(matches!(
        h.authorizer.complete(&reference, "ST-1").await,
        Err(AppError::AlreadyUsed)
    ));

    // A used credential can never be replaced by a new one.
    assert!(matches!(
        h.issuer.issue(&reference).await,
        Err(AppError::AlreadyUsed)
    ));
    let status = h.authorizer.status(&reference, Some("ST-1")).await.unwrap();
    assert_eq!(status.status, CredentialStatus::Used);
    assert!(!status.can_use);
}

#[tokio::test]
async fn expired_code_is_refused_and_marked() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;

    sqlx::query("UPDATE credentials SET expires_at = ?1 WHERE transaction_reference = ?2")
        .bind(db::now() - 1)
        .bind(&reference)
        .execute(&h.pool)
        .await
        .unwrap();

    assert!(matches!(
        h.authorizer.verify(&reference, &code, "ST-1").await,
        Err(AppError::Expired)
    ));
    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM credentials WHERE transaction_reference = ?1")
            .bind(&reference)
            .fetch_one(&h.pool)
            .await
            .unwrap();
    assert_eq!(status, "expired");
}

#[tokio::test]
async fn unknown_reference_has_no_credential() {
    let h = Harness::with(Options {
        cache: false,
        ..Default::default()
    })
    .await;
    let err = h
        .authorizer
        .verify("FD-0-none", "123456", "ST-1")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::CredentialNotFound(_)));
    assert_eq!(err.code(), "NOT_FOUND");
    assert!(matches!(
        h.issuer.issue("FD-0-none").await,
        Err(AppError::TransactionNotFound(_))
    ));
}

#[tokio::test]
async fn wrong_checks_during_dispense_do_not_block() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;
    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();

    for _ in 0..3 {
        assert!(matches!(
            h.authorizer.check(&reference, &wrong(&code)).await,
            Err(AppError::InvalidCode { remaining: 3 })
        ));
    }
    let status = h.authorizer.status(&reference, Some("ST-1")).await.unwrap();
    assert_eq!(status.status, CredentialStatus::InProgress);
    assert_eq!(status.attempts_remaining, 3);

    let done = h.authorizer.complete(&reference, "ST-1").await.unwrap();
    assert_eq!(done.status, CredentialStatus::Used);
}

#[tokio::test]
async fn reissue_while_dispensing_supersedes_the_claimed_code() {
    let h = Harness::new().await;
    let (reference, code) = h.paid_mobile_push(50.0).await;
    h.authorizer.verify(&reference, &code, "ST-1").await.unwrap();

    let issued = h.issuer.issue(&reference).await.unwrap();

    // The claimed code is dead: it can neither be re-verified nor completed.
    if issued.code != code {
        assert!(matches!(
            h.authorizer.verify(&reference, &code, "ST-1").await,
            Err(AppError::Expired)
        ));
    }
    assert!(matches!(
        h.authorizer.complete(&reference, "ST-1").await,
        Err(AppError::NotInProgress)
    ));
    let (expired,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM credentials WHERE transaction_reference = ?1 AND status = 'expired'",
    )
    .bind(&reference)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(expired, 1);

    // Only the fresh code can start a new dispense.
    let auth = h
        .authorizer
        .verify(&reference, &issued.code, "ST-1")
        .await
        .unwrap();
    assert_eq!(auth.status, CredentialStatus::InProgress);
}
