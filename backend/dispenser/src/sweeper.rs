//! Periodic reconciliation of records nobody came back for.
//!
//! Each pass is a handful of bulk conditional updates, so running it twice
//! over the same data moves nothing the second time.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::CredentialCache;
use crate::db;
use crate::errors::Result;
use crate::models::PaymentVariant;

/// Outcome of one pass. Each step runs on its own; a step that fails
/// leaves its count at zero and its error in `failures`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub mobile_push_timed_out: u64,
    pub hosted_checkout_expired: u64,
    pub credentials_expired: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<String>,
}

impl SweepReport {
    pub fn total(&self) -> u64 {
        self.mobile_push_timed_out + self.hosted_checkout_expired + self.credentials_expired
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, step: &str, outcome: Result<u64>) -> u64 {
        match outcome {
            Ok(n) => n,
            Err(e) => {
                error!("Sweep step {step} failed: {e}");
                self.failures.push(format!("{step}: {e}"));
                0
            }
        }
    }
}

pub struct ReconciliationSweeper {
    pool: SqlitePool,
    cache: Option<Arc<CredentialCache>>,
    interval: Duration,
}

impl ReconciliationSweeper {
    pub fn new(pool: SqlitePool, cache: Option<Arc<CredentialCache>>, interval: Duration) -> Self {
        Self {
            pool,
            cache,
            interval,
        }
    }

    /// Sweep until `shutdown` is cancelled. Failed steps are logged and the
    /// next tick tries again.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Sweeper starting, interval {:?}", self.interval);

        loop {
            let report = self.sweep_once().await;
            if report.total() > 0 {
                info!(
                    "Sweep: {} mobile push timed out, {} hosted checkout expired, {} credentials expired",
                    report.mobile_push_timed_out,
                    report.hosted_checkout_expired,
                    report.credentials_expired
                );
            } else if report.is_clean() {
                debug!("Sweep: nothing to do");
            }
            if !report.is_clean() {
                warn!("Sweep finished with {} failed step(s)", report.failures.len());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Sweeper stopped");
    }

    /// One reconciliation pass at the current time.
    pub async fn sweep_once(&self) -> SweepReport {
        self.sweep_at(db::now()).await
    }

    pub async fn sweep_at(&self, now: i64) -> SweepReport {
        let mut report = SweepReport::default();

        let outcome =
            db::transactions::expire_stale(&self.pool, PaymentVariant::MobilePush, now).await;
        report.mobile_push_timed_out = report.record("mobile_push", outcome);

        let outcome =
            db::transactions::expire_stale(&self.pool, PaymentVariant::HostedCheckout, now).await;
        report.hosted_checkout_expired = report.record("hosted_checkout", outcome);

        let outcome = db::credentials::expire_stale(&self.pool, now).await;
        report.credentials_expired = report.record("credentials", outcome);

        if let Some(cache) = &self.cache {
            if report.credentials_expired > 0 {
                cache.clear().await;
            } else {
                cache.prune().await;
            }
        }
        report
    }
}
