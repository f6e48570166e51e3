//! Pay-to-dispense gateway — entry point.
//!
//! Starts the reconciliation sweeper as a background task and serves the
//! payment, code and station REST API.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dispenser::api::{self, ApiState};
use dispenser::cache::CredentialCache;
use dispenser::config::Config;
use dispenser::db;
use dispenser::gateway::mpesa::MpesaGateway;
use dispenser::gateway::paystack::PaystackGateway;
use dispenser::ledger::TransactionLedger;
use dispenser::notify::{LogNotifier, NotificationDispatcher, Notifier, SmsNotifier};
use dispenser::otp::CredentialIssuer;
use dispenser::pricing::PricingEngine;
use dispenser::station::DispensingAuthorizer;
use dispenser::sweeper::ReconciliationSweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (RUST_LOG controls verbosity).
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Load optional .env file (ignored if missing).
    let _ = dotenvy::dotenv();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up the SQLite connection pool and run migrations.
    let pool = db::init_pool(&config.database_url, config.database_max_connections).await?;

    // Shared by every provider and SMS call.
    let client = Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .build()?;

    let cache = config
        .cache_enabled
        .then(|| Arc::new(CredentialCache::new(Duration::from_secs(config.cache_ttl_secs))));

    // ─── Notifications ────────────────────────────────────
    let notifier: Arc<dyn Notifier> = match config.sms.clone() {
        Some(sms) => Arc::new(SmsNotifier::new(client.clone(), sms)),
        None => {
            warn!("SMS_API_KEY not set; dispensing codes will not be delivered by SMS");
            Arc::new(LogNotifier)
        }
    };
    let dispatcher =
        NotificationDispatcher::new(notifier, Duration::from_secs(config.http_timeout_secs * 2));

    // ─── Domain components ────────────────────────────────
    let pricing = Arc::new(PricingEngine::new(config.pricing.clone()));
    let issuer = Arc::new(CredentialIssuer::new(
        pool.clone(),
        config.otp.clone(),
        cache.clone(),
        dispatcher,
    ));
    let authorizer = Arc::new(DispensingAuthorizer::new(
        pool.clone(),
        issuer.hasher().clone(),
        config.station.clone(),
        cache.clone(),
    ));

    let mut ledger = TransactionLedger::new(pool.clone(), Arc::clone(&pricing), Arc::clone(&issuer));
    match config.mpesa.clone() {
        Some(mpesa) => {
            if config.pricing.price_per_liter.fract() != 0.0 {
                warn!(
                    "PRICE_PER_LITER {} is fractional; M-Pesa only accepts whole amounts",
                    config.pricing.price_per_liter
                );
            }
            ledger = ledger.with_gateway(Arc::new(MpesaGateway::new(client.clone(), mpesa)));
        }
        None => warn!("M-Pesa credentials not set; mobile push payments disabled"),
    }
    match config.paystack.clone() {
        Some(paystack) => {
            ledger = ledger.with_gateway(Arc::new(PaystackGateway::new(client.clone(), paystack)))
        }
        None => warn!("PAYSTACK_SECRET_KEY not set; hosted checkout payments disabled"),
    }

    // ─── Background sweeper ───────────────────────────────
    let shutdown = CancellationToken::new();
    let sweeper = Arc::new(ReconciliationSweeper::new(
        pool,
        cache,
        Duration::from_secs(config.sweep_interval_secs),
    ));
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.clone()));

    // ─── REST API ─────────────────────────────────────────
    let app = api::router(Arc::new(ApiState {
        pricing,
        ledger: Arc::new(ledger),
        issuer,
        authorizer,
    }));

    let addr = format!("0.0.0.0:{}", config.api_port);
    info!("API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let _ = sweeper_task.await;
    info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C received, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
