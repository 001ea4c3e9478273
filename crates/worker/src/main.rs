//! Cadence Billing Worker
//!
//! Runs the billing cycle every `BILLING_CYCLE_INTERVAL_SECS`:
//! - Due subscriptions (charge and advance)
//! - Pending billing attempts (first charges, retries)
//! - Retry scheduling and close-out of exhausted cycles
//! - Reconciliation of partially written charges

use std::sync::Arc;

use cadence_billing::{
    BillingEngine, BillingStores, HttpPaymentGateway, PgBillingStore, SystemClock,
};
use cadence_worker::{admin, BillingScheduler, LogFormat, WorkerConfig, WorkerManager};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env()?;
    init_tracing(config.log_format);

    info!("Starting Cadence Worker v{}", env!("CARGO_PKG_VERSION"));
    info!(config = ?config, "Configuration loaded");

    // Database
    let store = PgBillingStore::connect(&config.database_url, config.database_max_connections).await?;
    store.migrate().await?;
    info!("Database ready");

    let gateway = HttpPaymentGateway::new(config.gateway.clone(), config.engine.gateway_timeout())?;
    let engine = BillingEngine::new(
        BillingStores::from_backend(store),
        Arc::new(gateway),
        Arc::new(SystemClock),
        config.engine.clone(),
    );

    let manager = Arc::new(WorkerManager::new(config.stop_grace()));
    manager
        .register(Arc::new(BillingScheduler::new(
            Arc::new(engine),
            config.engine.cycle_interval(),
        )))
        .await;
    manager.start_all().await?;

    let app = admin::router(manager.clone());
    let listener = tokio::net::TcpListener::bind(&config.admin_bind_addr).await?;
    info!("Operator endpoints listening on {}", config.admin_bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop_all().await;
    info!("Cadence Worker stopped");
    Ok(())
}
