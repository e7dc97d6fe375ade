//! Ninja - privacy-friendly page view analytics
//!
//! Collects page views from a tracking pixel or beacon script and keeps:
//! - A raw event log of today's traffic with hashed visitor addresses
//! - Daily page, bounce, referral and geo aggregates rolled up from it
//! - A JSON stats API over both

mod config;
mod db;
mod geoip;
mod identity;
mod recorder;
mod rollup;
mod web;

use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = config::Config::load()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    // Use LOG_FORMAT=gcp for structured GCP Cloud Logging
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting Ninja analytics...");

    let db = db::Database::new(&config.database).await?;
    db.run_migrations().await?;
    info!("Database initialized");

    let geoip = Arc::new(geoip::GeoIp::new(&config.geoip.database));
    if geoip.is_available() {
        info!("GeoIP enabled");
    } else {
        info!("GeoIP disabled (database not found)");
    }

    let hasher = identity::IdentityHasher::for_deployment(&config.identity.salt, &db).await?;
    let recorder = recorder::Recorder::new(db.clone(), geoip, hasher);

    let aggregator = Arc::new(rollup::Aggregator::new(
        db.clone(),
        config.aggregation.max_days_per_run,
    ));
    rollup::spawn_scheduler(
        aggregator,
        Duration::from_secs(config.aggregation.interval_secs),
    );

    let state = Arc::new(web::AppState::new(&config, db, recorder));

    // Blocks until the server stops
    web::start_server(&config, state).await?;

    Ok(())
}
