//! Web server module

mod beacon;
mod client_ip;
mod error;
mod routes;

use anyhow::Result;
use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use cached::TimedCache;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::Mutex;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer};
use tracing::info;

use crate::config::Config;
use crate::db::{Database, HistoricalStats};
use crate::recorder::Recorder;

/// (lookback days, page filter)
pub type HistoricalKey = (u64, Option<String>);

pub struct AppState {
    pub db: Database,
    pub recorder: Recorder,
    /// Beacon script with the collect URL baked in
    pub script: String,
    pub trust_proxy_headers: bool,
    pub historical_cache: Option<Mutex<TimedCache<HistoricalKey, HistoricalStats>>>,
}

impl AppState {
    pub fn new(config: &Config, db: Database, recorder: Recorder) -> Self {
        let historical_cache = (config.stats.cache_ttl_secs > 0)
            .then(|| Mutex::new(TimedCache::with_lifespan(config.stats.cache_ttl_secs)));

        Self {
            db,
            recorder,
            script: beacon::render_script(&config.server.domain, config.server.port),
            trust_proxy_headers: config.server.trust_proxy_headers,
            historical_cache,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // Beacons are cross-origin by nature and must never be served from a cache
    let beacons = Router::new()
        .route("/pixel.gif", get(beacon::pixel))
        .route("/track.js", get(beacon::script))
        .route("/collect", post(beacon::collect))
        .layer(
            ServiceBuilder::new()
                .layer(CorsLayer::permissive())
                .layer(SetResponseHeaderLayer::overriding(
                    header::CACHE_CONTROL,
                    HeaderValue::from_static("no-store"),
                )),
        );

    let api = Router::new()
        .route("/api/stats/today", get(routes::today_stats))
        .route("/api/stats/historical", get(routes::historical_stats));

    Router::new().merge(beacons).merge(api).with_state(state)
}

pub async fn start_server(config: &Config, state: Arc<AppState>) -> Result<()> {
    let app = build_router(state);

    let addr = config.bind_address();
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
