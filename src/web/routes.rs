//! Statistics API routes with response caching

use axum::{
    extract::{Query, State},
    Json,
};
use cached::Cached;
use chrono::{Days, NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::error::AppError;
use super::AppState;
use crate::db::{HistoricalStats, TodayStats};

/// Window used when `days` is missing or not a positive integer
pub const DEFAULT_LOOKBACK_DAYS: u64 = 30;

#[derive(Debug, Deserialize)]
pub struct TodayQuery {
    #[serde(rename = "pageURL")]
    pub page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    /// Kept as text so that junk falls back to the default instead of a 400
    pub days: Option<String>,
    #[serde(rename = "pageURL")]
    pub page_url: Option<String>,
}

pub fn lookback_days(raw: Option<&str>) -> u64 {
    raw.and_then(|days| days.trim().parse::<u64>().ok())
        .filter(|&days| days > 0)
        .unwrap_or(DEFAULT_LOOKBACK_DAYS)
}

/// An empty filter means every page
fn page_filter(page_url: Option<String>) -> Option<String> {
    page_url.filter(|url| !url.is_empty())
}

/// API: live stats from today's raw events
pub async fn today_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TodayQuery>,
) -> Result<Json<TodayStats>, AppError> {
    let page_url = page_filter(query.page_url);
    let today = Utc::now().date_naive();
    let stats = state.db.get_today_stats(today, page_url.as_deref()).await?;
    Ok(Json(stats))
}

/// API: summed daily aggregates over a lookback window (cached)
pub async fn historical_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoricalQuery>,
) -> Result<Json<HistoricalStats>, AppError> {
    let days = lookback_days(query.days.as_deref());
    let page_url = page_filter(query.page_url);
    let key = (days, page_url.clone());

    if let Some(cache) = &state.historical_cache {
        if let Some(hit) = cache.lock().await.cache_get(&key) {
            return Ok(Json(hit.clone()));
        }
    }

    let since = Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(days))
        .unwrap_or(NaiveDate::MIN);
    let stats = state
        .db
        .get_historical_stats(since, page_url.as_deref())
        .await?;

    if let Some(cache) = &state.historical_cache {
        cache.lock().await.cache_set(key, stats.clone());
    }

    Ok(Json(stats))
}
