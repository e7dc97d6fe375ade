//! Beacon endpoints: tracking pixel, beacon script and the collect call it makes

use axum::{
    extract::{OriginalUri, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use super::client_ip::ClientAddr;
use super::error::AppError;
use super::AppState;
use crate::recorder::Beacon;

/// 1x1 transparent GIF
pub static PIXEL: [u8; 35] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0xff, 0x00, 0xff, 0xff,
    0xff, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02,
    0x02, 0x44, 0x01, 0x00, 0x3b,
];

const SCRIPT_TEMPLATE: &str = include_str!("../../static/track.js");

/// Protocol-relative collect endpoint; standard ports are left implicit
pub fn collect_url(domain: &str, port: u16) -> String {
    match port {
        80 | 443 => format!("//{}/collect", domain),
        _ => format!("//{}:{}/collect", domain, port),
    }
}

pub fn render_script(domain: &str, port: u16) -> String {
    SCRIPT_TEMPLATE.replace("{{COLLECT_URL}}", &collect_url(domain, port))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct PixelQuery {
    pub url: Option<String>,
}

/// Serve the pixel and record the request as a page view
pub async fn pixel(
    State(state): State<Arc<AppState>>,
    ClientAddr(ip): ClientAddr,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    Query(query): Query<PixelQuery>,
) -> Response {
    let page_url = query
        .url
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| uri.to_string());

    let beacon = Beacon {
        ip_address: ip,
        user_agent: header_str(&headers, header::USER_AGENT),
        referrer: header_str(&headers, header::REFERER),
        page_url,
    };

    // The pixel is served either way; the status is all an image request can report
    let status = match state.recorder.record(beacon).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            tracing::error!(error = %e, "Failed to record pixel beacon");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (status, [(header::CONTENT_TYPE, "image/gif")], &PIXEL[..]).into_response()
}

/// Serve the beacon script
pub async fn script(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        state.script.clone(),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectPayload {
    pub url: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub user_agent: Option<String>,
}

/// Record a page view posted by the beacon script
pub async fn collect(
    State(state): State<Arc<AppState>>,
    ClientAddr(ip): ClientAddr,
    headers: HeaderMap,
    Json(payload): Json<CollectPayload>,
) -> Result<&'static str, AppError> {
    let user_agent = payload
        .user_agent
        .filter(|ua| !ua.is_empty())
        .unwrap_or_else(|| header_str(&headers, header::USER_AGENT));

    state
        .recorder
        .record(Beacon {
            ip_address: ip,
            user_agent,
            referrer: payload.referrer,
            page_url: payload.url,
        })
        .await?;

    Ok("Data collected")
}
