//! `GET /api/metrics` — rolling-window and lifetime counters.
//!
//! Serves Prometheus text exposition format when the caller sends
//! `Accept: text/plain`, JSON otherwise.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};

use crate::state::AppState;

pub async fn get_metrics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    let wants_prometheus = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/plain"))
        .unwrap_or(false);

    if wants_prometheus {
        ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], state.metrics.get_prometheus()).into_response()
    } else {
        Json(state.metrics.get_summary()).into_response()
    }
}
