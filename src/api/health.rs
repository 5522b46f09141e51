//! Liveness probe. Unlike every other route this one is never gated by
//! bearer auth, so orchestrators can poll it without a secret.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let anthropic_ok = state.backends.anthropic.health_check().await.is_ok();
    let cheap_ok = state.backends.cheap.health_check().await.is_ok();
    let local_ok = match &state.backends.local {
        Some(local) => local.health_check().await.is_ok(),
        None => true,
    };
    let kill_switch = state.kill_switch.get_status().await;

    let healthy = cheap_ok && local_ok;

    Json(json!({
        "status": if healthy { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "anthropic_backend": anthropic_ok,
            "cheap_backend": cheap_ok,
            "local_backend": local_ok,
            "kill_switch_mode": kill_switch.mode,
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        },
    }))
}
