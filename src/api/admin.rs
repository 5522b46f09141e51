//! Operator-facing admin endpoints: the manual kill-switch lever and a
//! redacted view of the running configuration.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct KillSwitchQuery {
    /// `enable`, `disable`, or `status`. Defaults to `status`.
    #[serde(default = "default_action")]
    action: String,
    /// Forced mode when `action=enable`: `kill`, `degrade`, or `throttle`.
    /// Defaults to `kill`.
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    reason: Option<String>,
}

fn default_action() -> String {
    "status".to_string()
}

fn default_mode() -> String {
    "kill".to_string()
}

/// POST /admin/kill-switch?action=enable|disable|status[&mode=kill|degrade|throttle][&reason=...]
pub async fn kill_switch(State(state): State<Arc<AppState>>, Query(q): Query<KillSwitchQuery>) -> impl IntoResponse {
    match q.action.as_str() {
        "enable" => {
            let reason = q.reason.unwrap_or_else(|| "manually activated".to_string());
            state.kill_switch.enable(&q.mode, reason).await;
        }
        "disable" => {
            state.kill_switch.disable().await;
        }
        _ => {}
    }

    let status = state.kill_switch.get_status().await;
    Json(json!({ "status": status }))
}

/// GET /admin/config — the running configuration with secrets redacted.
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.redacted())
}
