//! `GET /api/local/models` — models the local backend currently serves.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use crate::state::AppState;

pub async fn list_local_models(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let models = match &state.config.backends.local.enabled {
        true => vec![state.config.backends.local.model.clone()],
        false => vec![],
    };
    Json(json!({ "models": models }))
}
