//! `GET /api/budget` — today's spend against the three progressive limits.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::error::AppError;
use crate::state::AppState;

pub async fn get_budget(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, AppError> {
    let status = state.budget_guard.get_status().await?;
    Ok(Json(status))
}
