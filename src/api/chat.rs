//! `POST /v1/chat/completions` — the gateway's one real endpoint. Everything
//! else under `/api` and `/admin` exists to observe or steer this path.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};

use crate::error::AppError;
use crate::pipeline::{self, ChatRequest};
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = pipeline::handle_chat_completion(state, req).await?;
    Ok(Json(response))
}
