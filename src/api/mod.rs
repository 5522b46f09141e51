//! HTTP surface: a single axum router carrying both the public chat endpoint
//! and the operator-facing admin/metrics endpoints, bound to one port.
//!
//! `/health` is the only route exempt from bearer auth — everything else
//! requires `Authorization: Bearer <gateway_secret>`.

pub mod admin;
pub mod auth;
pub mod budget;
pub mod chat;
pub mod health;
pub mod metrics;
pub mod models;
pub mod request_id;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/api/metrics", get(metrics::get_metrics))
        .route("/api/budget", get(budget::get_budget))
        .route("/api/local/models", get(models::list_local_models))
        .route("/admin/kill-switch", post(admin::kill_switch))
        .route("/admin/config", get(admin::get_config))
        .layer(middleware::from_fn_with_state(state.clone(), auth::bearer_auth_middleware));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}
