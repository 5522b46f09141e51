//! The request pipeline: the single path every `/v1/chat/completions` call
//! takes from an authenticated request to a billed, cached response.
//!
//! Stage order is fixed (policy → kill switch → rate limit → exact cache →
//! routing → backend dispatch → accounting → cache population) and runs
//! sequentially per request; independent requests run concurrently.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::router::tier_router::RouteTier;
use crate::security::rate_limiter::Tier as RateTier;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Value>,
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub force_tier: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u64 {
    4096
}

#[derive(Debug, Serialize)]
pub struct RoutingMeta {
    pub tier: String,
    pub confidence: f64,
    pub reason: String,
    pub risk_score: f64,
    pub context_tokens: usize,
}

fn parse_force_tier(s: &str) -> Option<RouteTier> {
    match s.to_lowercase().as_str() {
        "local" => Some(RouteTier::Local),
        "cheap" => Some(RouteTier::Cheap),
        "premium" => Some(RouteTier::Premium),
        _ => None,
    }
}

fn tier_name(tier: RouteTier) -> &'static str {
    match tier {
        RouteTier::CacheOnly => "cache_only",
        RouteTier::Local => "local",
        RouteTier::Cheap => "cheap",
        RouteTier::Premium => "premium",
        RouteTier::CacheCandidate => "cache_candidate",
    }
}

fn rate_limit_tier(tier: RouteTier) -> RateTier {
    match tier {
        RouteTier::Premium => RateTier::Premium,
        _ => RateTier::Cheap,
    }
}

fn budget_tier_str(tier: RouteTier) -> &'static str {
    match tier {
        RouteTier::Premium => "premium",
        _ => "cheap",
    }
}

/// Estimate cost in USD from a chat completion's `usage` block and the
/// dispatching tier.
fn compute_cost(usage: &Value, tier: RouteTier) -> f64 {
    let prompt = usage["prompt_tokens"].as_f64().unwrap_or(0.0);
    let completion = usage["completion_tokens"].as_f64().unwrap_or(0.0);

    if tier == RouteTier::Premium {
        let cache_read = usage["cache_read_input_tokens"].as_f64().unwrap_or(0.0);
        let regular_input = (prompt - cache_read).max(0.0);
        (regular_input * 3.0 + cache_read * 0.30 + completion * 15.0) / 1_000_000.0
    } else {
        (prompt + completion) * 0.05 / 1_000_000.0
    }
}

fn last_user_text(messages: &[Value]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        .and_then(|m| m.get("content").and_then(|c| c.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn estimate_tokens(messages: &[Value]) -> u64 {
    let chars: usize = messages
        .iter()
        .map(|m| m.get("content").and_then(|c| c.as_str()).map(|s| s.chars().count()).unwrap_or(0))
        .sum();
    (chars / 4 + messages.len() * 4) as u64
}

fn envelope(model: &str, content: &str, usage: Value, started: Instant, source: &str, routing: RoutingMeta) -> Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": "stop",
        }],
        "usage": usage,
        "gateway_meta": {
            "latency_ms": started.elapsed().as_millis() as u64,
            "source": source,
            "routing": routing,
        },
    })
}

/// Run the full pipeline for one chat completion request. Bearer-token
/// verification happens in the surrounding axum middleware, not here.
pub async fn handle_chat_completion(state: Arc<AppState>, req: ChatRequest) -> Result<Value, AppError> {
    let started = Instant::now();
    let result = run(state.clone(), req, started).await;
    state.kill_switch.record_request(result.is_ok());
    result
}

async fn run(state: Arc<AppState>, req: ChatRequest, started: Instant) -> Result<Value, AppError> {
    let query = last_user_text(&req.messages);

    // 2. Policy gate.
    if let Some(violation) = state.policy_gate.check(&query) {
        state.metrics.record_blocked("policy_violation");
        return Err(AppError::PolicyViolation {
            category: format!("{:?}", violation.category),
            description: violation.description,
        });
    }

    // 3. Kill switch.
    let gate = state.kill_switch.check(Some(&state.budget_guard)).await;
    if gate.blocked {
        state.metrics.record_blocked("kill_switch");
        return Err(AppError::ServiceUnavailable {
            reason: gate.reason,
            retry_after_seconds: gate.retry_after_seconds.unwrap_or(60),
        });
    }
    if let Some(delay_ms) = gate.throttle_delay_ms {
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
    }

    // 4. Rate limiter (global umbrella).
    let estimated_tokens = estimate_tokens(&req.messages) + req.max_tokens;
    let rl_decision = state.rate_limiter.check(estimated_tokens, RateTier::Global).await;
    if !rl_decision.allowed {
        state.metrics.record_blocked("rate_limit");
        return Err(AppError::RateLimit { message: rl_decision.message, wait_seconds: 30.0 });
    }

    // 5. Exact cache.
    let cache_key = crate::cache::ExactCache::compute_key(&req.messages, req.context.as_ref());
    if let Some(idempotency_key) = &req.idempotency_key {
        if let Ok(Some(cached)) = state.exact_cache.get_by_idempotency_key(idempotency_key).await {
            return Ok(on_cache_hit(&state, cached, started, "exact_cache_idempotency").await);
        }
    }
    if let Ok(Some(cached)) = state.exact_cache.get(&cache_key).await {
        return Ok(on_cache_hit(&state, cached, started, "exact_cache").await);
    }
    state.metrics.record_cache_miss("exact");

    // 6. Routing.
    let force_tier = req.force_tier.as_deref().and_then(parse_force_tier);
    let decision = state.tier_router.route(&query, &req.messages, req.context.as_ref(), force_tier).await;
    state.metrics.record_routing(tier_name(decision.tier));

    if decision.tier == RouteTier::CacheOnly {
        let content = "Could you clarify what you'd like help with? That request is too vague to act on.";
        let usage = json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 });
        let routing = RoutingMeta {
            tier: tier_name(decision.tier).to_string(),
            confidence: decision.confidence,
            reason: decision.reason,
            risk_score: decision.risk_score,
            context_tokens: decision.context_tokens,
        };
        return Ok(envelope("gateway-clarification", content, usage, started, "clarification", routing));
    }

    let mut effective_tier = decision.tier;
    if effective_tier == RouteTier::CacheCandidate {
        if let Ok(Some(hit)) = state.semantic_cache.search(&query, req.context.as_ref()).await {
            state.metrics.record_cache_hit("semantic");
            state.budget_guard.record_cache_hit().await.ok();
            let response: Value = serde_json::from_str(&hit.response).unwrap_or(json!({ "content": hit.response }));
            let content = response.get("content").and_then(|c| c.as_str()).unwrap_or(&hit.response).to_string();
            let usage = json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 });
            let routing = RoutingMeta {
                tier: "cache_candidate".to_string(),
                confidence: decision.confidence,
                reason: decision.reason.clone(),
                risk_score: decision.risk_score,
                context_tokens: decision.context_tokens,
            };
            return Ok(envelope("gateway-semantic-cache", &content, usage, started, "semantic_cache", routing));
        }
        state.metrics.record_cache_miss("semantic");
        effective_tier = RouteTier::Cheap;
    }

    // Kill switch degrade overrides to cheap regardless of routing decision.
    if gate.force_tier == Some("cheap") {
        effective_tier = RouteTier::Cheap;
    }

    // 7. Dispatch.
    let backend = match effective_tier {
        RouteTier::Premium => &state.backends.anthropic,
        RouteTier::Local => state.backends.local.as_ref().unwrap_or(&state.backends.cheap),
        _ => &state.backends.cheap,
    };

    let model = req.model.clone().unwrap_or_else(|| default_model_for(&state, effective_tier));
    let request_body = json!({
        "model": model,
        "messages": decision.compressed_messages,
        "temperature": req.temperature,
        "max_tokens": req.max_tokens,
    });

    let response =
        backend.generate(request_body).await.map_err(|e| AppError::UpstreamUnavailable { message: e.to_string() })?;

    let content = response["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string();
    let usage = response["usage"].clone();

    // 8. Cost accounting.
    let cost = compute_cost(&usage, effective_tier);
    state.budget_guard.check(cost, budget_tier_str(effective_tier)).await.ok();
    let tokens_in = usage["prompt_tokens"].as_i64().unwrap_or(0);
    let tokens_out = usage["completion_tokens"].as_i64().unwrap_or(0);
    state
        .budget_guard
        .record_spend(cost, budget_tier_str(effective_tier), Some(&model), tokens_in, tokens_out)
        .await
        .ok();
    state.metrics.record_cost(cost, budget_tier_str(effective_tier));
    state.rate_limiter.record(estimated_tokens, rate_limit_tier(effective_tier)).await;

    // 9. Exact cache store.
    state
        .exact_cache
        .set(&cache_key, &json!({ "content": content }), Some(&usage), None, req.idempotency_key.as_deref())
        .await
        .ok();

    // 10. Semantic cache store (skipped for cache-only/candidate short-circuits).
    let response_payload = json!({ "content": content }).to_string();
    state
        .semantic_cache
        .store(&query, &response_payload, req.context.as_ref(), decision.risk_score)
        .await
        .ok();

    state.bm25.index_query(&query, &content, None).await.ok();

    let routing = RoutingMeta {
        tier: tier_name(effective_tier).to_string(),
        confidence: decision.confidence,
        reason: decision.reason,
        risk_score: decision.risk_score,
        context_tokens: decision.context_tokens,
    };
    state.metrics.record_request(started.elapsed().as_millis() as f64, tier_name(effective_tier), "success");
    Ok(envelope(&model, &content, usage, started, "backend", routing))
}

async fn on_cache_hit(state: &Arc<AppState>, cached: Value, started: Instant, source: &str) -> Value {
    state.metrics.record_cache_hit(if source.contains("idempotency") { "idempotency" } else { "exact" });
    state.budget_guard.record_cache_hit().await.ok();
    let content = cached.get("content").and_then(|c| c.as_str()).unwrap_or_default().to_string();
    let usage = json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 });
    let routing = RoutingMeta {
        tier: "cache".to_string(),
        confidence: 1.0,
        reason: "exact cache hit".to_string(),
        risk_score: 0.0,
        context_tokens: 0,
    };
    envelope("gateway-cache", &content, usage, started, source, routing)
}

fn default_model_for(state: &AppState, tier: RouteTier) -> String {
    match tier {
        RouteTier::Premium => {
            state.config.backends.anthropic.model.clone().unwrap_or_else(|| "claude-sonnet-4-20250514".to_string())
        }
        RouteTier::Local => state.config.backends.local.model.clone(),
        _ => state.config.backends.cheap.model.clone().unwrap_or_else(|| "llama-3.1-8b-instant".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_cost_applies_prompt_cache_discount_for_premium() {
        let usage = json!({
            "prompt_tokens": 1_000_000,
            "completion_tokens": 1_000_000,
            "cache_read_input_tokens": 400_000,
        });
        let cost = compute_cost(&usage, RouteTier::Premium);
        // regular_input = 600_000 * 3/1e6 = 1.8; cache_read = 400_000 * 0.30/1e6 = 0.12; output = 1_000_000*15/1e6 = 15.0
        assert!((cost - (1.8 + 0.12 + 15.0)).abs() < 1e-9);
    }

    #[test]
    fn compute_cost_flat_rate_for_cheap_tier() {
        let usage = json!({ "prompt_tokens": 500_000, "completion_tokens": 500_000 });
        let cost = compute_cost(&usage, RouteTier::Cheap);
        assert!((cost - 0.05).abs() < 1e-9);
    }

    #[test]
    fn last_user_text_finds_most_recent_user_message() {
        let messages = vec![
            json!({"role": "system", "content": "be nice"}),
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "reply"}),
            json!({"role": "user", "content": "second"}),
        ];
        assert_eq!(last_user_text(&messages), "second");
    }

    #[test]
    fn estimate_tokens_scales_with_content_length() {
        let messages = vec![json!({"role": "user", "content": "abcdefgh"})];
        assert_eq!(estimate_tokens(&messages), 2 + 4);
    }

    #[test]
    fn parse_force_tier_accepts_known_values_case_insensitively() {
        assert_eq!(parse_force_tier("PREMIUM"), Some(RouteTier::Premium));
        assert_eq!(parse_force_tier("cheap"), Some(RouteTier::Cheap));
        assert_eq!(parse_force_tier("nonsense"), None);
    }
}
