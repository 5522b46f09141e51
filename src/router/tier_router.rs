//! Top-level routing entry point: BM25 fast-path, intent classification,
//! risk scoring, and per-tier context-budget compression.

use serde::Serialize;
use serde_json::Value;

use crate::retrieval::Bm25Index;

use super::classifier::{Classifier, Tier};

const BM25_FAST_PATH_THRESHOLD: f64 = 0.9;
const CONTEXT_BUDGET_CHEAP: usize = 4_000;
const CONTEXT_BUDGET_PREMIUM: usize = 16_000;

const SENSITIVE_PATH_TOKENS: &[&str] =
    &["config", "secret", "key", "password", "auth", ".env", "credentials", "main.py", "index"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteTier {
    CacheOnly,
    Local,
    Cheap,
    Premium,
    CacheCandidate,
}

impl From<Tier> for RouteTier {
    fn from(t: Tier) -> Self {
        match t {
            Tier::CacheOnly => RouteTier::CacheOnly,
            Tier::Local => RouteTier::Local,
            Tier::Cheap => RouteTier::Cheap,
            Tier::Premium => RouteTier::Premium,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub tier: RouteTier,
    pub confidence: f64,
    pub reason: String,
    pub risk_score: f64,
    pub compressed_messages: Vec<Value>,
    pub context_tokens: usize,
}

/// Routes a request to the tier that should answer it, compressing the
/// conversation to fit that tier's context budget along the way.
pub struct TierRouter {
    classifier: Classifier,
    bm25: std::sync::Arc<Bm25Index>,
    budget_cheap: usize,
    budget_premium: usize,
}

impl TierRouter {
    pub fn new(classifier: Classifier, bm25: std::sync::Arc<Bm25Index>, budget_cheap: usize, budget_premium: usize) -> Self {
        Self { classifier, bm25, budget_cheap, budget_premium }
    }

    pub async fn route(
        &self,
        query: &str,
        messages: &[Value],
        context: Option<&Value>,
        force_tier: Option<RouteTier>,
    ) -> RoutingDecision {
        if let Some(tier) = force_tier {
            let risk_score = if tier == RouteTier::Premium { 0.5 } else { 0.2 };
            let compressed = Self::compress_messages(messages, tier, self.budget_cheap, self.budget_premium);
            let context_tokens = Self::count_tokens(&compressed);
            return RoutingDecision {
                tier,
                confidence: 1.0,
                reason: format!("Forced tier: {tier:?}"),
                risk_score,
                compressed_messages: compressed,
                context_tokens,
            };
        }

        let bm25_hits = self.bm25.search(query, 1, 0.0).await;
        if let Some(best) = bm25_hits.first() {
            if best.score > BM25_FAST_PATH_THRESHOLD {
                tracing::info!(score = best.score, "bm25 fast-path hit");
                return RoutingDecision {
                    tier: RouteTier::CacheCandidate,
                    confidence: best.score,
                    reason: "BM25 found highly similar query".to_string(),
                    risk_score: 0.1,
                    compressed_messages: messages.to_vec(),
                    context_tokens: Self::count_tokens(messages),
                };
            }
        }

        let classification = self.classifier.classify(query, context).await;
        let tier = RouteTier::from(classification.tier);
        let risk_score = Self::calculate_risk_score(&classification, context);
        let compressed = Self::compress_messages(messages, tier, self.budget_cheap, self.budget_premium);
        let context_tokens = Self::count_tokens(&compressed);

        RoutingDecision {
            tier,
            confidence: classification.confidence,
            reason: classification.reason,
            risk_score,
            compressed_messages: compressed,
            context_tokens,
        }
    }

    fn calculate_risk_score(
        classification: &super::classifier::ClassificationResult,
        context: Option<&Value>,
    ) -> f64 {
        let mut score = 0.5;
        score += classification.complexity_score * 0.2;
        if classification.requires_code {
            score += 0.15;
        }
        if classification.requires_analysis {
            score += 0.10;
        }
        if classification.confidence < 0.7 {
            score += 0.15;
        }

        if let Some(context) = context.and_then(|c| c.as_object()) {
            if context.get("action").and_then(|v| v.as_str()) == Some("modify") {
                score += 0.20;
            }
            if let Some(path) = context.get("file_path").and_then(|v| v.as_str()) {
                let path_lower = path.to_lowercase();
                if SENSITIVE_PATH_TOKENS.iter().any(|t| path_lower.contains(t)) {
                    score += 0.15;
                }
            }
        }

        score.clamp(0.0, 1.0)
    }

    /// Estimate `~4 chars per token` plus a 4-token-per-message overhead.
    fn count_tokens(messages: &[Value]) -> usize {
        let chars: usize = messages
            .iter()
            .map(|m| m.get("content").and_then(|c| c.as_str()).map(|s| s.chars().count()).unwrap_or(0))
            .sum();
        chars / 4 + messages.len() * 4
    }

    fn compress_messages(
        messages: &[Value],
        tier: RouteTier,
        budget_cheap: usize,
        budget_premium: usize,
    ) -> Vec<Value> {
        let budget = if tier == RouteTier::Premium { budget_premium } else { budget_cheap };

        if Self::count_tokens(messages) <= budget {
            return messages.to_vec();
        }

        let (system, non_system): (Vec<Value>, Vec<Value>) =
            messages.iter().cloned().partition(|m| m.get("role").and_then(|r| r.as_str()) == Some("system"));

        let mut remaining_budget = budget.saturating_sub(Self::count_tokens(&system));
        let mut admitted: Vec<Value> = Vec::new();

        for msg in non_system.iter().rev() {
            let msg_tokens = Self::count_tokens(std::slice::from_ref(msg));
            if msg_tokens <= remaining_budget {
                admitted.insert(0, msg.clone());
                remaining_budget -= msg_tokens;
            } else if let Some(truncated) = Self::truncate_message(msg, remaining_budget) {
                admitted.insert(0, truncated);
                break;
            } else {
                break;
            }
        }

        let mut compressed = system;
        compressed.extend(admitted);
        compressed
    }

    fn truncate_message(message: &Value, max_tokens: usize) -> Option<Value> {
        let content = message.get("content").and_then(|c| c.as_str())?;
        let max_chars = max_tokens * 4;
        if content.chars().count() <= max_chars {
            return Some(message.clone());
        }
        if max_chars < 50 {
            return None;
        }
        let truncated: String = content.chars().take(max_chars - 50).collect();
        Some(serde_json::json!({
            "role": message.get("role").cloned().unwrap_or(Value::Null),
            "content": format!("{truncated}\n\n[... truncated for context budget ...]"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePool;

    async fn router() -> TierRouter {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let bm25 = std::sync::Arc::new(Bm25Index::new(pool).await.unwrap());
        let classifier = Classifier::new("http://127.0.0.1:1", None, "llama-3.1-8b-instant");
        TierRouter::new(classifier, bm25, CONTEXT_BUDGET_CHEAP, CONTEXT_BUDGET_PREMIUM)
    }

    #[tokio::test]
    async fn forced_tier_skips_classification() {
        let r = router().await;
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let decision = r.route("hi", &messages, None, Some(RouteTier::Premium)).await;
        assert_eq!(decision.tier, RouteTier::Premium);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.risk_score, 0.5);
    }

    #[tokio::test]
    async fn forced_non_premium_tier_has_low_risk() {
        let r = router().await;
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let decision = r.route("hi", &messages, None, Some(RouteTier::Cheap)).await;
        assert_eq!(decision.risk_score, 0.2);
    }

    #[tokio::test]
    async fn bm25_fast_path_short_circuits_to_cache_candidate() {
        let r = router().await;
        r.bm25.index_query("what is the capital of france", "paris", None).await.unwrap();
        let messages = vec![json!({"role": "user", "content": "what is the capital of france"})];
        let decision = r.route("what is the capital of france", &messages, None, None).await;
        assert_eq!(decision.tier, RouteTier::CacheCandidate);
        assert_eq!(decision.risk_score, 0.1);
    }

    #[test]
    fn count_tokens_accounts_for_content_length_and_overhead() {
        let messages = vec![json!({"role": "user", "content": "abcdefgh"})];
        assert_eq!(TierRouter::count_tokens(&messages), 2 + 4);
    }

    #[test]
    fn compress_messages_keeps_system_message_and_truncates_overflow() {
        let long_content = "x".repeat(20_000);
        let messages = vec![
            json!({"role": "system", "content": "you are helpful"}),
            json!({"role": "user", "content": long_content}),
        ];
        let compressed = TierRouter::compress_messages(&messages, RouteTier::Cheap, CONTEXT_BUDGET_CHEAP, CONTEXT_BUDGET_PREMIUM);
        assert_eq!(compressed[0]["role"], "system");
        let last_content = compressed.last().unwrap()["content"].as_str().unwrap();
        assert!(last_content.contains("truncated for context budget"));
    }

    #[test]
    fn compress_messages_returns_unchanged_when_within_budget() {
        let messages = vec![json!({"role": "user", "content": "short"})];
        let compressed = TierRouter::compress_messages(&messages, RouteTier::Cheap, CONTEXT_BUDGET_CHEAP, CONTEXT_BUDGET_PREMIUM);
        assert_eq!(compressed, messages);
    }

    #[test]
    fn risk_score_increases_with_code_and_analysis_requirements() {
        let classification = super::super::classifier::ClassificationResult {
            tier: Tier::Premium,
            confidence: 0.9,
            reason: "x".into(),
            complexity_score: 0.8,
            requires_code: true,
            requires_analysis: true,
        };
        let score = TierRouter::calculate_risk_score(&classification, None);
        assert!(score > 0.8);
    }

    #[test]
    fn risk_score_rises_for_sensitive_file_paths() {
        let classification = super::super::classifier::ClassificationResult {
            tier: Tier::Cheap,
            confidence: 0.9,
            reason: "x".into(),
            complexity_score: 0.1,
            requires_code: false,
            requires_analysis: false,
        };
        let context = json!({"file_path": "src/config/secrets.env"});
        let with_path = TierRouter::calculate_risk_score(&classification, Some(&context));
        let without_path = TierRouter::calculate_risk_score(&classification, None);
        assert!(with_path > without_path);
    }
}
