//! Intent classification: decides which tier a query belongs to before the
//! tier router applies BM25 and risk-scoring on top.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};

use crate::util::with_retries;

const CLASSIFIER_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_MIN_DELAY: Duration = Duration::from_millis(100);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
const RETRY_ATTEMPTS: u32 = 3;

const VAGUE_PATTERNS: &[&str] = &["help", "fix", "do it", "can you", "please", "code"];
const PREMIUM_PATTERNS: &[&str] = &[
    "refactor", "debug", "implement", "architecture", "design pattern", "optimize", "review", "analyze",
    "analyse", "complete", "full", "entire",
];
const CHEAP_PATTERNS: &[&str] =
    &["what is", "explain", "definition", "example", "syntax", "how to write"];

const CLASSIFIER_PROMPT_TEMPLATE: &str = "You are a query router for an AI coding assistant. \
Classify the request into one of the following categories:\n\n\
CACHE_ONLY: Too vague or unclear. Examples: \"help me\", \"code\", \"fix it\"\n\
LOCAL: Trivial questions, definitions. Examples: \"what is a variable?\", \"explain git status\"\n\
CHEAP: Simple explanations, small code snippets. Examples: \"for-loop in Python\", \"regex for email\"\n\
PREMIUM: Complex analysis, large code generation, refactoring, debugging. Examples: \"refactor this class\", \"find the bug in this code\", \"implement feature X\"\n\n\
Query: {query}\n\n\
Context (if any): {context}\n\n\
Respond ONLY in this format:\n\
TIER: <CACHE_ONLY|LOCAL|CHEAP|PREMIUM>\n\
CONFIDENCE: <0.0-1.0>\n\
REASON: <short justification>\n\
REQUIRES_CODE: <true|false>\n\
REQUIRES_ANALYSIS: <true|false>\n\
COMPLEXITY: <0.0-1.0>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    CacheOnly,
    Local,
    Cheap,
    Premium,
}

impl Tier {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CACHE_ONLY" => Some(Tier::CacheOnly),
            "LOCAL" => Some(Tier::Local),
            "CHEAP" => Some(Tier::Cheap),
            "PREMIUM" => Some(Tier::Premium),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub tier: Tier,
    pub confidence: f64,
    pub reason: String,
    pub complexity_score: f64,
    pub requires_code: bool,
    pub requires_analysis: bool,
}

impl ClassificationResult {
    fn heuristic(tier: Tier, confidence: f64, reason: &str) -> Self {
        Self {
            tier,
            confidence,
            reason: reason.to_string(),
            complexity_score: 0.5,
            requires_code: false,
            requires_analysis: false,
        }
    }
}

/// Fast-path heuristics plus a remote-LLM-assisted fallback for ambiguous
/// queries. Wraps an OpenAI-compatible chat endpoint (Groq in production).
pub struct Classifier {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl Classifier {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, model: impl Into<String>) -> Self {
        let client = Client::builder().timeout(CLASSIFIER_TIMEOUT).build().expect("failed to build reqwest client");
        Self { client, base_url: base_url.into(), api_key, model: model.into() }
    }

    pub async fn classify(&self, query: &str, context: Option<&Value>) -> ClassificationResult {
        if let Some(quick) = Self::quick_classify(query) {
            return quick;
        }

        let context_str = Self::format_context(context);
        let prompt = CLASSIFIER_PROMPT_TEMPLATE.replace("{query}", query).replace("{context}", &context_str);

        let result = with_retries(RETRY_ATTEMPTS, RETRY_MIN_DELAY, RETRY_MAX_DELAY, || self.call(&prompt)).await;

        match result {
            Ok(content) => Self::parse_response(&content),
            Err(e) => {
                if e.is_timeout() {
                    tracing::warn!("classifier timeout, falling back to cheap tier");
                    ClassificationResult::heuristic(Tier::Cheap, 0.5, "Router timeout - defaulting to cheap tier")
                } else {
                    tracing::warn!(error = %e, "classification error");
                    ClassificationResult::heuristic(Tier::Cheap, 0.3, &format!("Classification error: {e}"))
                }
            }
        }
    }

    async fn call(&self, prompt: &str) -> Result<String, reqwest::Error> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&json!({
                "model": self.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": 150,
                "temperature": 0,
            }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?.error_for_status()?;
        let body: Value = resp.json().await?;
        Ok(body["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string())
    }

    fn quick_classify(query: &str) -> Option<ClassificationResult> {
        let lower = query.to_lowercase();
        let trimmed = lower.trim();

        if trimmed.len() < 15 && VAGUE_PATTERNS.iter().any(|p| trimmed.contains(p)) {
            return Some(ClassificationResult::heuristic(
                Tier::CacheOnly,
                0.9,
                "Query too vague for a meaningful response",
            ));
        }

        if PREMIUM_PATTERNS.iter().any(|p| trimmed.contains(p)) {
            return Some(ClassificationResult {
                tier: Tier::Premium,
                confidence: 0.85,
                reason: "Query contains premium indicators".to_string(),
                complexity_score: 0.8,
                requires_code: true,
                requires_analysis: true,
            });
        }

        if CHEAP_PATTERNS.iter().any(|p| trimmed.contains(p)) {
            return Some(ClassificationResult {
                tier: Tier::Cheap,
                confidence: 0.85,
                reason: "Simple explanation or definition".to_string(),
                complexity_score: 0.3,
                requires_code: false,
                requires_analysis: false,
            });
        }

        None
    }

    fn format_context(context: Option<&Value>) -> String {
        let Some(context) = context.and_then(|c| c.as_object()) else {
            return "No additional context".to_string();
        };

        let mut parts = Vec::new();
        if let Some(v) = context.get("file_path").and_then(|v| v.as_str()) {
            parts.push(format!("File: {v}"));
        }
        if let Some(v) = context.get("language").and_then(|v| v.as_str()) {
            parts.push(format!("Language: {v}"));
        }
        if let Some(v) = context.get("git_status").and_then(|v| v.as_str()) {
            parts.push(format!("Git: {v}"));
        }
        if let Some(v) = context.get("code_snippet").and_then(|v| v.as_str()) {
            let snippet: String = v.chars().take(200).collect();
            parts.push(format!("Code: {snippet}..."));
        }

        if parts.is_empty() {
            "No context".to_string()
        } else {
            parts.join(" | ")
        }
    }

    fn parse_response(content: &str) -> ClassificationResult {
        let mut tier = Tier::Cheap;
        let mut confidence = 0.5;
        let mut reason = "Parsed from response".to_string();
        let mut requires_code = false;
        let mut requires_analysis = false;
        let mut complexity = 0.5;

        for line in content.lines() {
            let line = line.trim();
            if let Some(v) = line.strip_prefix("TIER:") {
                tier = Tier::parse(v).unwrap_or(Tier::Cheap);
            } else if let Some(v) = line.strip_prefix("CONFIDENCE:") {
                confidence = v.trim().parse().unwrap_or(0.5);
            } else if let Some(v) = line.strip_prefix("REASON:") {
                reason = v.trim().to_string();
            } else if let Some(v) = line.strip_prefix("REQUIRES_CODE:") {
                requires_code = v.to_lowercase().contains("true");
            } else if let Some(v) = line.strip_prefix("REQUIRES_ANALYSIS:") {
                requires_analysis = v.to_lowercase().contains("true");
            } else if let Some(v) = line.strip_prefix("COMPLEXITY:") {
                complexity = v.trim().parse().unwrap_or(0.5);
            }
        }

        ClassificationResult { tier, confidence, reason, complexity_score: complexity, requires_code, requires_analysis }
    }
}
