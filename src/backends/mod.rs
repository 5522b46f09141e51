//! Backend client factory and unified dispatch interface.
//!
//! The gateway talks to exactly three kinds of upstream: the premium tier
//! (Anthropic's native Messages API), the cheap tier (an OpenAI-compatible
//! host — Groq in production), and an optional local tier (Ollama's
//! OpenAI-compat endpoint). [`Backends`] builds all three once at startup
//! from [`BackendsConfig`], each wrapped as a [`Backend`] pairing the raw
//! [`BackendClient`] adapter with a [`CircuitBreaker`]. Routing code calls
//! [`Backend::generate`], which retries and trips the breaker on repeated
//! failure; adapter-specific protocol differences — schema translation, auth
//! headers, endpoint paths — stay fully encapsulated in the adapter modules.

pub mod circuit_breaker;
mod anthropic;
mod ollama;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use circuit_breaker::{BreakerStatus, CircuitBreaker};
pub use ollama::OllamaAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use crate::config::BackendsConfig;
use crate::util::with_retries;

/// A `Send`-able, heap-allocated SSE byte stream.
///
/// Each item is either a chunk of raw SSE data (already in OpenAI wire format)
/// or an error. The stream terminates when all data has been yielded.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Per-request timeout for the cheap (Groq/OpenAI-compatible) tier.
const CHEAP_TIMEOUT_MS: u64 = 30_000;
/// Per-request timeout for the premium (Anthropic) tier — Claude's larger
/// models can run noticeably longer than the cheap/local tiers.
const PREMIUM_TIMEOUT_MS: u64 = 60_000;
/// Per-request timeout for the local (Ollama) tier — unaccelerated hardware
/// is the expected case, so this is the most generous of the three.
const LOCAL_TIMEOUT_MS: u64 = 120_000;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_MIN_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const BREAKER_HALF_OPEN_REQUESTS: u32 = 3;

/// A single upstream adapter, named by the role it plays rather than by a
/// generic "provider" tag — each tier has exactly one fixed backend shape.
pub enum BackendClient {
    /// Anthropic Messages API with request/response translation.
    Anthropic(AnthropicAdapter),
    /// OpenAI-compatible passthrough (the cheap tier — Groq in production).
    OpenAI(OpenAIAdapter),
    /// Ollama local inference server (OpenAI-compat endpoint).
    Ollama(OllamaAdapter),
}

impl BackendClient {
    /// Forward a `/v1/chat/completions` request to the wrapped backend.
    ///
    /// The request body should have `model` already rewritten by the router
    /// before this is called.
    pub async fn chat_completions(&self, request: Value) -> anyhow::Result<Value> {
        match self {
            Self::Anthropic(a) => a.chat_completions(request).await,
            Self::OpenAI(a) => a.chat_completions(request).await,
            Self::Ollama(a) => a.chat_completions(request).await,
        }
    }

    /// Forward a streaming request and return an [`SseStream`].
    ///
    /// All backends produce OpenAI-compatible SSE output:
    /// - OpenAI-compatible and Ollama backends proxy bytes verbatim.
    /// - Anthropic backends translate on-the-fly from Anthropic's SSE schema.
    pub async fn chat_completions_stream(&self, request: Value) -> anyhow::Result<SseStream> {
        match self {
            Self::Anthropic(a) => a.chat_completions_stream(request).await,
            Self::OpenAI(a) => a.chat_completions_stream(request).await,
            Self::Ollama(a) => a.chat_completions_stream(request).await,
        }
    }

    /// Probe this backend for liveness. Implementation varies by provider.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        match self {
            Self::Anthropic(a) => a.health_check().await,
            Self::OpenAI(a) => a.health_check().await,
            Self::Ollama(a) => a.health_check().await,
        }
    }
}

/// An adapter paired with a circuit breaker, giving every upstream call a
/// bounded retry budget that backs off once the backend looks unhealthy.
pub struct Backend {
    client: BackendClient,
    breaker: CircuitBreaker,
}

impl Backend {
    fn new(client: BackendClient) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_RECOVERY_TIMEOUT, BREAKER_HALF_OPEN_REQUESTS),
        }
    }

    /// Forward a buffered chat-completion request with up to
    /// [`RETRY_ATTEMPTS`] retries, short-circuiting immediately while the
    /// breaker is open.
    pub async fn generate(&self, request: Value) -> anyhow::Result<Value> {
        if !self.breaker.can_execute() {
            anyhow::bail!("circuit breaker open, backend unavailable");
        }

        let result = with_retries(RETRY_ATTEMPTS, RETRY_MIN_DELAY, RETRY_MAX_DELAY, || {
            self.client.chat_completions(request.clone())
        })
        .await;

        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(_) => self.breaker.record_failure(),
        }
        result
    }

    pub async fn chat_completions_stream(&self, request: Value) -> anyhow::Result<SseStream> {
        self.client.chat_completions_stream(request).await
    }

    /// Probe liveness directly, bypassing the breaker — health checks are
    /// what decides whether the breaker should even be given a chance.
    pub async fn health_check(&self) -> anyhow::Result<()> {
        self.client.health_check().await
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }
}

/// The three wired-up upstream adapters, built once at startup.
pub struct Backends {
    pub anthropic: Backend,
    pub cheap: Backend,
    pub local: Option<Backend>,
}

impl Backends {
    /// Construct every configured backend. Anthropic always requires an API
    /// key; the cheap tier tolerates a missing key (useful against a local
    /// OpenAI-compatible proxy that doesn't enforce auth); the local tier is
    /// only built when `cfg.local.enabled` is set.
    pub fn new(cfg: &BackendsConfig) -> anyhow::Result<Self> {
        let anthropic_key = cfg
            .anthropic
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY must be set"))?;
        let anthropic_url = cfg
            .anthropic
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.anthropic.com".to_string());
        let anthropic = Backend::new(BackendClient::Anthropic(AnthropicAdapter::new(
            anthropic_url,
            PREMIUM_TIMEOUT_MS,
            anthropic_key,
        )));

        let cheap_url = cfg
            .cheap
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string());
        let cheap = Backend::new(BackendClient::OpenAI(OpenAIAdapter::new(
            cheap_url,
            CHEAP_TIMEOUT_MS,
            cfg.cheap.api_key.clone(),
        )));

        let local = cfg
            .local
            .enabled
            .then(|| Backend::new(BackendClient::Ollama(OllamaAdapter::new(cfg.local.base_url.clone(), LOCAL_TIMEOUT_MS))));

        Ok(Self { anthropic, cheap, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendEndpoint, LocalBackendEndpoint};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_completion_body() -> serde_json::Value {
        json!({
            "choices": [{
                "message": {
                    "content": "Here is a comprehensive response that is definitely long enough."
                }
            }]
        })
    }

    fn client_for(server: &MockServer) -> BackendClient {
        BackendClient::OpenAI(OpenAIAdapter::new(server.uri(), 5_000, None))
    }

    // -----------------------------------------------------------------------
    // Backends::new
    // -----------------------------------------------------------------------

    #[test]
    fn new_errors_without_anthropic_key() {
        let cfg = BackendsConfig {
            anthropic: BackendEndpoint { base_url: None, api_key: None, model: None },
            cheap: BackendEndpoint { base_url: None, api_key: None, model: None },
            local: LocalBackendEndpoint {
                enabled: false,
                base_url: "http://localhost:11434/v1".into(),
                model: "llama3.2".into(),
            },
        };
        assert!(Backends::new(&cfg).is_err());
    }

    #[test]
    fn new_succeeds_with_anthropic_key_and_no_local_tier() {
        let cfg = BackendsConfig {
            anthropic: BackendEndpoint { base_url: None, api_key: Some("sk-ant-x".into()), model: None },
            cheap: BackendEndpoint { base_url: None, api_key: None, model: None },
            local: LocalBackendEndpoint {
                enabled: false,
                base_url: "http://localhost:11434/v1".into(),
                model: "llama3.2".into(),
            },
        };
        let backends = Backends::new(&cfg).unwrap();
        assert!(backends.local.is_none());
    }

    #[test]
    fn new_builds_local_tier_when_enabled() {
        let cfg = BackendsConfig {
            anthropic: BackendEndpoint { base_url: None, api_key: Some("sk-ant-x".into()), model: None },
            cheap: BackendEndpoint { base_url: None, api_key: None, model: None },
            local: LocalBackendEndpoint {
                enabled: true,
                base_url: "http://localhost:11434/v1".into(),
                model: "llama3.2".into(),
            },
        };
        let backends = Backends::new(&cfg).unwrap();
        assert!(backends.local.is_some());
    }

    // -----------------------------------------------------------------------
    // chat_completions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn chat_completions_returns_parsed_json_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion_body()))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let result = client.chat_completions(json!({"model": "test", "messages": []})).await;

        assert!(result.is_ok(), "expected Ok, got: {result:?}");
        assert!(result.unwrap().pointer("/choices/0/message/content").is_some());
    }

    #[tokio::test]
    async fn chat_completions_errors_on_non_2xx_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .chat_completions(json!({"model": "test", "messages": []}))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("429"), "expected HTTP 429 in error, got: {err}");
    }

    #[tokio::test]
    async fn chat_completions_errors_on_invalid_json_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json {{{{"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .chat_completions(json!({"model": "test", "messages": []}))
            .await
            .unwrap_err();

        let msg = err.to_string().to_lowercase();
        assert!(msg.contains("json") || msg.contains("parsing"), "expected json parse error, got: {err}");
    }

    // -----------------------------------------------------------------------
    // health_check
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_check_returns_ok_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "object": "list", "data": [] })))
            .mount(&server)
            .await;

        assert!(client_for(&server).health_check().await.is_ok());
    }

    #[tokio::test]
    async fn health_check_errors_on_non_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).health_check().await.unwrap_err();
        assert!(err.to_string().contains("503"), "expected HTTP 503 in error, got: {err}");
    }
}
