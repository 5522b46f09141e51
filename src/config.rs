//! Configuration for the cost gateway.
//!
//! Settings are resolved primarily from environment variables (so secrets
//! never need to touch disk), with an optional TOML file overlay for
//! structural configuration — backend URLs, tier budgets, classifier choice —
//! that operators would rather keep in version control than in the
//! environment. The TOML file is watched for changes and hot-reloaded; the
//! environment-sourced values (secrets, numeric overrides) are read once at
//! startup.
//!
//! Validated before the server opens any ports: invalid configs are rejected
//! with a clear error rather than silently falling back to defaults.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
///
/// Built by [`Config::load`]: environment variables supply defaults and
/// secrets, an optional TOML file at `path` overlays structural settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub budget: BudgetConfig,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub backends: BackendsConfig,
    pub kill_switch: KillSwitchConfig,
    pub embeddings: EmbeddingConfig,

    /// Bearer token every request (except `/health`) must present.
    /// Sourced from `GATEWAY_SECRET`; never written back out.
    #[serde(skip_serializing)]
    pub gateway_secret: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::host")]
    pub host: String,
    #[serde(default = "defaults::port")]
    pub port: u16,
    /// `development`, `staging`, or `production`. Gates the `GATEWAY_SECRET`
    /// default-value check in [`Config::validate`].
    #[serde(default = "defaults::env")]
    pub env: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// `json` or `pretty`.
    #[serde(default = "defaults::log_format")]
    pub log_format: String,
    /// Optional path to additionally write JSON logs to.
    #[serde(default)]
    pub log_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    #[serde(default = "defaults::budget_soft")]
    pub soft_limit: f64,
    #[serde(default = "defaults::budget_medium")]
    pub medium_limit: f64,
    #[serde(default = "defaults::budget_hard")]
    pub hard_limit: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "defaults::rpm")]
    pub requests_per_minute: u32,
    #[serde(default = "defaults::tpm")]
    pub tokens_per_minute: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Directory holding all persisted stores (`exact_cache.db`,
    /// `semantic_cache.db`, `bm25_index.db`, `budget.db`, `embeddings/`).
    #[serde(default = "defaults::cache_dir")]
    pub dir: String,
    #[serde(default = "defaults::semantic_threshold")]
    pub semantic_threshold: f32,
    #[serde(default = "defaults::exact_ttl_seconds")]
    pub exact_ttl_seconds: i64,
    #[serde(default = "defaults::exact_max_entries")]
    pub exact_max_entries: i64,
    #[serde(default = "defaults::semantic_max_entries")]
    pub semantic_max_entries: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    #[serde(default = "defaults::context_budget_cheap")]
    pub context_budget_cheap: usize,
    #[serde(default = "defaults::context_budget_premium")]
    pub context_budget_premium: usize,
    /// Which backend serves the classifier's remote fallback call:
    /// `"local"` or `"cheap"`.
    #[serde(default = "defaults::router_provider")]
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KillSwitchConfig {
    #[serde(default = "defaults::error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "defaults::throttle_delay_ms")]
    pub throttle_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    pub anthropic: BackendEndpoint,
    pub cheap: BackendEndpoint,
    pub local: LocalBackendEndpoint,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendEndpoint {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Embedding providers for the semantic cache and BM25 near-duplicate checks.
///
/// Voyage (Anthropic's embeddings partner) is tried first, OpenAI second; if
/// neither key is configured, [`crate::retrieval::EmbeddingService`] falls
/// back to a deterministic hash-based pseudo-embedding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(skip_serializing)]
    pub voyage_api_key: Option<String>,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    #[serde(default = "defaults::embedding_model")]
    pub model: String,
    #[serde(default = "defaults::embedding_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalBackendEndpoint {
    #[serde(default = "defaults::local_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::local_url")]
    pub base_url: String,
    #[serde(default = "defaults::local_model")]
    pub model: String,
}

impl Config {
    /// Load configuration: environment variables first, then an optional
    /// TOML file at `toml_path` overlaying structural fields (when present).
    pub fn load(toml_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_env();

        if let Some(path) = toml_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let overlay: TomlOverlay =
                    toml::from_str(&content).context("parsing config TOML")?;
                overlay.apply(&mut config);
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Build configuration purely from environment variables and defaults —
    /// used when no TOML overlay path is given.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("HOST", defaults::host()),
                port: env_parsed("PORT", defaults::port()),
                env: env_or("ENV", defaults::env()),
                log_level: env_or("LOG_LEVEL", defaults::log_level()),
                log_format: env_or("LOG_FORMAT", defaults::log_format()),
                log_file: std::env::var("LOG_FILE").ok().filter(|s| !s.is_empty()),
            },
            budget: BudgetConfig {
                soft_limit: env_parsed("DAILY_BUDGET_SOFT", defaults::budget_soft()),
                medium_limit: env_parsed("DAILY_BUDGET_MEDIUM", defaults::budget_medium()),
                hard_limit: env_parsed("DAILY_BUDGET_HARD", defaults::budget_hard()),
            },
            rate_limit: RateLimitConfig {
                requests_per_minute: env_parsed("RATE_LIMIT_RPM", defaults::rpm()),
                tokens_per_minute: env_parsed("RATE_LIMIT_TPM", defaults::tpm()),
            },
            cache: CacheConfig {
                dir: env_or("CACHE_DIR", defaults::cache_dir()),
                semantic_threshold: env_parsed("SEMANTIC_THRESHOLD", defaults::semantic_threshold()),
                exact_ttl_seconds: defaults::exact_ttl_seconds(),
                exact_max_entries: defaults::exact_max_entries(),
                semantic_max_entries: defaults::semantic_max_entries(),
            },
            router: RouterConfig {
                context_budget_cheap: env_parsed(
                    "CONTEXT_BUDGET_CHEAP",
                    defaults::context_budget_cheap(),
                ),
                context_budget_premium: env_parsed(
                    "CONTEXT_BUDGET_PREMIUM",
                    defaults::context_budget_premium(),
                ),
                provider: env_or("ROUTER_PROVIDER", defaults::router_provider()),
            },
            backends: BackendsConfig {
                anthropic: BackendEndpoint {
                    base_url: Some("https://api.anthropic.com".to_string()),
                    api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|s| !s.is_empty()),
                    model: Some("claude-sonnet-4-20250514".to_string()),
                },
                cheap: BackendEndpoint {
                    base_url: Some("https://api.groq.com/openai/v1".to_string()),
                    api_key: std::env::var("GROQ_API_KEY").ok().filter(|s| !s.is_empty()),
                    model: Some("llama-3.1-8b-instant".to_string()),
                },
                local: LocalBackendEndpoint {
                    enabled: env_parsed("LOCAL_LLM_ENABLED", defaults::local_enabled()),
                    base_url: env_or("LOCAL_LLM_URL", defaults::local_url()),
                    model: env_or("LOCAL_LLM_MODEL", defaults::local_model()),
                },
            },
            kill_switch: KillSwitchConfig {
                error_threshold: defaults::error_threshold(),
                throttle_delay_ms: defaults::throttle_delay_ms(),
            },
            embeddings: EmbeddingConfig {
                voyage_api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|s| !s.is_empty()),
                openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty()),
                model: defaults::embedding_model(),
                dimension: defaults::embedding_dimension(),
            },
            gateway_secret: env_or("GATEWAY_SECRET", "change-me".to_string()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.budget.soft_limit < self.budget.medium_limit
                && self.budget.medium_limit < self.budget.hard_limit,
            "budget limits must satisfy soft < medium < hard (got soft={}, medium={}, hard={})",
            self.budget.soft_limit,
            self.budget.medium_limit,
            self.budget.hard_limit
        );

        if self.server.env == "production" {
            anyhow::ensure!(
                self.gateway_secret != "change-me",
                "GATEWAY_SECRET must be set to a non-default value in production"
            );
        }

        anyhow::ensure!(
            self.cache.semantic_threshold > 0.0 && self.cache.semantic_threshold <= 1.0,
            "semantic_threshold must be in (0, 1], got {}",
            self.cache.semantic_threshold
        );

        Ok(())
    }

    /// Redacted snapshot suitable for an admin-facing response: secrets are
    /// shown only as present/absent, never their value.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "server": self.server,
            "budget": self.budget,
            "rate_limit": self.rate_limit,
            "cache": self.cache,
            "router": self.router,
            "kill_switch": self.kill_switch,
            "backends": {
                "anthropic": { "configured": self.backends.anthropic.api_key.is_some() },
                "cheap": { "configured": self.backends.cheap.api_key.is_some() },
                "local": { "enabled": self.backends.local.enabled, "base_url": self.backends.local.base_url },
            },
            "embeddings": {
                "voyage_configured": self.embeddings.voyage_api_key.is_some(),
                "openai_configured": self.embeddings.openai_api_key.is_some(),
                "model": self.embeddings.model,
                "dimension": self.embeddings.dimension,
            },
            "gateway_secret": if self.gateway_secret == "change-me" { "(default)" } else { "***" },
        })
    }
}

/// Structural fields an operator may override via a TOML file. Every field is
/// optional; anything absent keeps the environment-derived value.
#[derive(Debug, Deserialize)]
struct TomlOverlay {
    server: Option<PartialServer>,
    budget: Option<BudgetConfig>,
    rate_limit: Option<RateLimitConfig>,
    cache: Option<PartialCache>,
    router: Option<RouterConfig>,
    backends: Option<PartialBackends>,
    kill_switch: Option<KillSwitchConfig>,
}

#[derive(Debug, Deserialize)]
struct PartialServer {
    host: Option<String>,
    port: Option<u16>,
    log_level: Option<String>,
    log_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartialCache {
    dir: Option<String>,
    semantic_threshold: Option<f32>,
    exact_ttl_seconds: Option<i64>,
    exact_max_entries: Option<i64>,
    semantic_max_entries: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PartialBackends {
    anthropic: Option<PartialEndpoint>,
    cheap: Option<PartialEndpoint>,
    local: Option<PartialLocal>,
}

#[derive(Debug, Deserialize)]
struct PartialEndpoint {
    base_url: Option<String>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PartialLocal {
    enabled: Option<bool>,
    base_url: Option<String>,
    model: Option<String>,
}

impl TomlOverlay {
    fn apply(self, config: &mut Config) {
        if let Some(s) = self.server {
            if let Some(v) = s.host { config.server.host = v; }
            if let Some(v) = s.port { config.server.port = v; }
            if let Some(v) = s.log_level { config.server.log_level = v; }
            if let Some(v) = s.log_format { config.server.log_format = v; }
        }
        if let Some(b) = self.budget { config.budget = b; }
        if let Some(r) = self.rate_limit { config.rate_limit = r; }
        if let Some(c) = self.cache {
            if let Some(v) = c.dir { config.cache.dir = v; }
            if let Some(v) = c.semantic_threshold { config.cache.semantic_threshold = v; }
            if let Some(v) = c.exact_ttl_seconds { config.cache.exact_ttl_seconds = v; }
            if let Some(v) = c.exact_max_entries { config.cache.exact_max_entries = v; }
            if let Some(v) = c.semantic_max_entries { config.cache.semantic_max_entries = v; }
        }
        if let Some(r) = self.router { config.router = r; }
        if let Some(b) = self.backends {
            if let Some(a) = b.anthropic {
                if let Some(v) = a.base_url { config.backends.anthropic.base_url = Some(v); }
                if let Some(v) = a.model { config.backends.anthropic.model = Some(v); }
            }
            if let Some(c) = b.cheap {
                if let Some(v) = c.base_url { config.backends.cheap.base_url = Some(v); }
                if let Some(v) = c.model { config.backends.cheap.model = Some(v); }
            }
            if let Some(l) = b.local {
                if let Some(v) = l.enabled { config.backends.local.enabled = v; }
                if let Some(v) = l.base_url { config.backends.local.base_url = v; }
                if let Some(v) = l.model { config.backends.local.model = v; }
            }
        }
        if let Some(k) = self.kill_switch { config.kill_switch = k; }
    }
}

fn env_or(var: &str, default: String) -> String {
    std::env::var(var).ok().filter(|s| !s.is_empty()).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

mod defaults {
    pub fn host() -> String { "0.0.0.0".to_string() }
    pub fn port() -> u16 { 8000 }
    pub fn env() -> String { "production".to_string() }
    pub fn log_level() -> String { "info".to_string() }
    pub fn log_format() -> String { "json".to_string() }
    pub fn budget_soft() -> f64 { 5.0 }
    pub fn budget_medium() -> f64 { 15.0 }
    pub fn budget_hard() -> f64 { 50.0 }
    pub fn rpm() -> u32 { 60 }
    pub fn tpm() -> u64 { 100_000 }
    pub fn cache_dir() -> String { "/opt/cost-gateway/data".to_string() }
    pub fn semantic_threshold() -> f32 { 0.92 }
    pub fn exact_ttl_seconds() -> i64 { 86_400 }
    pub fn exact_max_entries() -> i64 { 10_000 }
    pub fn semantic_max_entries() -> i64 { 5_000 }
    pub fn context_budget_cheap() -> usize { 4_000 }
    pub fn context_budget_premium() -> usize { 16_000 }
    pub fn router_provider() -> String { "cheap".to_string() }
    pub fn error_threshold() -> f64 { 0.5 }
    pub fn throttle_delay_ms() -> u64 { 2_000 }
    pub fn embedding_model() -> String { "voyage-code-2".to_string() }
    pub fn embedding_dimension() -> usize { 1024 }
    pub fn local_enabled() -> bool { false }
    pub fn local_url() -> String { "http://localhost:11434/v1".to_string() }
    pub fn local_model() -> String { "llama3.2:latest".to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::from_env()
    }

    #[test]
    fn defaults_validate_cleanly_outside_production() {
        let mut config = base_config();
        config.server.env = "development".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn production_rejects_default_secret() {
        let mut config = base_config();
        config.server.env = "production".to_string();
        config.gateway_secret = "change-me".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn production_accepts_custom_secret() {
        let mut config = base_config();
        config.server.env = "production".to_string();
        config.gateway_secret = "a-real-secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_non_increasing_budget_limits() {
        let mut config = base_config();
        config.server.env = "development".to_string();
        config.budget.medium_limit = config.budget.soft_limit;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_semantic_threshold_out_of_range() {
        let mut config = base_config();
        config.server.env = "development".to_string();
        config.cache.semantic_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_overlay_applies_over_env_defaults() {
        let dir = std::env::temp_dir().join(format!("cost-gateway-test-{}", uuid::Uuid::new_v4()));
        std::fs::write(
            &dir,
            r#"
            [server]
            port = 9000

            [budget]
            soft_limit = 1.0
            medium_limit = 2.0
            hard_limit = 3.0
            "#,
        )
        .unwrap();

        let config = Config::load(Some(&dir)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.budget.hard_limit, 3.0);

        std::fs::remove_file(&dir).ok();
    }

    #[test]
    fn redacted_never_exposes_gateway_secret_value() {
        let mut config = base_config();
        config.gateway_secret = "super-secret-value".to_string();
        let json = config.redacted().to_string();
        assert!(!json.contains("super-secret-value"));
    }

    #[test]
    fn parse_example_config_overlay() {
        let content = include_str!("../config.example.toml");
        let overlay: TomlOverlay = toml::from_str(content).expect("example overlay should parse");
        let mut config = Config::from_env();
        config.server.env = "development".to_string();
        overlay.apply(&mut config);
        config.validate().expect("example config should produce a valid config");
    }
}
