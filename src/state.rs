//! Application state: every shared component the HTTP handlers and the
//! pipeline orchestrator need, wired up once at startup and handed around as
//! `Arc<AppState>`.

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;

use crate::backends::Backends;
use crate::cache::{ExactCache, SemanticCache};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::retrieval::{Bm25Index, EmbeddingService};
use crate::router::{Classifier, TierRouter};
use crate::security::budget_guard::BudgetGuard;
use crate::security::kill_switch::KillSwitch;
use crate::security::policy_gate::PolicyGate;
use crate::security::rate_limiter::RateLimiter;

pub struct AppState {
    pub config: Arc<Config>,
    pub policy_gate: PolicyGate,
    pub rate_limiter: RateLimiter,
    pub budget_guard: BudgetGuard,
    pub kill_switch: KillSwitch,
    pub exact_cache: ExactCache,
    pub semantic_cache: SemanticCache,
    pub bm25: Arc<Bm25Index>,
    pub embeddings: Arc<EmbeddingService>,
    pub tier_router: TierRouter,
    pub backends: Backends,
    pub metrics: Metrics,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub async fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.cache.dir).await?;
        let data_dir = Path::new(&config.cache.dir);

        let exact_pool = open_pool(&data_dir.join("exact_cache.db")).await?;
        let semantic_pool = open_pool(&data_dir.join("semantic_cache.db")).await?;
        let bm25_pool = open_pool(&data_dir.join("bm25_index.db")).await?;
        let budget_pool = open_pool(&data_dir.join("budget.db")).await?;

        let embeddings = Arc::new(EmbeddingService::new(
            data_dir.join("embeddings"),
            config.embeddings.dimension,
            config.embeddings.voyage_api_key.clone(),
            config.embeddings.openai_api_key.clone(),
            &config.embeddings.model,
        ));

        let exact_cache = ExactCache::new(exact_pool, config.cache.exact_ttl_seconds, config.cache.exact_max_entries).await?;
        let semantic_cache = SemanticCache::new(
            semantic_pool,
            embeddings.clone(),
            config.cache.semantic_threshold as f64,
            config.cache.semantic_max_entries,
        )
        .await?;
        let bm25 = Arc::new(Bm25Index::new(bm25_pool).await?);
        let budget_guard =
            BudgetGuard::new(budget_pool, config.budget.soft_limit, config.budget.medium_limit, config.budget.hard_limit)
                .await?;

        let kill_switch = KillSwitch::new(config.kill_switch.error_threshold, config.kill_switch.throttle_delay_ms);
        let policy_gate = PolicyGate::new();
        let rate_limiter = RateLimiter::new(config.rate_limit.requests_per_minute, config.rate_limit.tokens_per_minute);

        // The classifier's remote fallback rides whichever backend `router.provider`
        // names — "local" or "cheap" — falling back to the cheap tier's endpoint
        // when local is selected but not enabled.
        let (classifier_url, classifier_key, classifier_model) = if config.router.provider == "local" && config.backends.local.enabled {
            (config.backends.local.base_url.clone(), None, config.backends.local.model.clone())
        } else {
            (
                config.backends.cheap.base_url.clone().unwrap_or_else(|| "https://api.groq.com/openai/v1".to_string()),
                config.backends.cheap.api_key.clone(),
                config.backends.cheap.model.clone().unwrap_or_else(|| "llama-3.1-8b-instant".to_string()),
            )
        };
        let classifier = Classifier::new(classifier_url, classifier_key, classifier_model);
        let tier_router =
            TierRouter::new(classifier, bm25.clone(), config.router.context_budget_cheap, config.router.context_budget_premium);

        let backends = Backends::new(&config.backends)?;

        Ok(Self {
            config,
            policy_gate,
            rate_limiter,
            budget_guard,
            kill_switch,
            exact_cache,
            semantic_cache,
            bm25,
            embeddings,
            tier_router,
            backends,
            metrics: Metrics::new(),
            started_at: std::time::Instant::now(),
        })
    }
}

async fn open_pool(path: &Path) -> anyhow::Result<sqlx::SqlitePool> {
    let url = format!("sqlite://{}?mode=rwc", path.display());
    Ok(SqlitePoolOptions::new().max_connections(1).connect(&url).await?)
}
