//! Daily cost budget with three progressive levels: soft (warn), medium
//! (premium throttled), hard (everything blocked). The day boundary is UTC
//! midnight; spending is persisted in SQLite so it survives a restart.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Progressive budget level for the current day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Normal,
    Soft,
    Medium,
    Hard,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Normal => "normal",
            Level::Soft => "soft",
            Level::Medium => "medium",
            Level::Hard => "hard",
        }
    }
}

pub struct BudgetDecision {
    pub allowed: bool,
    pub level: Level,
    pub reason: String,
    pub daily_spent: f64,
    pub limit: f64,
    pub suggest_tier: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct BudgetStatus {
    pub date: String,
    pub daily_spent: f64,
    pub request_count: i64,
    pub cheap_cost: f64,
    pub premium_cost: f64,
    pub cache_hits: i64,
    pub level: String,
    pub soft_limit: f64,
    pub medium_limit: f64,
    pub hard_limit: f64,
    pub remaining: f64,
    pub reset_at: String,
}

#[derive(Debug, Serialize)]
pub struct DailyHistoryEntry {
    pub date: String,
    pub total_cost: f64,
    pub request_count: i64,
    pub cheap_cost: f64,
    pub premium_cost: f64,
    pub cache_hits: i64,
}

/// Daily budget ledger backed by a SQLite pool, with adjustable limits.
pub struct BudgetGuard {
    pool: SqlitePool,
    soft_limit: std::sync::atomic::AtomicU64,
    medium_limit: std::sync::atomic::AtomicU64,
    hard_limit: std::sync::atomic::AtomicU64,
}

fn to_bits(v: f64) -> u64 {
    v.to_bits()
}
fn from_bits(v: u64) -> f64 {
    f64::from_bits(v)
}

impl BudgetGuard {
    pub async fn new(pool: SqlitePool, soft_limit: f64, medium_limit: f64, hard_limit: f64) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS spending (
                date TEXT PRIMARY KEY,
                total_cost REAL NOT NULL DEFAULT 0,
                request_count INTEGER NOT NULL DEFAULT 0,
                cheap_cost REAL NOT NULL DEFAULT 0,
                premium_cost REAL NOT NULL DEFAULT 0,
                cache_hits INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                date TEXT NOT NULL,
                cost REAL NOT NULL,
                tier TEXT,
                model TEXT,
                tokens_in INTEGER,
                tokens_out INTEGER
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            soft_limit: std::sync::atomic::AtomicU64::new(to_bits(soft_limit)),
            medium_limit: std::sync::atomic::AtomicU64::new(to_bits(medium_limit)),
            hard_limit: std::sync::atomic::AtomicU64::new(to_bits(hard_limit)),
        })
    }

    fn soft(&self) -> f64 {
        from_bits(self.soft_limit.load(std::sync::atomic::Ordering::Relaxed))
    }
    fn medium(&self) -> f64 {
        from_bits(self.medium_limit.load(std::sync::atomic::Ordering::Relaxed))
    }
    fn hard(&self) -> f64 {
        from_bits(self.hard_limit.load(std::sync::atomic::Ordering::Relaxed))
    }

    fn today() -> String {
        Utc::now().date_naive().to_string()
    }

    async fn ensure_today_record(&self) -> anyhow::Result<()> {
        sqlx::query("INSERT OR IGNORE INTO spending (date) VALUES (?)")
            .bind(Self::today())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_daily_spent(&self) -> anyhow::Result<f64> {
        self.ensure_today_record().await?;
        let row = sqlx::query("SELECT total_cost FROM spending WHERE date = ?")
            .bind(Self::today())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<f64, _>("total_cost")).unwrap_or(0.0))
    }

    /// Check whether a request with `estimated_cost` may proceed under `tier`
    /// ("cheap" or "premium"). Uses strict `>` against the projected total —
    /// a request that would land exactly on a limit still passes.
    pub async fn check(&self, estimated_cost: f64, tier: &str) -> anyhow::Result<BudgetDecision> {
        let daily_spent = self.get_daily_spent().await?;
        let projected = daily_spent + estimated_cost;

        if projected > self.hard() {
            return Ok(BudgetDecision {
                allowed: false,
                level: Level::Hard,
                reason: format!("Daily budget exceeded (${daily_spent:.2}/${:.2})", self.hard()),
                daily_spent,
                limit: self.hard(),
                suggest_tier: None,
            });
        }

        if projected > self.medium() && tier == "premium" {
            return Ok(BudgetDecision {
                allowed: false,
                level: Level::Medium,
                reason: format!("Premium blocked (budget ${daily_spent:.2}/${:.2})", self.medium()),
                daily_spent,
                limit: self.medium(),
                suggest_tier: Some("cheap"),
            });
        }

        if projected > self.soft() {
            return Ok(BudgetDecision {
                allowed: true,
                level: Level::Soft,
                reason: format!("Approaching limit (${daily_spent:.2}/${:.2})", self.soft()),
                daily_spent,
                limit: self.soft(),
                suggest_tier: None,
            });
        }

        Ok(BudgetDecision {
            allowed: true,
            level: Level::Normal,
            reason: "Within budget".to_string(),
            daily_spent,
            limit: self.hard(),
            suggest_tier: None,
        })
    }

    /// Persist an actual charge. `model` is optional; `tokens_in`/`tokens_out`
    /// are recorded for the transaction log but not aggregated daily.
    pub async fn record_spend(
        &self,
        cost: f64,
        tier: &str,
        model: Option<&str>,
        tokens_in: i64,
        tokens_out: i64,
    ) -> anyhow::Result<()> {
        self.ensure_today_record().await?;
        let today = Self::today();
        let now = Utc::now().to_rfc3339();

        if tier == "cheap" {
            sqlx::query(
                "UPDATE spending SET total_cost = total_cost + ?, request_count = request_count + 1, cheap_cost = cheap_cost + ? WHERE date = ?",
            )
            .bind(cost)
            .bind(cost)
            .bind(&today)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE spending SET total_cost = total_cost + ?, request_count = request_count + 1, premium_cost = premium_cost + ? WHERE date = ?",
            )
            .bind(cost)
            .bind(cost)
            .bind(&today)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            "INSERT INTO transactions (timestamp, date, cost, tier, model, tokens_in, tokens_out) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(now)
        .bind(today)
        .bind(cost)
        .bind(tier)
        .bind(model)
        .bind(tokens_in)
        .bind(tokens_out)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_cache_hit(&self) -> anyhow::Result<()> {
        self.ensure_today_record().await?;
        sqlx::query("UPDATE spending SET cache_hits = cache_hits + 1 WHERE date = ?")
            .bind(Self::today())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current status. Unlike [`Self::check`], level comparisons here are
    /// non-strict (`>=`): a spend that lands exactly on a limit already
    /// counts as having reached it.
    pub async fn get_status(&self) -> anyhow::Result<BudgetStatus> {
        self.ensure_today_record().await?;
        let today = Self::today();
        let row = sqlx::query(
            "SELECT total_cost, request_count, cheap_cost, premium_cost, cache_hits FROM spending WHERE date = ?",
        )
        .bind(&today)
        .fetch_optional(&self.pool)
        .await?;

        let (daily_spent, request_count, cheap_cost, premium_cost, cache_hits) = match row {
            Some(r) => (
                r.get::<f64, _>("total_cost"),
                r.get::<i64, _>("request_count"),
                r.get::<f64, _>("cheap_cost"),
                r.get::<f64, _>("premium_cost"),
                r.get::<i64, _>("cache_hits"),
            ),
            None => (0.0, 0, 0.0, 0.0, 0),
        };

        let level = if daily_spent >= self.hard() {
            Level::Hard
        } else if daily_spent >= self.medium() {
            Level::Medium
        } else if daily_spent >= self.soft() {
            Level::Soft
        } else {
            Level::Normal
        };

        Ok(BudgetStatus {
            date: today.clone(),
            daily_spent,
            request_count,
            cheap_cost,
            premium_cost,
            cache_hits,
            level: level.as_str().to_string(),
            soft_limit: self.soft(),
            medium_limit: self.medium(),
            hard_limit: self.hard(),
            remaining: self.hard() - daily_spent,
            reset_at: format!("{today}T24:00:00Z"),
        })
    }

    pub async fn get_history(&self, days: i64) -> anyhow::Result<Vec<DailyHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT date, total_cost, request_count, cheap_cost, premium_cost, cache_hits FROM spending ORDER BY date DESC LIMIT ?",
        )
        .bind(days)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| DailyHistoryEntry {
                date: r.get("date"),
                total_cost: r.get("total_cost"),
                request_count: r.get("request_count"),
                cheap_cost: r.get("cheap_cost"),
                premium_cost: r.get("premium_cost"),
                cache_hits: r.get("cache_hits"),
            })
            .collect())
    }

    pub fn adjust_limits(&self, soft: Option<f64>, medium: Option<f64>, hard: Option<f64>) {
        if let Some(v) = soft {
            self.soft_limit.store(to_bits(v), std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(v) = medium {
            self.medium_limit.store(to_bits(v), std::sync::atomic::Ordering::Relaxed);
        }
        if let Some(v) = hard {
            self.hard_limit.store(to_bits(v), std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn guard(soft: f64, medium: f64, hard: f64) -> BudgetGuard {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        BudgetGuard::new(pool, soft, medium, hard).await.unwrap()
    }

    #[tokio::test]
    async fn allows_within_budget() {
        let g = guard(5.0, 15.0, 50.0).await;
        let decision = g.check(1.0, "premium").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.level, Level::Normal);
    }

    #[tokio::test]
    async fn warns_past_soft_limit_but_allows() {
        let g = guard(1.0, 15.0, 50.0).await;
        let decision = g.check(2.0, "premium").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.level, Level::Soft);
    }

    #[tokio::test]
    async fn blocks_premium_past_medium_but_suggests_cheap() {
        let g = guard(1.0, 5.0, 50.0).await;
        g.record_spend(5.5, "premium", Some("claude"), 10, 10).await.unwrap();
        let decision = g.check(0.1, "premium").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.level, Level::Medium);
        assert_eq!(decision.suggest_tier, Some("cheap"));
    }

    #[tokio::test]
    async fn cheap_tier_still_allowed_past_medium_limit() {
        let g = guard(1.0, 5.0, 50.0).await;
        g.record_spend(5.5, "premium", Some("claude"), 10, 10).await.unwrap();
        let decision = g.check(0.1, "cheap").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn blocks_everything_past_hard_limit() {
        let g = guard(1.0, 5.0, 10.0).await;
        g.record_spend(9.9, "premium", None, 0, 0).await.unwrap();
        let decision = g.check(0.2, "cheap").await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.level, Level::Hard);
    }

    #[tokio::test]
    async fn record_spend_accumulates_daily_total() {
        let g = guard(5.0, 15.0, 50.0).await;
        g.record_spend(1.0, "cheap", Some("groq"), 100, 50).await.unwrap();
        g.record_spend(2.0, "premium", Some("claude"), 200, 100).await.unwrap();
        let status = g.get_status().await.unwrap();
        assert_eq!(status.daily_spent, 3.0);
        assert_eq!(status.request_count, 2);
        assert_eq!(status.cheap_cost, 1.0);
        assert_eq!(status.premium_cost, 2.0);
    }

    #[tokio::test]
    async fn record_cache_hit_increments_counter_without_cost() {
        let g = guard(5.0, 15.0, 50.0).await;
        g.record_cache_hit().await.unwrap();
        g.record_cache_hit().await.unwrap();
        let status = g.get_status().await.unwrap();
        assert_eq!(status.cache_hits, 2);
        assert_eq!(status.daily_spent, 0.0);
    }

    #[tokio::test]
    async fn get_status_uses_non_strict_comparison_at_exact_limit() {
        let g = guard(1.0, 5.0, 10.0).await;
        g.record_spend(5.0, "premium", None, 0, 0).await.unwrap();
        let status = g.get_status().await.unwrap();
        assert_eq!(status.level, "medium");
    }

    #[tokio::test]
    async fn adjust_limits_takes_effect_immediately() {
        let g = guard(5.0, 15.0, 50.0).await;
        g.adjust_limits(Some(0.5), None, None);
        let decision = g.check(1.0, "premium").await.unwrap();
        assert_eq!(decision.level, Level::Soft);
    }

    #[tokio::test]
    async fn get_history_returns_most_recent_first() {
        let g = guard(5.0, 15.0, 50.0).await;
        g.record_spend(1.0, "cheap", None, 0, 0).await.unwrap();
        let history = g.get_history(7).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_cost, 1.0);
    }
}
