//! SHA-256 exact-match response cache.
//!
//! The cache key is computed from the request's messages (reduced to
//! `{role, content}` pairs) plus any routing context, sorted deterministically
//! so the same logical request always hashes to the same key regardless of
//! field ordering. A TTL governs expiry; an idempotency key gives clients a
//! second, caller-chosen lookup path independent of exact message content.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const DEFAULT_TTL_SECONDS: i64 = 86_400;

#[derive(Debug, Serialize)]
pub struct ExactCacheStats {
    pub total_entries: i64,
    pub active_entries: i64,
    pub expired_entries: i64,
    pub total_hits: i64,
}

/// SHA-256 keyed exact-match cache, shared across requests via `Arc`.
pub struct ExactCache {
    pool: SqlitePool,
    default_ttl_seconds: i64,
    max_entries: i64,
}

impl ExactCache {
    pub async fn new(pool: SqlitePool, default_ttl_seconds: i64, max_entries: i64) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache (
                cache_key TEXT PRIMARY KEY,
                response TEXT NOT NULL,
                usage_json TEXT,
                idempotency_key TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_idempotency ON cache(idempotency_key) WHERE idempotency_key IS NOT NULL",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_expires ON cache(expires_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, default_ttl_seconds, max_entries })
    }

    /// Compute the cache key from messages (reduced to `{role, content}`) and
    /// an optional, key-sorted context object.
    pub fn compute_key(messages: &[Value], context: Option<&Value>) -> String {
        let mut parts = Vec::with_capacity(messages.len() + 1);

        for msg in messages {
            let reduced = serde_json::json!({
                "role": msg.get("role").cloned().unwrap_or(Value::Null),
                "content": msg.get("content").cloned().unwrap_or(Value::Null),
            });
            parts.push(reduced.to_string());
        }

        if let Some(ctx) = context {
            if let Some(map) = ctx.as_object() {
                // serde_json::Map is BTreeMap-backed by default, so this
                // already serializes with keys in sorted order.
                parts.push(Value::Object(map.clone()).to_string());
            }
        }

        let combined = parts.join("|");
        hex::encode(Sha256::digest(combined.as_bytes()))
    }

    /// Look up by cache key. Returns `None` if absent or expired; bumps
    /// `hit_count`/`last_hit_at` on a hit.
    pub async fn get(&self, cache_key: &str) -> anyhow::Result<Option<Value>> {
        let now = Utc::now().timestamp();
        let row = sqlx::query("SELECT response FROM cache WHERE cache_key = ? AND expires_at > ?")
            .bind(cache_key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else { return Ok(None) };
        let response: String = row.get("response");

        sqlx::query("UPDATE cache SET hit_count = hit_count + 1, last_hit_at = ? WHERE cache_key = ?")
            .bind(now)
            .bind(cache_key)
            .execute(&self.pool)
            .await?;

        Ok(Some(serde_json::from_str(&response)?))
    }

    /// Look up by idempotency key. When multiple entries share one (a
    /// possible but unusual situation), the most recently created wins.
    /// `rowid` breaks ties within the same second, since `created_at` is
    /// only second-granularity.
    pub async fn get_by_idempotency_key(&self, idempotency_key: &str) -> anyhow::Result<Option<Value>> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(
            "SELECT response FROM cache WHERE idempotency_key = ? AND expires_at > ?
             ORDER BY created_at DESC, rowid DESC LIMIT 1",
        )
        .bind(idempotency_key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let response: String = row.get("response");
                Ok(Some(serde_json::from_str(&response)?))
            }
            None => Ok(None),
        }
    }

    /// Store a response under `cache_key`. Overwrites any existing entry and
    /// resets its hit count, per `INSERT OR REPLACE` semantics.
    pub async fn set(
        &self,
        cache_key: &str,
        response: &Value,
        usage: Option<&Value>,
        ttl_seconds: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();
        let expires_at = now + ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let response_json = response.to_string();
        let usage_json = usage.map(|u| u.to_string());

        sqlx::query(
            "INSERT OR REPLACE INTO cache
             (cache_key, response, usage_json, idempotency_key, created_at, expires_at, hit_count, last_hit_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, NULL)",
        )
        .bind(cache_key)
        .bind(response_json)
        .bind(usage_json)
        .bind(idempotency_key)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        self.maybe_cleanup().await?;
        Ok(())
    }

    pub async fn invalidate(&self, cache_key: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM cache WHERE cache_key = ?")
            .bind(cache_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete expired rows, then trim to `max_entries` (oldest-unhit first)
    /// if still over budget.
    async fn maybe_cleanup(&self) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();
        sqlx::query("DELETE FROM cache WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;

        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM cache")
            .fetch_one(&self.pool)
            .await?
            .get("c");

        if count > self.max_entries {
            let to_remove = count - self.max_entries + 100;
            sqlx::query(
                "DELETE FROM cache WHERE cache_key IN (
                    SELECT cache_key FROM cache
                    ORDER BY last_hit_at IS NOT NULL, last_hit_at ASC, created_at ASC
                    LIMIT ?
                 )",
            )
            .bind(to_remove)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_stats(&self) -> anyhow::Result<ExactCacheStats> {
        let now = Utc::now().timestamp();
        let total: i64 = sqlx::query("SELECT COUNT(*) as c FROM cache").fetch_one(&self.pool).await?.get("c");
        let active: i64 = sqlx::query("SELECT COUNT(*) as c FROM cache WHERE expires_at > ?")
            .bind(now)
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let total_hits: Option<i64> =
            sqlx::query("SELECT SUM(hit_count) as s FROM cache").fetch_one(&self.pool).await?.get("s");

        Ok(ExactCacheStats {
            total_entries: total,
            active_entries: active,
            expired_entries: total - active,
            total_hits: total_hits.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn cache(max_entries: i64) -> ExactCache {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        ExactCache::new(pool, DEFAULT_TTL_SECONDS, max_entries).await.unwrap()
    }

    #[test]
    fn compute_key_is_stable_regardless_of_field_order_in_context() {
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let ctx_a = json!({"a": 1, "b": 2});
        let ctx_b = json!({"b": 2, "a": 1});
        assert_eq!(
            ExactCache::compute_key(&messages, Some(&ctx_a)),
            ExactCache::compute_key(&messages, Some(&ctx_b))
        );
    }

    #[test]
    fn compute_key_ignores_extraneous_message_fields() {
        let a = vec![json!({"role": "user", "content": "hi", "name": "whatever"})];
        let b = vec![json!({"role": "user", "content": "hi"})];
        assert_eq!(ExactCache::compute_key(&a, None), ExactCache::compute_key(&b, None));
    }

    #[test]
    fn compute_key_differs_for_different_content() {
        let a = vec![json!({"role": "user", "content": "hi"})];
        let b = vec![json!({"role": "user", "content": "bye"})];
        assert_ne!(ExactCache::compute_key(&a, None), ExactCache::compute_key(&b, None));
    }

    #[tokio::test]
    async fn set_then_get_round_trips_response() {
        let c = cache(100).await;
        let response = json!({"text": "hello"});
        c.set("k1", &response, None, None, None).await.unwrap();
        let got = c.get("k1").await.unwrap();
        assert_eq!(got, Some(response));
    }

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let c = cache(100).await;
        assert!(c.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_returns_none_once_expired() {
        let c = cache(100).await;
        c.set("k1", &json!({"text": "hi"}), None, Some(-1), None).await.unwrap();
        assert!(c.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_by_idempotency_key_returns_newest_when_duplicated() {
        let c = cache(100).await;
        c.set("k1", &json!({"v": 1}), None, None, Some("idem")).await.unwrap();
        c.set("k2", &json!({"v": 2}), None, None, Some("idem")).await.unwrap();

        let got = c.get_by_idempotency_key("idem").await.unwrap();
        assert_eq!(got, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let c = cache(100).await;
        c.set("k1", &json!({"v": 1}), None, None, None).await.unwrap();
        c.invalidate("k1").await.unwrap();
        assert!(c.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_report_total_active_and_hits() {
        let c = cache(100).await;
        c.set("k1", &json!({"v": 1}), None, None, None).await.unwrap();
        c.get("k1").await.unwrap();
        c.get("k1").await.unwrap();

        let stats = c.get_stats().await.unwrap();
        assert_eq!(stats.total_entries, 1);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.total_hits, 2);
    }

    #[tokio::test]
    async fn overflow_past_max_entries_triggers_eviction() {
        let c = cache(2).await;
        for i in 0..5 {
            c.set(&format!("k{i}"), &json!({"v": i}), None, None, None).await.unwrap();
        }
        let stats = c.get_stats().await.unwrap();
        assert!(stats.total_entries < 5);
    }
}
