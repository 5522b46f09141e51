//! Cosine-similarity semantic cache: matches queries that mean the same
//! thing even when the wording differs. Falls back from (and complements)
//! [`super::exact_cache::ExactCache`] in the pipeline's cache-lookup stage.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::retrieval::{EmbeddingService, Vector};

const CANDIDATE_LIMIT: i64 = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct SemanticMatch {
    pub id: i64,
    pub query: String,
    pub response: String,
    pub risk_score: f64,
    pub similarity: f32,
}

#[derive(Debug, Serialize)]
pub struct SemanticCacheStats {
    pub total_entries: i64,
    pub total_hits: i64,
    pub avg_risk_score: f64,
    pub similarity_threshold: f64,
}

/// Embedding-backed near-duplicate cache, shared across requests via `Arc`.
pub struct SemanticCache {
    pool: SqlitePool,
    embeddings: Arc<EmbeddingService>,
    similarity_threshold: f64,
    max_entries: i64,
}

impl SemanticCache {
    pub async fn new(
        pool: SqlitePool,
        embeddings: Arc<EmbeddingService>,
        similarity_threshold: f64,
        max_entries: i64,
    ) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS semantic_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                query TEXT NOT NULL,
                query_hash TEXT NOT NULL,
                embedding BLOB NOT NULL,
                response TEXT NOT NULL,
                context_json TEXT,
                risk_score REAL NOT NULL DEFAULT 0.5,
                created_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at INTEGER,
                verified_count INTEGER NOT NULL DEFAULT 0,
                invalid_count INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_query_hash ON semantic_cache(query_hash)")
            .execute(&pool)
            .await?;

        Ok(Self { pool, embeddings, similarity_threshold, max_entries })
    }

    fn query_hash(query: &str) -> String {
        hex::encode(Sha256::digest(query.as_bytes()))
    }

    /// Jaccard similarity of key sets, blended 50/50 with the fraction of
    /// shared keys whose values also match.
    fn context_bonus(a: Option<&Value>, b: Option<&Value>) -> f64 {
        let (Some(a), Some(b)) = (a.and_then(|v| v.as_object()), b.and_then(|v| v.as_object())) else {
            return 0.0;
        };
        if a.is_empty() && b.is_empty() {
            return 1.0;
        }

        let keys_a: HashSet<&String> = a.keys().collect();
        let keys_b: HashSet<&String> = b.keys().collect();
        let intersection = keys_a.intersection(&keys_b).count();
        let union = keys_a.union(&keys_b).count();
        if union == 0 {
            return 0.0;
        }
        let jaccard = intersection as f64 / union as f64;

        let shared: Vec<&&String> = keys_a.intersection(&keys_b).collect();
        let value_match_ratio = if shared.is_empty() {
            0.0
        } else {
            let matches = shared.iter().filter(|k| a.get(***k) == b.get(***k)).count();
            matches as f64 / shared.len() as f64
        };

        0.5 * jaccard + 0.5 * value_match_ratio
    }

    /// Find the best semantically similar cached response for `query`, if any
    /// candidate clears `similarity_threshold` after the context and trust
    /// adjustments. Bumps `hit_count`/`last_hit_at` on a match.
    pub async fn search(&self, query: &str, context: Option<&Value>) -> anyhow::Result<Option<SemanticMatch>> {
        let query_embedding = self.embeddings.embed(query).await;

        let rows = sqlx::query(
            "SELECT id, query, embedding, response, context_json, risk_score, verified_count, invalid_count
             FROM semantic_cache ORDER BY created_at DESC LIMIT ?",
        )
        .bind(CANDIDATE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        let mut best: Option<(i64, String, String, f64, f32)> = None;

        for row in &rows {
            let embedding_bytes: Vec<u8> = row.get("embedding");
            let candidate = Vector::from_bytes(&embedding_bytes);
            let mut similarity = query_embedding.cosine_similarity(&candidate);

            let context_json: Option<String> = row.get("context_json");
            let candidate_context: Option<Value> =
                context_json.and_then(|s| serde_json::from_str(&s).ok());
            if context.is_some() && candidate_context.is_some() {
                let bonus = Self::context_bonus(context, candidate_context.as_ref());
                similarity = similarity * 0.8 + (bonus as f32) * 0.2;
            }

            let verified: i64 = row.get("verified_count");
            let invalid: i64 = row.get("invalid_count");
            if verified + invalid > 0 {
                let validity_ratio = verified as f64 / (verified + invalid) as f64;
                similarity *= 0.8 + 0.2 * validity_ratio as f32;
            }

            if similarity as f64 >= self.similarity_threshold
                && best.as_ref().map(|b| similarity > b.4).unwrap_or(true)
            {
                best = Some((
                    row.get("id"),
                    row.get("query"),
                    row.get("response"),
                    row.get("risk_score"),
                    similarity,
                ));
            }
        }

        let Some((id, matched_query, response, risk_score, similarity)) = best else { return Ok(None) };

        let now = Utc::now().timestamp();
        sqlx::query("UPDATE semantic_cache SET hit_count = hit_count + 1, last_hit_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(Some(SemanticMatch { id, query: matched_query, response, risk_score, similarity }))
    }

    /// Store a new query/response pair with its embedding and routing
    /// context.
    pub async fn store(
        &self,
        query: &str,
        response: &str,
        context: Option<&Value>,
        risk_score: f64,
    ) -> anyhow::Result<i64> {
        let embedding = self.embeddings.embed(query).await;
        let now = Utc::now().timestamp();
        let context_json = context.map(|c| c.to_string());

        let result = sqlx::query(
            "INSERT INTO semantic_cache
             (query, query_hash, embedding, response, context_json, risk_score, created_at, hit_count, verified_count, invalid_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, 0)",
        )
        .bind(query)
        .bind(Self::query_hash(query))
        .bind(embedding.to_bytes())
        .bind(response)
        .bind(context_json)
        .bind(risk_score)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        self.maybe_cleanup().await?;
        Ok(id)
    }

    /// Record whether a previously served cache hit turned out to be valid,
    /// feeding the trust multiplier applied on future searches.
    pub async fn record_verification(&self, id: i64, is_valid: bool) -> anyhow::Result<()> {
        if is_valid {
            sqlx::query("UPDATE semantic_cache SET verified_count = verified_count + 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE semantic_cache SET invalid_count = invalid_count + 1 WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Evict once over `max_entries`: rows with more invalid than verified
    /// hits go first, then lowest hit count, then oldest.
    async fn maybe_cleanup(&self) -> anyhow::Result<()> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) as c FROM semantic_cache").fetch_one(&self.pool).await?.get("c");

        if count > self.max_entries {
            let to_remove = count - self.max_entries + 100;
            sqlx::query(
                "DELETE FROM semantic_cache WHERE id IN (
                    SELECT id FROM semantic_cache
                    ORDER BY (CASE WHEN invalid_count > verified_count THEN 0 ELSE 1 END), hit_count ASC, created_at ASC
                    LIMIT ?
                 )",
            )
            .bind(to_remove)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    pub async fn get_stats(&self) -> anyhow::Result<SemanticCacheStats> {
        let total: i64 =
            sqlx::query("SELECT COUNT(*) as c FROM semantic_cache").fetch_one(&self.pool).await?.get("c");
        let total_hits: Option<i64> =
            sqlx::query("SELECT SUM(hit_count) as s FROM semantic_cache").fetch_one(&self.pool).await?.get("s");
        let avg_risk: Option<f64> =
            sqlx::query("SELECT AVG(risk_score) as a FROM semantic_cache").fetch_one(&self.pool).await?.get("a");

        Ok(SemanticCacheStats {
            total_entries: total,
            total_hits: total_hits.unwrap_or(0),
            avg_risk_score: (avg_risk.unwrap_or(0.0) * 1000.0).round() / 1000.0,
            similarity_threshold: self.similarity_threshold,
        })
    }
}
