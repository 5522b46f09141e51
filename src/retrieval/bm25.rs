//! BM25 full-text index over past query/response pairs, backed by SQLite
//! FTS5. Used as the tier router's cache fast-path: a high-scoring match
//! means "we've essentially seen this query before" and can skip straight to
//! a semantic-cache lookup instead of paying for classification.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

const FTS_SPECIAL_CHARS: &[char] = &['"', '*', '^', ':', '(', ')', '[', ']', '{', '}', '|', '\\', '/'];

#[derive(Debug, Clone, Serialize)]
pub struct Bm25Match {
    pub rowid: i64,
    pub query: String,
    pub response: String,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct Bm25Stats {
    pub indexed_queries: i64,
    pub total_hits: i64,
}

#[derive(Debug, Serialize)]
pub struct FrequentQuery {
    pub query: String,
    pub response: String,
    pub hit_count: i64,
    pub last_hit_at: Option<i64>,
}

/// SQLite FTS5-backed BM25 index, shared across requests via `Arc`.
pub struct Bm25Index {
    pool: SqlitePool,
}

impl Bm25Index {
    pub async fn new(pool: SqlitePool) -> anyhow::Result<Self> {
        sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS query_index
             USING fts5(query, response, context, tokenize='porter unicode61')",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS query_meta (
                rowid INTEGER PRIMARY KEY,
                created_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_hit_at INTEGER
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Escape FTS5 special characters, drop short/boolean-operator tokens,
    /// and join the first 10 remaining tokens with `OR` for broad matching.
    fn escape_query(query: &str) -> String {
        let mut cleaned = query.to_string();
        for c in FTS_SPECIAL_CHARS {
            cleaned = cleaned.replace(*c, " ");
        }

        let words: Vec<&str> = cleaned
            .split_whitespace()
            .filter(|w| w.len() > 2)
            .filter(|w| !matches!(w.to_uppercase().as_str(), "AND" | "OR" | "NOT"))
            .take(10)
            .collect();

        if words.is_empty() {
            return "\"\"".to_string();
        }

        words.iter().map(|w| format!("\"{w}\"")).collect::<Vec<_>>().join(" OR ")
    }

    /// BM25 search. Scores are normalized to `[0, 1]` (`min(1, |raw| / 10)`)
    /// and filtered to `>= min_score`.
    pub async fn search(&self, query: &str, top_k: i64, min_score: f64) -> Vec<Bm25Match> {
        let escaped = Self::escape_query(query);

        let rows = match sqlx::query(
            "SELECT rowid, query, response, bm25(query_index) as score
             FROM query_index WHERE query_index MATCH ? ORDER BY score LIMIT ?",
        )
        .bind(&escaped)
        .bind(top_k)
        .fetch_all(&self.pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "bm25 search error");
                return Vec::new();
            }
        };

        rows.into_iter()
            .filter_map(|row| {
                let raw_score: f64 = row.get("score");
                let normalized = (raw_score.abs() / 10.0).min(1.0);
                (normalized >= min_score).then(|| Bm25Match {
                    rowid: row.get("rowid"),
                    query: row.get("query"),
                    response: row.get("response"),
                    score: normalized,
                })
            })
            .collect()
    }

    /// Index a query/response pair. Near-duplicates (self-search score >
    /// 0.98) bump the existing row's hit count instead of inserting again.
    pub async fn index_query(&self, query: &str, response: &str, context: Option<&str>) -> anyhow::Result<()> {
        let now = Utc::now().timestamp();

        let existing = self.search(query, 1, 0.95).await;
        if let Some(best) = existing.first() {
            if best.score > 0.98 {
                sqlx::query(
                    "UPDATE query_meta SET hit_count = hit_count + 1, last_hit_at = ? WHERE rowid = ?",
                )
                .bind(now)
                .bind(best.rowid)
                .execute(&self.pool)
                .await?;
                return Ok(());
            }
        }

        let truncated: String = response.chars().take(2000).collect();
        let result = sqlx::query("INSERT INTO query_index (query, response, context) VALUES (?, ?, ?)")
            .bind(query)
            .bind(&truncated)
            .bind(context.unwrap_or(""))
            .execute(&self.pool)
            .await?;
        let rowid = result.last_insert_rowid();

        sqlx::query("INSERT INTO query_meta (rowid, created_at) VALUES (?, ?)")
            .bind(rowid)
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_frequent_queries(&self, limit: i64) -> anyhow::Result<Vec<FrequentQuery>> {
        let rows = sqlx::query(
            "SELECT qi.query, qi.response, qm.hit_count, qm.last_hit_at
             FROM query_index qi JOIN query_meta qm ON qi.rowid = qm.rowid
             ORDER BY qm.hit_count DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let response: String = row.get("response");
                let display = if response.chars().count() > 200 {
                    format!("{}...", response.chars().take(200).collect::<String>())
                } else {
                    response
                };
                FrequentQuery {
                    query: row.get("query"),
                    response: display,
                    hit_count: row.get("hit_count"),
                    last_hit_at: row.get("last_hit_at"),
                }
            })
            .collect())
    }

    pub async fn get_stats(&self) -> anyhow::Result<Bm25Stats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) as c FROM query_index")
            .fetch_one(&self.pool)
            .await?
            .get("c");
        let total_hits: Option<i64> = sqlx::query("SELECT SUM(hit_count) as s FROM query_meta")
            .fetch_one(&self.pool)
            .await?
            .get("s");
        Ok(Bm25Stats { indexed_queries: total, total_hits: total_hits.unwrap_or(0) })
    }

    /// Evict entries once the index exceeds `max_entries`: oldest/zero-hit
    /// rows go first, `count - max_entries + 100` of them at a time.
    pub async fn cleanup(&self, max_entries: i64, max_age_days: i64) -> anyhow::Result<()> {
        let count: i64 = sqlx::query("SELECT COUNT(*) as c FROM query_index")
            .fetch_one(&self.pool)
            .await?
            .get("c");

        if count <= max_entries {
            return Ok(());
        }

        let to_remove = count - max_entries + 100;
        let cutoff = Utc::now().timestamp() - max_age_days * 86_400;

        sqlx::query(
            "DELETE FROM query_index WHERE rowid IN (
                SELECT qi.rowid FROM query_index qi
                JOIN query_meta qm ON qi.rowid = qm.rowid
                WHERE qm.created_at < ? OR qm.hit_count = 0
                ORDER BY qm.hit_count ASC, qm.created_at ASC
                LIMIT ?
             )",
        )
        .bind(cutoff)
        .bind(to_remove)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM query_meta WHERE rowid NOT IN (SELECT rowid FROM query_index)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn index() -> Bm25Index {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Bm25Index::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn index_then_search_finds_exact_query() {
        let idx = index().await;
        idx.index_query("how do I sort a list in python", "use sorted()", None).await.unwrap();
        let results = idx.search("how do I sort a list in python", 5, 0.0).await;
        assert!(!results.is_empty());
        assert_eq!(results[0].response, "use sorted()");
    }

    #[tokio::test]
    async fn search_on_empty_index_returns_empty() {
        let idx = index().await;
        let results = idx.search("anything", 5, 0.0).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn near_duplicate_bumps_hit_count_instead_of_inserting() {
        let idx = index().await;
        idx.index_query("what is the capital of france", "paris", None).await.unwrap();
        idx.index_query("what is the capital of france", "paris", None).await.unwrap();

        let stats = idx.get_stats().await.unwrap();
        assert_eq!(stats.indexed_queries, 1);
        assert_eq!(stats.total_hits, 1);
    }

    #[tokio::test]
    async fn escape_query_strips_boolean_keywords_and_short_tokens() {
        let escaped = Bm25Index::escape_query("to be or not to be AND more");
        assert!(!escaped.to_uppercase().contains("\"AND\""));
        assert!(!escaped.to_uppercase().contains("\"OR\""));
    }

    #[tokio::test]
    async fn frequent_queries_ordered_by_hit_count_descending() {
        let idx = index().await;
        idx.index_query("query a", "resp a", None).await.unwrap();
        idx.index_query("query b", "resp b", None).await.unwrap();
        idx.index_query("query b", "resp b", None).await.unwrap();

        let frequent = idx.get_frequent_queries(10).await.unwrap();
        assert_eq!(frequent[0].query, "query b");
    }

    #[tokio::test]
    async fn cleanup_respects_max_entries_budget() {
        let idx = index().await;
        for i in 0..5 {
            idx.index_query(&format!("unique query number {i}"), "response", None).await.unwrap();
        }
        idx.cleanup(3, 30).await.unwrap();
        let stats = idx.get_stats().await.unwrap();
        assert!(stats.indexed_queries <= 5);
    }
}
