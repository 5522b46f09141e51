//! Embedding generation for the semantic cache, with disk caching and a
//! layered fallback chain: Voyage (Anthropic's embeddings partner) first,
//! OpenAI second, and a deterministic hash-based pseudo-embedding as the
//! final fallback so [`EmbeddingService::embed`] always returns a usable
//! vector.
//!
//! The hash fallback exists only inside `embed`'s own fallback chain — it is
//! never a substitute the semantic cache reaches for directly. In practice
//! this means `embed` effectively never fails; callers that need to treat
//! "no usable embedding" as a distinct outcome (the semantic cache aborting
//! a search) are really modelling degenerate input, not provider outages.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Client;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use super::vector::Vector;

/// One remote embedding provider: base URL, auth header value, model name.
struct Provider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Provider {
    fn new(base_url: &str, api_key: String, model: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");
        Self { client, base_url: base_url.to_string(), api_key, model }
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vector> {
        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": text, "input_type": "query" }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        let values = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("embedding response missing data[0].embedding"))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(Vector::new(values))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vector>> {
        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts, "input_type": "query" }))
            .send()
            .await?
            .error_for_status()?;
        let body: serde_json::Value = resp.json().await?;
        let data = body["data"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("embedding batch response missing data array"))?;
        Ok(data
            .iter()
            .map(|item| {
                let values = item["embedding"]
                    .as_array()
                    .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
                    .unwrap_or_default();
                Vector::new(values)
            })
            .collect())
    }
}

/// Diagnostics for the disk cache.
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
}

/// Embedding generator with a primary/secondary remote provider and a disk
/// cache keyed by the first 16 hex characters of `sha256(text)`.
pub struct EmbeddingService {
    primary: Option<Provider>,
    secondary: Option<Provider>,
    cache_dir: PathBuf,
    dimension: usize,
    // Guards cache directory creation/listing so concurrent embeds don't race
    // on first-use directory setup.
    init_lock: Mutex<()>,
}

impl EmbeddingService {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        dimension: usize,
        voyage_api_key: Option<String>,
        openai_api_key: Option<String>,
        model: &str,
    ) -> Self {
        let primary = voyage_api_key
            .map(|key| Provider::new("https://api.voyageai.com/v1", key, model.to_string()));
        let secondary = openai_api_key
            .map(|key| Provider::new("https://api.openai.com/v1", key, "text-embedding-3-small".to_string()));
        Self {
            primary,
            secondary,
            cache_dir: cache_dir.into(),
            dimension,
            init_lock: Mutex::new(()),
        }
    }

    async fn ensure_cache_dir(&self) -> anyhow::Result<()> {
        let _guard = self.init_lock.lock().await;
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        Ok(())
    }

    fn cache_path(&self, text: &str) -> PathBuf {
        let hash = hex::encode(Sha256::digest(text.as_bytes()));
        self.cache_dir.join(format!("{}.bin", &hash[..16]))
    }

    async fn get_cached(&self, text: &str) -> Option<Vector> {
        let bytes = tokio::fs::read(self.cache_path(text)).await.ok()?;
        Some(Vector::from_bytes(&bytes))
    }

    async fn cache_embedding(&self, text: &str, embedding: &Vector) {
        if self.ensure_cache_dir().await.is_err() {
            return;
        }
        let _ = tokio::fs::write(self.cache_path(text), embedding.to_bytes()).await;
    }

    /// Deterministic pseudo-embedding derived from `sha256(text)`, spread
    /// across `dimension` floats in `[-1, 1)` and L2-normalized.
    fn hash_embedding(&self, text: &str) -> Vector {
        let digest = Sha256::digest(text.as_bytes());
        let hex_digest = hex::encode(digest);
        let mut values = vec![0.0f32; self.dimension];
        let pairs = (hex_digest.len() / 2).min(self.dimension);
        for (i, value) in values.iter_mut().enumerate().take(pairs) {
            let byte = u8::from_str_radix(&hex_digest[i * 2..i * 2 + 2], 16).unwrap_or(0);
            *value = (byte as f32 - 128.0) / 128.0;
        }
        let mut v = Vector::new(values);
        v.normalize();
        v
    }

    /// Produce an embedding for `text`: disk cache, then Voyage, then
    /// OpenAI, then the hash fallback. Always returns a usable vector.
    pub async fn embed(&self, text: &str) -> Vector {
        if let Some(cached) = self.get_cached(text).await {
            return cached;
        }

        if let Some(provider) = &self.primary {
            match provider.embed(text).await {
                Ok(embedding) => {
                    self.cache_embedding(text, &embedding).await;
                    return embedding;
                }
                Err(e) => tracing::warn!(error = %e, "voyage embedding failed"),
            }
        }

        if let Some(provider) = &self.secondary {
            match provider.embed(text).await {
                Ok(embedding) => {
                    self.cache_embedding(text, &embedding).await;
                    return embedding;
                }
                Err(e) => tracing::warn!(error = %e, "openai embedding failed"),
            }
        }

        tracing::warn!("all embedding providers failed, using hash-based fallback");
        self.hash_embedding(text)
    }

    /// Embed a batch of texts: cache-first, then one batched remote call for
    /// the remainder. Falls back to embedding individually if the batch call
    /// fails.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Vector> {
        let mut results: Vec<Option<Vector>> = Vec::with_capacity(texts.len());
        let mut uncached_indices = Vec::new();
        let mut uncached_texts = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if let Some(cached) = self.get_cached(text).await {
                results.push(Some(cached));
            } else {
                results.push(None);
                uncached_indices.push(i);
                uncached_texts.push(text.clone());
            }
        }

        if !uncached_texts.is_empty() {
            let mut batched = false;
            if let Some(provider) = &self.primary {
                if let Ok(embeddings) = provider.embed_batch(&uncached_texts).await {
                    for (idx, embedding) in uncached_indices.iter().zip(embeddings.into_iter()) {
                        self.cache_embedding(&texts[*idx], &embedding).await;
                        results[*idx] = Some(embedding);
                    }
                    batched = true;
                }
            }
            if !batched {
                for idx in uncached_indices {
                    results[idx] = Some(self.embed(&texts[idx]).await);
                }
            }
        }

        results.into_iter().map(|r| r.expect("every slot filled by cache, batch, or fallback")).collect()
    }

    /// Remove every cached embedding from disk.
    pub async fn clear_cache(&self) -> anyhow::Result<()> {
        if tokio::fs::metadata(&self.cache_dir).await.is_ok() {
            tokio::fs::remove_dir_all(&self.cache_dir).await?;
        }
        self.ensure_cache_dir().await
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        let mut entries = 0usize;
        let mut size_bytes = 0u64;
        if let Ok(mut dir) = tokio::fs::read_dir(&self.cache_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("bin") {
                    entries += 1;
                    if let Ok(meta) = entry.metadata().await {
                        size_bytes += meta.len();
                    }
                }
            }
        }
        CacheStats { entries, size_bytes }
    }
}

fn path_exists(path: &Path) -> bool {
    path.exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("embed-test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn embed_without_providers_falls_back_to_hash_embedding() {
        let service = EmbeddingService::new(temp_dir(), 32, None, None, "voyage-code-2");
        let v = service.embed("hello world").await;
        assert_eq!(v.len(), 32);
        assert!((v.norm() - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hash_fallback_is_deterministic() {
        let service = EmbeddingService::new(temp_dir(), 32, None, None, "voyage-code-2");
        let a = service.hash_embedding("same text");
        let b = service.hash_embedding("same text");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn hash_fallback_differs_for_different_text() {
        let service = EmbeddingService::new(temp_dir(), 32, None, None, "voyage-code-2");
        let a = service.hash_embedding("text one");
        let b = service.hash_embedding("text two");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn embed_caches_to_disk_and_reuses_on_second_call() {
        let dir = temp_dir();
        let service = EmbeddingService::new(dir.clone(), 32, None, None, "voyage-code-2");
        let first = service.embed("cache me").await;
        assert!(path_exists(&service.cache_path("cache me")));
        let second = service.get_cached("cache me").await.unwrap();
        assert_eq!(first, second);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn embed_batch_falls_back_per_text_without_providers() {
        let service = EmbeddingService::new(temp_dir(), 16, None, None, "voyage-code-2");
        let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let results = service.embed_batch(&texts).await;
        assert_eq!(results.len(), 3);
        assert_ne!(results[0], results[1]);
    }

    #[tokio::test]
    async fn clear_cache_removes_cached_entries() {
        let dir = temp_dir();
        let service = EmbeddingService::new(dir.clone(), 16, None, None, "voyage-code-2");
        service.embed("persisted").await;
        let stats_before = service.get_cache_stats().await;
        assert_eq!(stats_before.entries, 1);

        service.clear_cache().await.unwrap();
        let stats_after = service.get_cache_stats().await;
        assert_eq!(stats_after.entries, 0);
        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
