//! Sliding-window, per-tier, dual-quota (requests + tokens) rate limiter.
//!
//! Every tier has its own bucket plus a mandatory `global` umbrella bucket
//! that accumulates every request regardless of tier. A tier's check is
//! against its own multiplied limits *and* the global bucket's unmultiplied
//! base limits — so no single tier can starve the others of the shared pool.

use std::collections::VecDeque;

use tokio::sync::Mutex;

const WINDOW_SECONDS: i64 = 60;

#[derive(Default)]
struct Bucket {
    requests: VecDeque<i64>,
    tokens: VecDeque<(i64, u64)>,
}

impl Bucket {
    fn cleanup(&mut self, now: i64) {
        while matches!(self.requests.front(), Some(&t) if t < now - WINDOW_SECONDS) {
            self.requests.pop_front();
        }
        while matches!(self.tokens.front(), Some(&(t, _)) if t < now - WINDOW_SECONDS) {
            self.tokens.pop_front();
        }
    }

    fn request_count(&self) -> usize {
        self.requests.len()
    }

    fn token_count(&self) -> u64 {
        self.tokens.iter().map(|(_, n)| n).sum()
    }

    fn add(&mut self, now: i64, tokens: u64) {
        self.requests.push_back(now);
        self.tokens.push_back((now, tokens));
    }

    fn wait_time(&self, now: i64) -> f64 {
        self.requests
            .front()
            .map(|&t| ((t + WINDOW_SECONDS) - now).max(0) as f64)
            .unwrap_or(0.0)
    }
}

/// Routing tier a rate-limit check is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Global,
    Cheap,
    Premium,
}

impl Tier {
    fn multipliers(self) -> (f64, f64) {
        // (requests multiplier, tokens multiplier)
        match self {
            Tier::Global => (1.0, 1.0),
            Tier::Cheap => (2.0, 1.5),
            Tier::Premium => (0.5, 0.5),
        }
    }

    fn index(self) -> usize {
        match self {
            Tier::Global => 0,
            Tier::Cheap => 1,
            Tier::Premium => 2,
        }
    }
}

pub struct RateLimitDecision {
    pub allowed: bool,
    pub message: String,
}

pub struct TierStatus {
    pub requests_current: usize,
    pub requests_limit: u64,
    pub tokens_current: u64,
    pub tokens_limit: u64,
}

/// Sliding-window dual-quota rate limiter, shared across requests via `Arc`.
pub struct RateLimiter {
    requests_per_minute: u32,
    tokens_per_minute: u64,
    buckets: [Mutex<Bucket>; 3],
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            buckets: [Mutex::new(Bucket::default()), Mutex::new(Bucket::default()), Mutex::new(Bucket::default())],
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Check whether `estimated_tokens` may proceed under `tier`. Does not
    /// record; call [`Self::record`] only after a successful upstream call.
    pub async fn check(&self, estimated_tokens: u64, tier: Tier) -> RateLimitDecision {
        let now = Self::now();

        let mut bucket = self.buckets[tier.index()].lock().await;
        bucket.cleanup(now);

        let (req_mult, tok_mult) = tier.multipliers();
        let rpm_limit = (self.requests_per_minute as f64 * req_mult) as u64;
        let tpm_limit = (self.tokens_per_minute as f64 * tok_mult) as u64;

        if bucket.request_count() as u64 >= rpm_limit {
            let wait = bucket.wait_time(now);
            return RateLimitDecision {
                allowed: false,
                message: format!(
                    "Request limit exceeded ({}/{}). Retry in {:.1}s",
                    bucket.request_count(),
                    rpm_limit,
                    wait
                ),
            };
        }
        if bucket.token_count() + estimated_tokens > tpm_limit {
            let wait = bucket.wait_time(now);
            return RateLimitDecision {
                allowed: false,
                message: format!(
                    "Token limit exceeded ({}/{}). Retry in {:.1}s",
                    bucket.token_count(),
                    tpm_limit,
                    wait
                ),
            };
        }
        drop(bucket);

        if !matches!(tier, Tier::Global) {
            let mut global = self.buckets[Tier::Global.index()].lock().await;
            global.cleanup(now);
            if global.request_count() as u64 >= self.requests_per_minute as u64 {
                let wait = global.wait_time(now);
                return RateLimitDecision {
                    allowed: false,
                    message: format!("Global request limit exceeded. Retry in {wait:.1}s"),
                };
            }
            if global.token_count() + estimated_tokens > self.tokens_per_minute {
                let wait = global.wait_time(now);
                return RateLimitDecision {
                    allowed: false,
                    message: format!("Global token limit exceeded. Retry in {wait:.1}s"),
                };
            }
        }

        RateLimitDecision { allowed: true, message: "OK".to_string() }
    }

    /// Record actual token usage against both the tier bucket and the global bucket.
    pub async fn record(&self, tokens: u64, tier: Tier) {
        let now = Self::now();
        self.buckets[tier.index()].lock().await.add(now, tokens);
        if !matches!(tier, Tier::Global) {
            self.buckets[Tier::Global.index()].lock().await.add(now, tokens);
        }
    }

    pub async fn status(&self, tier: Tier) -> TierStatus {
        let now = Self::now();
        let mut bucket = self.buckets[tier.index()].lock().await;
        bucket.cleanup(now);
        let (req_mult, tok_mult) = tier.multipliers();
        TierStatus {
            requests_current: bucket.request_count(),
            requests_limit: (self.requests_per_minute as f64 * req_mult) as u64,
            tokens_current: bucket.token_count(),
            tokens_limit: (self.tokens_per_minute as f64 * tok_mult) as u64,
        }
    }

    pub async fn reset(&self, tier: Option<Tier>) {
        match tier {
            Some(t) => *self.buckets[t.index()].lock().await = Bucket::default(),
            None => {
                for b in &self.buckets {
                    *b.lock().await = Bucket::default();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_requests_under_limit() {
        let limiter = RateLimiter::new(10, 1000);
        let decision = limiter.check(10, Tier::Global).await;
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn rejects_once_request_count_reached() {
        let limiter = RateLimiter::new(2, 100_000);
        limiter.record(1, Tier::Global).await;
        limiter.record(1, Tier::Global).await;
        let decision = limiter.check(1, Tier::Global).await;
        assert!(!decision.allowed);
        assert!(decision.message.contains("Request limit"));
    }

    #[tokio::test]
    async fn rejects_when_token_budget_would_be_exceeded() {
        let limiter = RateLimiter::new(1000, 100);
        limiter.record(90, Tier::Global).await;
        let decision = limiter.check(20, Tier::Global).await;
        assert!(!decision.allowed);
        assert!(decision.message.contains("Token limit"));
    }

    #[tokio::test]
    async fn premium_tier_has_tighter_multiplied_limits() {
        let limiter = RateLimiter::new(10, 100_000);
        // premium multiplier is 0.5 -> effective rpm limit = 5
        for _ in 0..5 {
            limiter.record(1, Tier::Premium).await;
        }
        let decision = limiter.check(1, Tier::Premium).await;
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn cheap_tier_records_also_count_against_global_bucket() {
        let limiter = RateLimiter::new(3, 100_000);
        limiter.record(1, Tier::Cheap).await;
        limiter.record(1, Tier::Cheap).await;
        limiter.record(1, Tier::Cheap).await;
        // global base limit is 3 requests; cheap's own multiplied limit is 6,
        // so the rejection must come from the global check.
        let decision = limiter.check(1, Tier::Cheap).await;
        assert!(!decision.allowed);
        assert!(decision.message.contains("Global"));
    }

    #[tokio::test]
    async fn reset_clears_a_single_tier() {
        let limiter = RateLimiter::new(1, 100_000);
        limiter.record(1, Tier::Global).await;
        assert!(!limiter.check(1, Tier::Global).await.allowed);
        limiter.reset(Some(Tier::Global)).await;
        assert!(limiter.check(1, Tier::Global).await.allowed);
    }

    #[tokio::test]
    async fn status_reports_current_and_limit() {
        let limiter = RateLimiter::new(10, 1000);
        limiter.record(50, Tier::Global).await;
        let status = limiter.status(Tier::Global).await;
        assert_eq!(status.requests_current, 1);
        assert_eq!(status.tokens_current, 50);
        assert_eq!(status.requests_limit, 10);
    }
}
