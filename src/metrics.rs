//! In-process metrics: a 60-second rolling window for dashboards plus
//! lifetime totals and a latency histogram, rendered as JSON or Prometheus
//! text exposition.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

const WINDOW_SECONDS: u64 = 60;
const LATENCY_BUCKETS_MS: &[u64] = &[10, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

struct Window {
    started_at: Instant,
    requests: u64,
    per_tier: HashMap<String, u64>,
    per_status: HashMap<String, u64>,
    latencies_ms: Vec<f64>,
    costs: Vec<f64>,
}

impl Window {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: 0,
            per_tier: HashMap::new(),
            per_status: HashMap::new(),
            latencies_ms: Vec::new(),
            costs: Vec::new(),
        }
    }

    fn maybe_reset(&mut self) {
        if self.started_at.elapsed() > Duration::from_secs(WINDOW_SECONDS) {
            *self = Window::new();
        }
    }
}

#[derive(Default)]
struct Totals {
    requests: u64,
    cache_hits: HashMap<String, u64>,
    cache_misses: HashMap<String, u64>,
    routing: HashMap<String, u64>,
    blocked: HashMap<String, u64>,
    errors: HashMap<String, u64>,
    cost: f64,
    cost_by_tier: HashMap<String, f64>,
}

struct State {
    window: Window,
    totals: Totals,
    latency_histogram: HashMap<String, u64>,
}

/// Rolling-window and lifetime request metrics, shared across requests via
/// `Arc`. All mutation happens through a short-lived `std::sync::Mutex` lock
/// since every update is a simple in-memory counter bump.
pub struct Metrics {
    state: Mutex<State>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { window: Window::new(), totals: Totals::default(), latency_histogram: HashMap::new() }),
        }
    }

    pub fn record_request(&self, latency_ms: f64, tier: &str, status: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();

        state.totals.requests += 1;
        state.window.requests += 1;
        *state.window.per_tier.entry(tier.to_string()).or_default() += 1;
        *state.window.per_status.entry(status.to_string()).or_default() += 1;
        state.window.latencies_ms.push(latency_ms);

        let bucket = LATENCY_BUCKETS_MS
            .iter()
            .find(|&&b| latency_ms <= b as f64)
            .map(|b| b.to_string())
            .unwrap_or_else(|| "+Inf".to_string());
        *state.latency_histogram.entry(bucket).or_default() += 1;
    }

    pub fn record_cache_hit(&self, cache_type: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        *state.totals.cache_hits.entry(cache_type.to_string()).or_default() += 1;
    }

    pub fn record_cache_miss(&self, cache_type: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        *state.totals.cache_misses.entry(cache_type.to_string()).or_default() += 1;
    }

    pub fn record_routing(&self, tier: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        *state.totals.routing.entry(tier.to_string()).or_default() += 1;
    }

    pub fn record_blocked(&self, reason: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        *state.totals.blocked.entry(reason.to_string()).or_default() += 1;
    }

    pub fn record_error(&self, error_type: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        *state.totals.errors.entry(error_type.to_string()).or_default() += 1;
    }

    pub fn record_cost(&self, cost: f64, tier: &str) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();
        state.totals.cost += cost;
        *state.totals.cost_by_tier.entry(tier.to_string()).or_default() += cost;
        state.window.costs.push(cost);
    }

    pub fn reset(&self) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window = Window::new();
        state.totals = Totals::default();
        state.latency_histogram = HashMap::new();
    }

    pub fn get_summary(&self) -> Value {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.window.maybe_reset();

        let total_hits: u64 = state.totals.cache_hits.values().sum();
        let total_misses: u64 = state.totals.cache_misses.values().sum();
        let total_cache = total_hits + total_misses;
        let cache_hit_rate = if total_cache > 0 { total_hits as f64 / total_cache as f64 } else { 0.0 };

        let mut sorted_latencies = state.window.latencies_ms.clone();
        sorted_latencies.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p50 = percentile(&sorted_latencies, 50.0);
        let p95 = percentile(&sorted_latencies, 95.0);
        let p99 = percentile(&sorted_latencies, 99.0);
        let avg = if state.window.latencies_ms.is_empty() {
            0.0
        } else {
            state.window.latencies_ms.iter().sum::<f64>() / state.window.latencies_ms.len() as f64
        };

        let total_routed: u64 = state.totals.routing.values().sum();
        let routing_pct: HashMap<String, f64> = state
            .totals
            .routing
            .iter()
            .map(|(tier, count)| {
                let pct = if total_routed > 0 { *count as f64 / total_routed as f64 * 100.0 } else { 0.0 };
                (tier.clone(), round3(pct))
            })
            .collect();

        json!({
            "window": {
                "seconds": WINDOW_SECONDS,
                "requests": state.window.requests,
                "latency_ms": {
                    "p50": round1(p50),
                    "p95": round1(p95),
                    "p99": round1(p99),
                    "avg": round1(avg),
                },
                "cost": round4(state.window.costs.iter().sum()),
            },
            "totals": {
                "requests": state.totals.requests,
                "cost": round4(state.totals.cost),
                "cost_by_tier": state.totals.cost_by_tier.iter().map(|(k, v)| (k.clone(), round4(*v))).collect::<HashMap<_, _>>(),
            },
            "cache": {
                "hit_rate": round1(cache_hit_rate * 100.0),
                "hits_by_type": state.totals.cache_hits,
                "misses_by_type": state.totals.cache_misses,
            },
            "routing": {
                "counts": state.totals.routing,
                "percentages": routing_pct,
            },
            "blocked": state.totals.blocked,
            "errors": state.totals.errors,
            "latency_histogram": state.latency_histogram,
        })
    }

    pub fn get_prometheus(&self) -> String {
        let summary = self.get_summary();
        let mut lines = Vec::new();

        lines.push("# HELP gateway_requests_total Total requests".to_string());
        lines.push("# TYPE gateway_requests_total counter".to_string());
        lines.push(format!("gateway_requests_total {}", summary["totals"]["requests"]));

        lines.push("# HELP gateway_cost_total Total cost in USD".to_string());
        lines.push("# TYPE gateway_cost_total counter".to_string());
        lines.push(format!("gateway_cost_total {}", summary["totals"]["cost"]));

        if let Some(map) = summary["totals"]["cost_by_tier"].as_object() {
            for (tier, cost) in map {
                lines.push(format!("gateway_cost_by_tier{{tier=\"{tier}\"}} {cost}"));
            }
        }

        lines.push("# HELP gateway_cache_hit_rate Cache hit rate".to_string());
        lines.push("# TYPE gateway_cache_hit_rate gauge".to_string());
        let hit_rate = summary["cache"]["hit_rate"].as_f64().unwrap_or(0.0) / 100.0;
        lines.push(format!("gateway_cache_hit_rate {hit_rate}"));

        lines.push("# HELP gateway_latency_ms Request latency in ms".to_string());
        lines.push("# TYPE gateway_latency_ms histogram".to_string());
        if let Some(map) = summary["latency_histogram"].as_object() {
            for (bucket, count) in map {
                lines.push(format!("gateway_latency_ms_bucket{{le=\"{bucket}\"}} {count}"));
            }
        }

        if let Some(map) = summary["routing"]["counts"].as_object() {
            for (tier, count) in map {
                lines.push(format!("gateway_routing_total{{tier=\"{tier}\"}} {count}"));
            }
        }

        if let Some(map) = summary["blocked"].as_object() {
            for (reason, count) in map {
                lines.push(format!("gateway_blocked_total{{reason=\"{reason}\"}} {count}"));
            }
        }

        if let Some(map) = summary["errors"].as_object() {
            for (error_type, count) in map {
                lines.push(format!("gateway_errors_total{{type=\"{error_type}\"}} {count}"));
            }
        }

        lines.join("\n")
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * pct / 100.0;
    let f = k.floor() as usize;
    let c = (f + 1).min(sorted.len() - 1);
    if f == c {
        sorted[f]
    } else {
        sorted[f] + (sorted[c] - sorted[f]) * (k - f as f64)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_updates_window_and_totals() {
        let m = Metrics::new();
        m.record_request(42.0, "cheap", "success");
        let summary = m.get_summary();
        assert_eq!(summary["window"]["requests"], 1);
        assert_eq!(summary["totals"]["requests"], 1);
    }

    #[test]
    fn cache_hit_rate_reflects_hits_and_misses() {
        let m = Metrics::new();
        m.record_cache_hit("exact");
        m.record_cache_hit("exact");
        m.record_cache_miss("exact");
        let summary = m.get_summary();
        let hit_rate = summary["cache"]["hit_rate"].as_f64().unwrap();
        assert!((hit_rate - 66.7).abs() < 0.1);
    }

    #[test]
    fn latency_percentiles_are_computed_from_window() {
        let m = Metrics::new();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            m.record_request(v, "cheap", "success");
        }
        let summary = m.get_summary();
        assert_eq!(summary["window"]["latency_ms"]["p50"], 30.0);
    }

    #[test]
    fn cost_totals_accumulate_by_tier() {
        let m = Metrics::new();
        m.record_cost(0.01, "premium");
        m.record_cost(0.02, "premium");
        m.record_cost(0.005, "cheap");
        let summary = m.get_summary();
        assert_eq!(summary["totals"]["cost_by_tier"]["premium"], 0.03);
    }

    #[test]
    fn routing_percentages_sum_close_to_100() {
        let m = Metrics::new();
        m.record_routing("cheap");
        m.record_routing("cheap");
        m.record_routing("premium");
        let summary = m.get_summary();
        let cheap_pct = summary["routing"]["percentages"]["cheap"].as_f64().unwrap();
        let premium_pct = summary["routing"]["percentages"]["premium"].as_f64().unwrap();
        assert!((cheap_pct + premium_pct - 100.0).abs() < 0.1);
    }

    #[test]
    fn reset_clears_totals_and_window() {
        let m = Metrics::new();
        m.record_request(10.0, "cheap", "success");
        m.reset();
        let summary = m.get_summary();
        assert_eq!(summary["totals"]["requests"], 0);
        assert_eq!(summary["window"]["requests"], 0);
    }

    #[test]
    fn prometheus_output_contains_request_counter() {
        let m = Metrics::new();
        m.record_request(10.0, "cheap", "success");
        let text = m.get_prometheus();
        assert!(text.contains("gateway_requests_total 1"));
    }

    #[test]
    fn empty_metrics_summary_has_zeroed_latencies() {
        let m = Metrics::new();
        let summary = m.get_summary();
        assert_eq!(summary["window"]["latency_ms"]["p50"], 0.0);
    }
}
