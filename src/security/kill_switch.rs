//! Global emergency control, fusing three independent triggers into one
//! gating decision: manual operator override, the daily budget guard, and
//! a recent error-rate sample. Manual state always wins; budget state wins
//! over error-rate state; absent either, the switch is off.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use super::budget_guard::BudgetGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Off,
    Throttle,
    Degrade,
    Kill,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Off => "off",
            Mode::Throttle => "throttle",
            Mode::Degrade => "degrade",
            Mode::Kill => "kill",
        }
    }

    fn parse(s: &str) -> Mode {
        match s {
            "off" => Mode::Off,
            "throttle" => Mode::Throttle,
            "degrade" => Mode::Degrade,
            _ => Mode::Kill,
        }
    }
}

struct ManualState {
    mode: Mode,
    reason: String,
    activated_at: Option<i64>,
    activated_by: &'static str,
}

impl Default for ManualState {
    fn default() -> Self {
        Self { mode: Mode::Off, reason: String::new(), activated_at: None, activated_by: "" }
    }
}

/// Outcome of a gating check: whether the request is blocked outright, and
/// if not, whether it must be throttled or steered to the cheap tier.
pub struct GateDecision {
    pub blocked: bool,
    pub mode: Mode,
    pub reason: String,
    pub retry_after_seconds: Option<i64>,
    pub throttle_delay_ms: Option<u64>,
    pub force_tier: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct KillSwitchStatus {
    pub mode: String,
    pub reason: String,
    pub activated_at: Option<i64>,
    pub activated_by: String,
    pub error_rate: f64,
    pub recent_requests: u32,
    pub recent_errors: u32,
}

/// Global kill switch, shared across requests via `Arc`.
pub struct KillSwitch {
    error_threshold: f64,
    throttle_delay_ms: u64,
    manual: Mutex<ManualState>,
    recent_requests: AtomicU32,
    recent_errors: AtomicU32,
    last_window_start: AtomicU32,
}

fn seconds_until_midnight() -> i64 {
    let now = Utc::now();
    let next_midnight = (now.date_naive() + chrono::Duration::days(1)).and_hms_opt(0, 0, 0).unwrap();
    (next_midnight - now.naive_utc()).num_seconds().max(0)
}

impl KillSwitch {
    pub fn new(error_threshold: f64, throttle_delay_ms: u64) -> Self {
        Self {
            error_threshold,
            throttle_delay_ms,
            manual: Mutex::new(ManualState::default()),
            recent_requests: AtomicU32::new(0),
            recent_errors: AtomicU32::new(0),
            last_window_start: AtomicU32::new(Utc::now().timestamp() as u32),
        }
    }

    /// Evaluate the current gate. `budget` is consulted for auto-triggered
    /// kill/degrade; pass `None` where no budget guard is wired up.
    pub async fn check(&self, budget: Option<&BudgetGuard>) -> GateDecision {
        {
            let manual = self.manual.lock().await;
            match manual.mode {
                Mode::Kill => {
                    return GateDecision {
                        blocked: true,
                        mode: Mode::Kill,
                        reason: if manual.reason.is_empty() {
                            "Kill switch active".to_string()
                        } else {
                            manual.reason.clone()
                        },
                        retry_after_seconds: Some(seconds_until_midnight()),
                        throttle_delay_ms: None,
                        force_tier: None,
                    };
                }
                Mode::Degrade => {
                    return GateDecision {
                        blocked: false,
                        mode: Mode::Degrade,
                        reason: "Degraded mode - only cheap tier".to_string(),
                        retry_after_seconds: None,
                        throttle_delay_ms: None,
                        force_tier: Some("cheap"),
                    };
                }
                Mode::Throttle => {
                    return GateDecision {
                        blocked: false,
                        mode: Mode::Throttle,
                        reason: "Throttle mode active".to_string(),
                        retry_after_seconds: None,
                        throttle_delay_ms: Some(self.throttle_delay_ms),
                        force_tier: None,
                    };
                }
                Mode::Off => {}
            }
        }

        if let Some(budget) = budget {
            if let Ok(status) = budget.get_status().await {
                if status.level == "hard" {
                    self.activate(Mode::Kill, "Budget hard limit reached".to_string(), "budget").await;
                    return GateDecision {
                        blocked: true,
                        mode: Mode::Kill,
                        reason: "Daily budget exhausted".to_string(),
                        retry_after_seconds: Some(seconds_until_midnight()),
                        throttle_delay_ms: None,
                        force_tier: None,
                    };
                }
                if status.level == "medium" {
                    return GateDecision {
                        blocked: false,
                        mode: Mode::Degrade,
                        reason: "Budget medium limit - premium throttled".to_string(),
                        retry_after_seconds: None,
                        throttle_delay_ms: None,
                        force_tier: Some("cheap"),
                    };
                }
            }
        }

        let error_rate = self.error_rate();
        if error_rate > self.error_threshold {
            self.activate(Mode::Throttle, format!("High error rate ({:.1}%)", error_rate * 100.0), "error_rate").await;
            return GateDecision {
                blocked: false,
                mode: Mode::Throttle,
                reason: format!("High error rate ({:.1}%)", error_rate * 100.0),
                retry_after_seconds: None,
                throttle_delay_ms: Some(self.throttle_delay_ms),
                force_tier: None,
            };
        }

        GateDecision {
            blocked: false,
            mode: Mode::Off,
            reason: "Normal operation".to_string(),
            retry_after_seconds: None,
            throttle_delay_ms: None,
            force_tier: None,
        }
    }

    /// Manually force a mode. An unrecognised mode string falls back to `kill`.
    pub async fn enable(&self, mode: &str, reason: String) {
        self.activate(Mode::parse(mode), reason, "manual").await;
    }

    pub async fn disable(&self) {
        *self.manual.lock().await = ManualState::default();
    }

    async fn activate(&self, mode: Mode, reason: String, activated_by: &'static str) {
        let mut manual = self.manual.lock().await;
        manual.mode = mode;
        manual.reason = reason;
        manual.activated_at = Some(Utc::now().timestamp());
        manual.activated_by = activated_by;
    }

    /// Record a request outcome for the rolling error-rate sample. The
    /// window resets every 60 seconds.
    pub fn record_request(&self, success: bool) {
        let now = Utc::now().timestamp() as u32;
        let start = self.last_window_start.load(Ordering::Relaxed);
        if now.saturating_sub(start) > 60 {
            self.recent_requests.store(0, Ordering::Relaxed);
            self.recent_errors.store(0, Ordering::Relaxed);
            self.last_window_start.store(now, Ordering::Relaxed);
        }
        self.recent_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.recent_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn error_rate(&self) -> f64 {
        let requests = self.recent_requests.load(Ordering::Relaxed);
        if requests < 10 {
            return 0.0;
        }
        self.recent_errors.load(Ordering::Relaxed) as f64 / requests as f64
    }

    pub async fn get_status(&self) -> KillSwitchStatus {
        let manual = self.manual.lock().await;
        KillSwitchStatus {
            mode: manual.mode.as_str().to_string(),
            reason: manual.reason.clone(),
            activated_at: manual.activated_at,
            activated_by: manual.activated_by.to_string(),
            error_rate: self.error_rate(),
            recent_requests: self.recent_requests.load(Ordering::Relaxed),
            recent_errors: self.recent_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn off_by_default() {
        let ks = KillSwitch::new(0.5, 2000);
        let decision = ks.check(None).await;
        assert_eq!(decision.mode, Mode::Off);
        assert!(!decision.blocked);
    }

    #[tokio::test]
    async fn manual_kill_blocks_with_retry_after() {
        let ks = KillSwitch::new(0.5, 2000);
        ks.enable("kill", "scheduled maintenance".to_string()).await;
        let decision = ks.check(None).await;
        assert!(decision.blocked);
        assert_eq!(decision.mode, Mode::Kill);
        assert!(decision.retry_after_seconds.unwrap() > 0);
    }

    #[tokio::test]
    async fn manual_degrade_forces_cheap_tier_without_blocking() {
        let ks = KillSwitch::new(0.5, 2000);
        ks.enable("degrade", "capacity event".to_string()).await;
        let decision = ks.check(None).await;
        assert!(!decision.blocked);
        assert_eq!(decision.force_tier, Some("cheap"));
    }

    #[tokio::test]
    async fn manual_throttle_returns_configured_delay() {
        let ks = KillSwitch::new(0.5, 1234);
        ks.enable("throttle", "cooldown".to_string()).await;
        let decision = ks.check(None).await;
        assert_eq!(decision.throttle_delay_ms, Some(1234));
    }

    #[tokio::test]
    async fn disable_restores_off_mode() {
        let ks = KillSwitch::new(0.5, 2000);
        ks.enable("kill", "x".to_string()).await;
        ks.disable().await;
        let decision = ks.check(None).await;
        assert_eq!(decision.mode, Mode::Off);
    }

    #[tokio::test]
    async fn unrecognised_mode_string_falls_back_to_kill() {
        let ks = KillSwitch::new(0.5, 2000);
        ks.enable("bogus", "x".to_string()).await;
        let decision = ks.check(None).await;
        assert_eq!(decision.mode, Mode::Kill);
    }

    #[tokio::test]
    async fn budget_hard_limit_auto_triggers_kill() {
        let pool = sqlx::sqlite::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let budget = BudgetGuard::new(pool, 1.0, 5.0, 10.0).await.unwrap();
        budget.record_spend(10.5, "premium", None, 0, 0).await.unwrap();

        let ks = KillSwitch::new(0.5, 2000);
        let decision = ks.check(Some(&budget)).await;
        assert!(decision.blocked);
        assert_eq!(decision.mode, Mode::Kill);
    }

    #[tokio::test]
    async fn budget_medium_limit_forces_degrade_without_blocking() {
        let pool = sqlx::sqlite::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let budget = BudgetGuard::new(pool, 1.0, 5.0, 50.0).await.unwrap();
        budget.record_spend(6.0, "premium", None, 0, 0).await.unwrap();

        let ks = KillSwitch::new(0.5, 2000);
        let decision = ks.check(Some(&budget)).await;
        assert!(!decision.blocked);
        assert_eq!(decision.force_tier, Some("cheap"));
    }

    #[tokio::test]
    async fn error_rate_below_minimum_sample_is_ignored() {
        let ks = KillSwitch::new(0.1, 2000);
        for _ in 0..5 {
            ks.record_request(false);
        }
        let decision = ks.check(None).await;
        assert_eq!(decision.mode, Mode::Off);
    }

    #[tokio::test]
    async fn high_error_rate_auto_triggers_throttle() {
        let ks = KillSwitch::new(0.5, 2000);
        for _ in 0..10 {
            ks.record_request(false);
        }
        let decision = ks.check(None).await;
        assert_eq!(decision.mode, Mode::Throttle);
        assert_eq!(decision.throttle_delay_ms, Some(2000));
    }

    #[tokio::test]
    async fn get_status_reports_sample_counts() {
        let ks = KillSwitch::new(0.5, 2000);
        ks.record_request(true);
        ks.record_request(false);
        let status = ks.get_status().await;
        assert_eq!(status.recent_requests, 2);
        assert_eq!(status.recent_errors, 1);
    }
}
