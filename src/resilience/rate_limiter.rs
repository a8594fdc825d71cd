//! Multi-tier sliding-window rate limiter.
//!
//! Admission is evaluated against request counts in the last minute, hour and
//! day plus the accumulated cost of the last day. A check never records; the
//! caller records exactly once per attempted call after a positive admission.

use crate::clock::{system_clock, SharedClock};
use crate::store::SharedStore;
use crate::{Error, Result};
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const RATE_LIMIT_STORAGE_KEY: &str = "rate_limit_data";

const MINUTE_MS: u64 = 60 * 1000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;

const PERSISTED_REQUESTS: usize = 1000;
const PERSISTED_COSTS: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(alias = "maxRequestsPerMinute")]
    pub max_requests_per_minute: u32,
    #[serde(alias = "maxRequestsPerHour")]
    pub max_requests_per_hour: u32,
    #[serde(alias = "maxRequestsPerDay")]
    pub max_requests_per_day: u32,
    #[serde(alias = "maxCostPerDay")]
    pub max_cost_per_day: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 10,
            max_requests_per_hour: 100,
            max_requests_per_day: 500,
            max_cost_per_day: 5.0,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_per_minute(mut self, n: u32) -> Self {
        self.max_requests_per_minute = n;
        self
    }

    pub fn with_per_hour(mut self, n: u32) -> Self {
        self.max_requests_per_hour = n;
        self
    }

    pub fn with_per_day(mut self, n: u32) -> Self {
        self.max_requests_per_day = n;
        self
    }

    pub fn with_max_cost_per_day(mut self, cost: f64) -> Self {
        self.max_cost_per_day = cost;
        self
    }

    fn apply(&mut self, patch: &RateLimitPatch) {
        if let Some(n) = patch.max_requests_per_minute {
            self.max_requests_per_minute = n;
        }
        if let Some(n) = patch.max_requests_per_hour {
            self.max_requests_per_hour = n;
        }
        if let Some(n) = patch.max_requests_per_day {
            self.max_requests_per_day = n;
        }
        if let Some(c) = patch.max_cost_per_day {
            self.max_cost_per_day = c;
        }
    }
}

/// Partial update for [`RateLimiter::update_config`]; `None` keeps the current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitPatch {
    pub max_requests_per_minute: Option<u32>,
    pub max_requests_per_hour: Option<u32>,
    pub max_requests_per_day: Option<u32>,
    pub max_cost_per_day: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitUsage {
    pub requests_this_minute: u32,
    pub requests_this_hour: u32,
    pub requests_today: u32,
    pub cost_today: f64,
}

/// Outcome of [`RateLimiter::check_limit`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after: Option<Duration>,
    pub usage: RateLimitUsage,
    pub limits: RateLimitConfig,
}

impl RateLimitStatus {
    /// Convert a rejection into [`Error::RateLimited`]; `None` when admitted.
    pub fn rejection(&self) -> Option<Error> {
        if self.allowed {
            return None;
        }
        let reason = self.reason.clone().unwrap_or_default();
        let message = match self.retry_after {
            Some(after) => format!("{}. Retry after {} seconds.", reason, after.as_secs()),
            None => reason,
        };
        Some(Error::RateLimited {
            message,
            retry_after: self.retry_after,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierUsage<N> {
    pub used: N,
    pub limit: N,
    /// Rounded to the nearest whole percent.
    pub percentage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageStats {
    pub minute: TierUsage<u32>,
    pub hour: TierUsage<u32>,
    pub day: TierUsage<u32>,
    pub cost: TierUsage<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CostEntry {
    timestamp: u64,
    cost: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedWindows {
    #[serde(default)]
    requests: Vec<u64>,
    #[serde(default)]
    costs: Vec<CostEntry>,
    config: Option<RateLimitConfig>,
}

#[derive(Debug, Default)]
struct State {
    requests: Vec<u64>,
    costs: Vec<CostEntry>,
    config: RateLimitConfig,
}

impl State {
    fn count_requests(&self, now: u64, window_ms: u64) -> u32 {
        self.requests
            .iter()
            .filter(|&&t| now.saturating_sub(t) < window_ms)
            .count() as u32
    }

    fn cost_today(&self, now: u64) -> f64 {
        self.costs
            .iter()
            .filter(|c| now.saturating_sub(c.timestamp) < DAY_MS)
            .map(|c| c.cost)
            .sum()
    }

    fn prune(&mut self, now: u64) {
        self.requests.retain(|&t| now.saturating_sub(t) < DAY_MS);
        self.costs
            .retain(|c| now.saturating_sub(c.timestamp) < DAY_MS);
    }

    fn usage(&self, now: u64) -> RateLimitUsage {
        RateLimitUsage {
            requests_this_minute: self.count_requests(now, MINUTE_MS),
            requests_this_hour: self.count_requests(now, HOUR_MS),
            requests_today: self.count_requests(now, DAY_MS),
            cost_today: self.cost_today(now),
        }
    }

    fn snapshot(&self) -> PersistedWindows {
        PersistedWindows {
            requests: tail(&self.requests, PERSISTED_REQUESTS),
            costs: tail(&self.costs, PERSISTED_COSTS),
            config: Some(self.config.clone()),
        }
    }
}

fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

fn percentage(used: f64, limit: f64) -> u32 {
    if limit <= 0.0 {
        return if used > 0.0 { 100 } else { 0 };
    }
    (used / limit * 100.0).round() as u32
}

/// Whole seconds from `now_ms` until the next local midnight.
pub fn seconds_until_midnight(now_ms: u64) -> u64 {
    let Some(now) = Local.timestamp_millis_opt(now_ms as i64).single() else {
        return DAY_MS / 1000;
    };
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|m| m.and_local_timezone(Local).earliest())
        .map(|m| (m - now).num_seconds().max(0) as u64)
        .unwrap_or(DAY_MS / 1000)
}

/// Process-wide request/cost budget.
pub struct RateLimiter {
    clock: SharedClock,
    store: Option<SharedStore>,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            store: None,
            state: Mutex::new(State {
                config,
                ..Default::default()
            }),
        }
    }

    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn config(&self) -> RateLimitConfig {
        self.state.lock().await.config.clone()
    }

    /// Evaluate the tiers in order: minute, hour, day, daily cost.
    pub async fn check_limit(&self) -> RateLimitStatus {
        let now = self.clock.now_ms();
        let mut st = self.state.lock().await;
        st.prune(now);

        let usage = st.usage(now);
        let cfg = &st.config;
        let denied = if usage.requests_this_minute >= cfg.max_requests_per_minute {
            Some((
                "Rate limit exceeded: too many requests per minute".to_string(),
                60,
            ))
        } else if usage.requests_this_hour >= cfg.max_requests_per_hour {
            Some((
                "Rate limit exceeded: too many requests per hour".to_string(),
                3600,
            ))
        } else if usage.requests_today >= cfg.max_requests_per_day {
            Some((
                "Daily request limit exceeded".to_string(),
                seconds_until_midnight(now),
            ))
        } else if usage.cost_today >= cfg.max_cost_per_day {
            Some((
                format!("Daily cost limit exceeded (${})", cfg.max_cost_per_day),
                seconds_until_midnight(now),
            ))
        } else {
            None
        };

        if let Some((ref reason, _)) = denied {
            debug!(
                reason = reason.as_str(),
                minute = usage.requests_this_minute,
                hour = usage.requests_this_hour,
                day = usage.requests_today,
                cost = usage.cost_today,
                "rate limit denied"
            );
        }

        let (allowed, reason, retry_after) = match denied {
            Some((reason, secs)) => (false, Some(reason), Some(Duration::from_secs(secs))),
            None => (true, None, None),
        };
        RateLimitStatus {
            allowed,
            reason,
            retry_after,
            usage,
            limits: cfg.clone(),
        }
    }

    /// Record one attempted call; `cost` is only tracked when positive.
    pub async fn record_request(&self, cost: f64) {
        let now = self.clock.now_ms();
        let snapshot = {
            let mut st = self.state.lock().await;
            st.requests.push(now);
            if cost > 0.0 {
                st.costs.push(CostEntry {
                    timestamp: now,
                    cost,
                });
            }
            st.snapshot()
        };
        self.save(snapshot).await;
    }

    pub async fn update_config(&self, patch: RateLimitPatch) {
        let snapshot = {
            let mut st = self.state.lock().await;
            st.config.apply(&patch);
            st.snapshot()
        };
        self.save(snapshot).await;
    }

    /// Forget all recorded requests and costs; the configuration is kept.
    pub async fn reset(&self) {
        let snapshot = {
            let mut st = self.state.lock().await;
            st.requests.clear();
            st.costs.clear();
            st.snapshot()
        };
        self.save(snapshot).await;
    }

    pub async fn usage_stats(&self) -> UsageStats {
        let now = self.clock.now_ms();
        let st = self.state.lock().await;
        let usage = st.usage(now);
        let cfg = &st.config;
        let tier = |used: u32, limit: u32| TierUsage {
            used,
            limit,
            percentage: percentage(used as f64, limit as f64),
        };
        UsageStats {
            minute: tier(usage.requests_this_minute, cfg.max_requests_per_minute),
            hour: tier(usage.requests_this_hour, cfg.max_requests_per_hour),
            day: tier(usage.requests_today, cfg.max_requests_per_day),
            cost: TierUsage {
                used: usage.cost_today,
                limit: cfg.max_cost_per_day,
                percentage: percentage(usage.cost_today, cfg.max_cost_per_day),
            },
        }
    }

    /// Restore windows and configuration from the attached store.
    pub async fn load(&self) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let mut stored = store.get(&[RATE_LIMIT_STORAGE_KEY]).await?;
        let Some(value) = stored.remove(RATE_LIMIT_STORAGE_KEY) else {
            return Ok(());
        };
        let data: PersistedWindows = serde_json::from_value(value)?;
        let mut st = self.state.lock().await;
        st.requests = data.requests;
        st.costs = data.costs;
        if let Some(config) = data.config {
            st.config = config;
        }
        debug!(
            requests = st.requests.len(),
            costs = st.costs.len(),
            "rate limiter state restored"
        );
        Ok(())
    }

    /// Check, run `f`, then record `cost` once `f` has been attempted.
    pub async fn with_rate_limit<F, Fut, T>(&self, cost: f64, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let status = self.check_limit().await;
        if let Some(err) = status.rejection() {
            return Err(err);
        }
        let result = f().await;
        self.record_request(cost).await;
        result
    }

    async fn save(&self, snapshot: PersistedWindows) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let result = match serde_json::to_value(&snapshot) {
            Ok(value) => {
                store
                    .set(HashMap::from([(RATE_LIMIT_STORAGE_KEY.to_string(), value)]))
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(store = store.name(), error = %e, "rate limiter save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, SystemClock};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn limiter(config: RateLimitConfig) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (RateLimiter::with_clock(config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_minute_window_slides() {
        let (limiter, clock) = limiter(RateLimitConfig::new().with_per_minute(3));
        for _ in 0..3 {
            limiter.record_request(0.0).await;
        }

        let denied = limiter.check_limit().await;
        assert!(!denied.allowed);
        assert_eq!(
            denied.reason.as_deref(),
            Some("Rate limit exceeded: too many requests per minute")
        );
        assert_eq!(denied.retry_after, Some(Duration::from_secs(60)));

        clock.advance(Duration::from_millis(61_000));
        let allowed = limiter.check_limit().await;
        assert!(allowed.allowed);
        assert_eq!(allowed.usage.requests_this_minute, 0);
        assert_eq!(allowed.usage.requests_this_hour, 3);
    }

    #[tokio::test]
    async fn test_window_boundary_is_exclusive() {
        let (limiter, clock) = limiter(RateLimitConfig::new().with_per_minute(1));
        limiter.record_request(0.0).await;
        clock.advance(Duration::from_millis(59_999));
        assert!(!limiter.check_limit().await.allowed);
        clock.advance(Duration::from_millis(1));
        assert!(limiter.check_limit().await.allowed);
    }

    #[tokio::test]
    async fn test_check_never_records() {
        let (limiter, _) = limiter(RateLimitConfig::new().with_per_minute(1));
        for _ in 0..5 {
            assert!(limiter.check_limit().await.allowed);
        }
    }

    #[tokio::test]
    async fn test_hour_tier() {
        let (limiter, clock) = limiter(
            RateLimitConfig::new()
                .with_per_minute(100)
                .with_per_hour(2),
        );
        limiter.record_request(0.0).await;
        clock.advance(Duration::from_secs(120));
        limiter.record_request(0.0).await;

        let status = limiter.check_limit().await;
        assert_eq!(
            status.reason.as_deref(),
            Some("Rate limit exceeded: too many requests per hour")
        );
        assert_eq!(status.retry_after, Some(Duration::from_secs(3600)));
    }

    #[tokio::test]
    async fn test_cost_ceiling() {
        let (limiter, _) = limiter(RateLimitConfig::new().with_max_cost_per_day(0.5));
        limiter.record_request(0.3).await;
        assert!(limiter.check_limit().await.allowed);
        limiter.record_request(0.25).await;

        let status = limiter.check_limit().await;
        assert!(!status.allowed);
        assert_eq!(
            status.reason.as_deref(),
            Some("Daily cost limit exceeded ($0.5)")
        );
        let secs = status.retry_after.unwrap().as_secs();
        assert!(secs <= 24 * 3600);
        assert!(matches!(
            status.rejection(),
            Some(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_usage_stats_percentages() {
        let (limiter, _) = limiter(RateLimitConfig::default());
        for _ in 0..3 {
            limiter.record_request(0.5).await;
        }
        let stats = limiter.usage_stats().await;
        assert_eq!(stats.minute.used, 3);
        assert_eq!(stats.minute.percentage, 30);
        assert_eq!(stats.hour.percentage, 3);
        assert_eq!(stats.day.percentage, 1);
        assert_eq!(stats.cost.used, 1.5);
        assert_eq!(stats.cost.percentage, 30);
    }

    #[tokio::test]
    async fn test_update_config_and_reset() {
        let (limiter, _) = limiter(RateLimitConfig::default());
        limiter.record_request(0.0).await;
        limiter
            .update_config(RateLimitPatch {
                max_requests_per_minute: Some(1),
                ..Default::default()
            })
            .await;
        assert!(!limiter.check_limit().await.allowed);
        assert_eq!(limiter.config().await.max_requests_per_hour, 100);

        limiter.reset().await;
        assert!(limiter.check_limit().await.allowed);
        assert_eq!(limiter.config().await.max_requests_per_minute, 1);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let clock = Arc::new(ManualClock::new(5_000));
        let store = Arc::new(MemoryStore::new());
        let first = RateLimiter::with_clock(RateLimitConfig::new().with_per_minute(2), clock.clone())
            .with_store(store.clone());
        first.record_request(0.1).await;
        first.record_request(0.0).await;

        let second =
            RateLimiter::with_clock(RateLimitConfig::default(), clock).with_store(store);
        second.load().await.unwrap();
        assert_eq!(second.config().await.max_requests_per_minute, 2);
        assert!(!second.check_limit().await.allowed);
    }

    #[tokio::test]
    async fn test_with_rate_limit_records_once() {
        let (limiter, _) = limiter(RateLimitConfig::new().with_per_minute(1));
        let out: Result<u32> = limiter.with_rate_limit(0.0, || async { Ok(7) }).await;
        assert_eq!(out.unwrap(), 7);

        let err = limiter
            .with_rate_limit(0.0, || async { Ok::<_, Error>(8) })
            .await
            .unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_seconds_until_midnight_bounds() {
        let now = SystemClock.now_ms();
        let secs = seconds_until_midnight(now);
        assert!(secs <= 24 * 3600);
    }
}
