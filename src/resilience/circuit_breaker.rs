use crate::clock::{system_clock, SharedClock};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes needed to close again.
    pub success_threshold: u32,
    /// How long the circuit stays OPEN before a trial call is allowed.
    #[serde(with = "crate::utils::serde_duration::millis", alias = "timeout_ms")]
    pub timeout: Duration,
    /// Window used by [`CircuitBreaker::failure_rate`].
    #[serde(
        with = "crate::utils::serde_duration::millis",
        alias = "monitoring_period_ms"
    )]
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    pub last_failure_time: Option<u64>,
    pub next_attempt_time: Option<u64>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_successes: u64,
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_at: Option<u64>,
    next_attempt_at: Option<u64>,
    total_requests: u64,
    total_failures: u64,
    total_successes: u64,
    failure_history: Vec<u64>,
}

impl State {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_at: None,
            next_attempt_at: None,
            total_requests: 0,
            total_failures: 0,
            total_successes: 0,
            failure_history: Vec::new(),
        }
    }

    fn reset_window(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.successes = 0;
        self.last_failure_at = None;
        self.next_attempt_at = None;
    }

    fn trip(&mut self, now: u64, timeout: Duration) {
        self.state = CircuitState::Open;
        self.next_attempt_at = Some(now.saturating_add(timeout.as_millis() as u64));
    }

    fn reset_due(&self, now: u64) -> bool {
        self.next_attempt_at.map(|t| now >= t).unwrap_or(false)
    }
}

/// Three-state circuit breaker guarding one named dependency.
///
/// - CLOSED: calls pass; consecutive failures are counted
/// - OPEN: calls are rejected with [`Error::CircuitOpen`] until the timeout elapses
/// - HALF_OPEN: trial calls pass; enough successes close, any failure re-opens
///
/// The OPEN → HALF_OPEN move happens lazily on the first call after the timeout.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    clock: SharedClock,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, cfg, system_clock())
    }

    pub fn with_clock(name: impl Into<String>, cfg: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            cfg,
            clock,
            state: Mutex::new(State::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit or reject one call. Rejections do not count as failures.
    pub fn allow(&self) -> Result<()> {
        let now = self.clock.now_ms();
        let mut st = self.lock();
        st.total_requests += 1;
        if st.state == CircuitState::Open {
            if st.reset_due(now) {
                info!(service = %self.name, "circuit breaker half-open; allowing trial call");
                st.state = CircuitState::HalfOpen;
                st.successes = 0;
            } else {
                let wait_ms = st.next_attempt_at.unwrap_or(now).saturating_sub(now);
                return Err(Error::CircuitOpen {
                    service: self.name.clone(),
                    retry_after: Duration::from_secs(wait_ms.div_ceil(1000)),
                });
            }
        }
        Ok(())
    }

    pub fn on_success(&self) {
        let mut st = self.lock();
        st.total_successes += 1;
        st.failures = 0;
        if st.state == CircuitState::HalfOpen {
            st.successes += 1;
            if st.successes >= self.cfg.success_threshold {
                info!(service = %self.name, "circuit breaker closed; service recovered");
                st.reset_window();
            }
        }
    }

    pub fn on_failure(&self) {
        let now = self.clock.now_ms();
        let period = self.cfg.monitoring_period.as_millis() as u64;
        let mut st = self.lock();
        st.total_failures += 1;
        st.failures = st.failures.saturating_add(1);
        st.last_failure_at = Some(now);
        st.failure_history.push(now);
        st.failure_history
            .retain(|&t| t > now.saturating_sub(period));

        if st.state == CircuitState::HalfOpen {
            info!(service = %self.name, "circuit breaker trial failed; re-opening");
            st.trip(now, self.cfg.timeout);
        } else if st.failures >= self.cfg.failure_threshold && st.state == CircuitState::Closed {
            info!(
                service = %self.name,
                failures = st.failures,
                threshold = self.cfg.failure_threshold,
                "circuit breaker opened"
            );
            st.trip(now, self.cfg.timeout);
        }
    }

    /// Run `f` under this breaker.
    ///
    /// A cancelled call is neither a success nor a failure.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.allow()?;
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let st = self.lock();
        CircuitBreakerStats {
            state: st.state,
            failures: st.failures,
            successes: st.successes,
            last_failure_time: st.last_failure_at,
            next_attempt_time: st.next_attempt_at,
            total_requests: st.total_requests,
            total_failures: st.total_failures,
            total_successes: st.total_successes,
        }
    }

    /// Failures within the monitoring period relative to lifetime requests, in percent.
    ///
    /// The numerator is windowed while the denominator is not, so this is a soft
    /// health signal rather than an exact ratio.
    pub fn failure_rate(&self) -> f64 {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.cfg.monitoring_period.as_millis() as u64);
        let st = self.lock();
        if st.failure_history.is_empty() || st.total_requests == 0 {
            return 0.0;
        }
        let recent = st.failure_history.iter().filter(|&&t| t > cutoff).count();
        recent as f64 / st.total_requests as f64 * 100.0
    }

    /// True when a call made now would be attempted.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now_ms();
        let st = self.lock();
        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => st.reset_due(now),
        }
    }

    pub fn force_open(&self) {
        info!(service = %self.name, "circuit breaker manually opened");
        let now = self.clock.now_ms();
        self.lock().trip(now, self.cfg.timeout);
    }

    pub fn force_close(&self) {
        info!(service = %self.name, "circuit breaker manually closed");
        self.lock().reset_window();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub state: CircuitState,
    pub available: bool,
    /// Rounded to one decimal.
    pub failure_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub services: BTreeMap<String, ServiceHealth>,
}

/// Registry of breakers keyed by service name, created lazily with a shared config.
pub struct CircuitBreakerManager {
    cfg: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self::with_clock(cfg, system_clock())
    }

    pub fn with_clock(cfg: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            cfg,
            clock,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create the breaker for `service`.
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self
            .breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
        {
            return Arc::clone(b);
        }
        let mut map = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(service.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_clock(
                service,
                self.cfg.clone(),
                Arc::clone(&self.clock),
            ))
        }))
    }

    pub async fn execute<F, Fut, T>(&self, service: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breaker(service).execute(f).await
    }

    fn snapshot(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.breakers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect()
    }

    pub fn all_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        self.snapshot()
            .into_iter()
            .map(|(name, b)| (name, b.stats()))
            .collect()
    }

    pub fn health_status(&self) -> HealthStatus {
        let mut healthy = true;
        let mut services = BTreeMap::new();
        for (name, breaker) in self.snapshot() {
            let state = breaker.state();
            let available = breaker.is_available();
            if !available || state == CircuitState::Open {
                healthy = false;
            }
            services.insert(
                name,
                ServiceHealth {
                    state,
                    available,
                    failure_rate: (breaker.failure_rate() * 10.0).round() / 10.0,
                },
            );
        }
        HealthStatus { healthy, services }
    }

    pub fn reset_all(&self) {
        for (_, breaker) in self.snapshot() {
            breaker.force_close();
        }
        info!("all circuit breakers reset");
    }
}
