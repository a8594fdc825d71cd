//! Bounded exponential backoff.
//!
//! A failed attempt is retried only when the error is classified as retryable
//! and attempts remain; otherwise the error is returned immediately with no delay.

use crate::clock::{system_clock, SharedClock};
use crate::error_code::ErrorKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether `error` on zero-based `attempt` may be retried.
pub type ShouldRetryFn = Arc<dyn Fn(&Error, u32) -> bool + Send + Sync>;
/// Observes a scheduled retry: (error, one-based retry number, delay).
pub type OnRetryFn = Arc<dyn Fn(&Error, u32, Duration) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "crate::utils::serde_duration::millis", alias = "initial_delay_ms")]
    pub initial_delay: Duration,
    #[serde(with = "crate::utils::serde_duration::millis", alias = "max_delay_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound used instead of `max_delay` for rate-limited errors.
    #[serde(
        with = "crate::utils::serde_duration::millis",
        alias = "rate_limit_max_delay_ms"
    )]
    pub rate_limit_max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            rate_limit_max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay = d;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn with_backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    pub fn with_rate_limit_max_delay(mut self, d: Duration) -> Self {
        self.rate_limit_max_delay = d;
        self
    }
}

/// Retry configuration plus optional caller hooks.
#[derive(Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
    should_retry: Option<ShouldRetryFn>,
    on_retry: Option<OnRetryFn>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("should_retry", &self.should_retry.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(config)
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            should_retry: None,
            on_retry: None,
        }
    }

    /// Replace the default classifier. Cancellation is never retried regardless.
    pub fn with_should_retry(
        mut self,
        f: impl Fn(&Error, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_retry = Some(Arc::new(f));
        self
    }

    pub fn with_on_retry(mut self, f: impl Fn(&Error, u32, Duration) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(f));
        self
    }

    fn is_retryable(&self, error: &Error, attempt: u32) -> bool {
        if error.is_cancelled() {
            return false;
        }
        match self.should_retry {
            Some(ref f) => f(error, attempt),
            None => error.kind().retryable(),
        }
    }

    /// Backoff before retry number `attempt + 1`, ignoring classification.
    pub fn backoff(&self, attempt: u32, kind: ErrorKind) -> Duration {
        let cfg = &self.config;
        let base = cfg.initial_delay.as_millis() as f64
            * cfg.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let (base, cap) = if kind == ErrorKind::RateLimited {
            (base * 2.0, cfg.rate_limit_max_delay)
        } else {
            (base, cfg.max_delay)
        };
        let cap_ms = cap.as_millis() as f64;
        Duration::from_millis(base.min(cap_ms).max(0.0) as u64)
    }

    /// Delay before retrying after `error` on zero-based `attempt`, or `None`
    /// when the error must be returned as is.
    pub fn next_delay(&self, attempt: u32, error: &Error) -> Option<Duration> {
        if attempt + 1 >= self.config.max_attempts || !self.is_retryable(error, attempt) {
            return None;
        }
        let kind = error.kind();
        let mut delay = self.backoff(attempt, kind);
        if let Some(hint) = error.retry_after() {
            let cap = if kind == ErrorKind::RateLimited {
                self.config.rate_limit_max_delay
            } else {
                self.config.max_delay
            };
            delay = delay.max(hint.min(cap));
        }
        Some(delay)
    }

    /// Run `op` until it succeeds or the policy gives up.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_counted(op).await.0
    }

    /// Like [`execute`](Self::execute), also returning how many retries were made.
    pub async fn execute_counted<F, Fut, T>(&self, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return (Ok(v), attempt),
                Err(e) => match self.next_delay(attempt, &e) {
                    Some(delay) => {
                        warn!(
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error_code = e.kind().code(),
                            error = %e,
                            "retrying operation"
                        );
                        if let Some(ref hook) = self.on_retry {
                            hook(&e, attempt + 1, delay);
                        }
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        debug!(
                            attempts = attempt + 1,
                            error_code = e.kind().code(),
                            "giving up"
                        );
                        return (Err(e), attempt);
                    }
                },
            }
        }
    }
}

/// Run `op` under `policy`.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    policy.execute(op).await
}

/// Run `op` under `policy` with an overall deadline covering every attempt and backoff.
pub async fn retry_with_timeout<F, Fut, T>(
    policy: &RetryPolicy,
    timeout: Duration,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, policy.execute(op)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { after: timeout }),
    }
}

/// Run every operation concurrently under `policy`; outcomes keep the input order.
///
/// One operation failing does not stop the others.
pub async fn retry_batch<I, F, Fut, T>(policy: &RetryPolicy, ops: I) -> Vec<Result<T>>
where
    I: IntoIterator<Item = F>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    futures::future::join_all(ops.into_iter().map(|op| policy.execute(op))).await
}

const HISTORY_LIMIT: usize = 100;
const ERROR_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy)]
struct ErrorSample {
    kind: ErrorKind,
    at: u64,
}

/// Retry handler that adapts its policy to the recent error rate.
///
/// | errors in the last minute | attempts | initial delay | max delay |
/// |---------------------------|----------|---------------|-----------|
/// | more than 10              | 2        | 5 s           | 60 s      |
/// | more than 5               | 3        | 2 s           | 30 s      |
/// | otherwise                 | 3        | 1 s           | 15 s      |
#[derive(Clone)]
pub struct SmartRetry {
    clock: SharedClock,
    history: Arc<Mutex<VecDeque<ErrorSample>>>,
}

impl Default for SmartRetry {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartRetry {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            history: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    fn record(history: &Mutex<VecDeque<ErrorSample>>, kind: ErrorKind, at: u64) {
        let mut h = history.lock().unwrap_or_else(|e| e.into_inner());
        h.push_back(ErrorSample { kind, at });
        if h.len() > HISTORY_LIMIT {
            h.pop_front();
        }
    }

    pub fn record_error(&self, error: &Error) {
        Self::record(&self.history, error.kind(), self.clock.now_ms());
    }

    /// Errors seen within the last minute, optionally of one kind only.
    pub fn error_frequency(&self, kind: Option<ErrorKind>) -> usize {
        let now = self.clock.now_ms();
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| now.saturating_sub(s.at) < ERROR_WINDOW_MS)
            .filter(|s| kind.map(|k| k == s.kind).unwrap_or(true))
            .count()
    }

    pub fn is_high_error_rate(&self, threshold: usize) -> bool {
        self.error_frequency(None) > threshold
    }

    pub fn recommended_config(&self) -> RetryConfig {
        let rate = self.error_frequency(None);
        let (attempts, initial, max) = if rate > 10 {
            (2, 5, 60)
        } else if rate > 5 {
            (3, 2, 30)
        } else {
            (3, 1, 15)
        };
        RetryConfig::default()
            .with_max_attempts(attempts)
            .with_initial_delay(Duration::from_secs(initial))
            .with_max_delay(Duration::from_secs(max))
    }

    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let history = Arc::clone(&self.history);
        let clock = Arc::clone(&self.clock);
        let policy = RetryPolicy::new(self.recommended_config()).with_on_retry(
            move |e: &Error, _, _| Self::record(&history, e.kind(), clock.now_ms()),
        );
        let result = policy.execute(op).await;
        if let Err(ref e) = result {
            self.record_error(e);
        }
        result
    }

    pub fn clear_history(&self) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
