//! 弹性模式模块：提供熔断器、限流器、重试与请求串行化等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! Building blocks the router composes around every provider call. Each one is
//! usable on its own and is shared by reference (`Arc`) rather than through globals.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Three-state breaker per named dependency, plus a lazy registry |
//! | [`rate_limiter`] | Minute/hour/day sliding windows and a daily cost ceiling |
//! | [`retry`] | Bounded exponential backoff with error-kind classification |
//! | [`queue`] | One-at-a-time FIFO dispatch with minimum spacing |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: calls pass; consecutive failures are counted
//! - **Open**: calls fail fast with [`Error::CircuitOpen`](crate::Error::CircuitOpen)
//! - **Half-Open**: trial calls decide between closing and re-opening
//!
//! ```rust
//! use ai_relay::resilience::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerManager};
//! use std::time::Duration;
//!
//! let breakers = CircuitBreakerManager::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_timeout(Duration::from_secs(60)),
//! );
//! assert!(breakers.breaker("openai").is_available());
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust,no_run
//! use ai_relay::resilience::rate_limiter::{RateLimitConfig, RateLimiter};
//!
//! # async fn demo() {
//! let limiter = RateLimiter::new(RateLimitConfig::new().with_per_minute(10));
//! let status = limiter.check_limit().await;
//! if status.allowed {
//!     // make the call, then:
//!     limiter.record_request(0.002).await;
//! }
//! # }
//! ```

pub mod circuit_breaker;
pub mod queue;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerStats,
    CircuitState, HealthStatus, ServiceHealth,
};
pub use queue::{QueueConfig, RequestQueue};
pub use rate_limiter::{
    RateLimitConfig, RateLimitPatch, RateLimitStatus, RateLimitUsage, RateLimiter, TierUsage,
    UsageStats,
};
pub use retry::{
    retry_batch, retry_with_backoff, retry_with_timeout, RetryConfig, RetryPolicy, SmartRetry,
};
