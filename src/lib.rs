//! # ai-relay
//!
//! 面向多厂商大模型调用的弹性编排层：故障转移、重试、熔断、限流、请求串行化与响应缓存。
//!
//! Resilience orchestration for calling LLM providers through one entry point.
//!
//! ## Overview
//!
//! A [`Router`] takes a chat request and answers it from the first provider that
//! succeeds, walking the primary provider and then the configured fallback chain.
//! Every provider call is wrapped by the same stack:
//!
//! ```text
//! cache probe → rate limit → per candidate: circuit breaker → retry → queue → timeout → adapter
//! ```
//!
//! Providers themselves are out of scope: applications register
//! [`ProviderAdapter`] factories in a [`ProviderRegistry`] under a provider id.
//!
//! ## Key Features
//!
//! - **Fallback**: ordered, deduplicated candidate list; missing credentials skip a candidate
//! - **Retry**: exponential backoff that only retries transient error kinds
//! - **Circuit breaking**: one breaker per provider, shared across calls
//! - **Budgets**: minute/hour/day request windows and a daily cost ceiling
//! - **Caching**: fingerprinted responses with TTL and hit statistics
//! - **Persistence**: cache and limiter state through a pluggable [`store::KeyValueStore`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_relay::{ChatMessage, ChatRequest, ProviderRegistry, RelayConfig, Router};
//!
//! # async fn demo(registry: ProviderRegistry) -> ai_relay::Result<()> {
//! let config = RelayConfig::from_path("relay.yaml")?.apply_env_overrides();
//! let router = Router::new(config, registry).await?;
//!
//! let answer = router
//!     .chat(ChatRequest::new(vec![ChatMessage::user("Hello!")]))
//!     .await?;
//! println!("{} (via {})", answer.content(), answer.provider);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Router, builder, provider registry and pricing |
//! | [`resilience`] | Circuit breaker, rate limiter, retry and request queue |
//! | [`cache`] | Response cache and fingerprinting |
//! | [`store`] | Key-value persistence seam |
//! | [`config`] | YAML configuration and environment overrides |
//! | [`types`] | Chat request/response types |
//! | [`error_code`] | Error taxonomy |

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod error_code;
pub mod resilience;
pub mod store;
pub mod types;
pub mod utils;

pub use client::{
    ProviderAdapter, ProviderContext, ProviderRegistry, Router, RouterBuilder, RouterResponse,
};
pub use config::RelayConfig;
pub use error_code::ErrorKind;
pub use types::{ChatMessage, ChatRequest, ChatResponse, MessageRole, Usage};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
