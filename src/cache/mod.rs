//! 响应缓存模块：按请求指纹缓存模型响应，减少重复调用与费用。
//!
//! # Response Caching Module
//!
//! Stores successful provider responses keyed by a deterministic fingerprint of
//! (model, system prompt, conversation), so identical requests are answered locally.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`ResponseCache`] | TTL cache with hit/miss statistics and optional persistence |
//! | [`CacheConfig`] | TTL, size bound and cost estimate per avoided call |
//! | [`CacheKeyGenerator`] | SHA-256 fingerprints over normalized prompts |
//! | [`CacheStats`] | Size, hits, misses, hit rate and estimated savings |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay::cache::{CacheConfig, CacheKeyGenerator, ResponseCache};
//! use std::time::Duration;
//!
//! # tokio_test_block(async {
//! let cache: ResponseCache<String> =
//!     ResponseCache::new(CacheConfig::default().with_ttl(Duration::from_secs(600)));
//! let key = CacheKeyGenerator::new().generate("gpt-4", "be terse", "hello");
//! cache.set(&key, "hi".to_string()).await;
//! assert_eq!(cache.get(&key).await.as_deref(), Some("hi"));
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f);
//! # }
//! ```
//!
//! Persistence is best effort: attach a [`KeyValueStore`](crate::store::KeyValueStore)
//! with [`ResponseCache::with_store`] and call [`ResponseCache::load`] once at startup.

mod key;
mod manager;

pub use key::{CacheKey, CacheKeyGenerator};
pub use manager::{
    CacheConfig, CacheEntry, CacheStats, CleanupTask, ResponseCache, CACHE_STATS_STORAGE_KEY,
    CACHE_STORAGE_KEY,
};
