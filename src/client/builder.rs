use crate::cache::{CacheKeyGenerator, ResponseCache};
use crate::client::core::{Router, RouterInner};
use crate::client::pricing::Pricing;
use crate::client::provider::ProviderRegistry;
use crate::clock::{system_clock, SharedClock};
use crate::config::RelayConfig;
use crate::resilience::{CircuitBreakerManager, RateLimiter, RequestQueue, RetryPolicy};
use crate::store::SharedStore;
use crate::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for [`Router`].
///
/// Components default to fresh instances built from the [`RelayConfig`]; pass shared
/// ones to reuse a cache, limiter or breaker registry across routers.
pub struct RouterBuilder {
    config: RelayConfig,
    registry: ProviderRegistry,
    clock: Option<SharedClock>,
    store: Option<SharedStore>,
    cache: Option<Arc<ResponseCache>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    breakers: Option<Arc<CircuitBreakerManager>>,
    queue: Option<Arc<RequestQueue>>,
    retry: Option<RetryPolicy>,
    pricing: Option<Pricing>,
}

impl RouterBuilder {
    pub fn new(config: RelayConfig, registry: ProviderRegistry) -> Self {
        Self {
            config,
            registry,
            clock: None,
            store: None,
            cache: None,
            rate_limiter: None,
            breakers: None,
            queue: None,
            retry: None,
            pricing: None,
        }
    }

    /// Clock used by components the builder creates.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist cache and rate-limit state to `store`; restored during [`build`](Self::build).
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerManager>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn queue(mut self, queue: Arc<RequestQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Replace the retry policy derived from `max_retries` and the `retry` section.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn pricing(mut self, pricing: Pricing) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub async fn build(self) -> Result<Router> {
        self.config.validate()?;
        let clock = self.clock.unwrap_or_else(system_clock);
        let config = self.config;

        for id in config.candidates() {
            if !self.registry.contains(&id) {
                warn!(provider = %id, "candidate has no registered adapter");
            }
        }

        // Only components created here are restored from the store; shared ones
        // are owned by whoever passed them in.
        let cache = match self.cache {
            Some(c) => c,
            None => {
                let mut cache = ResponseCache::with_clock(config.cache.clone(), clock.clone());
                if let Some(store) = &self.store {
                    cache = cache.with_store(store.clone());
                }
                let cache = Arc::new(cache);
                if self.store.is_some() {
                    cache.load().await;
                }
                cache
            }
        };
        let cleanup = config
            .cache
            .cleanup_interval
            .map(|every| cache.spawn_cleanup(every))
            .transpose()?;

        let rate_limiter = match self.rate_limiter {
            Some(l) => l,
            None => {
                let mut limiter = RateLimiter::with_clock(config.rate_limit.clone(), clock.clone());
                if let Some(store) = &self.store {
                    limiter = limiter.with_store(store.clone());
                }
                if let Err(e) = limiter.load().await {
                    warn!(error = %e, "could not restore rate limiter state, starting empty");
                }
                Arc::new(limiter)
            }
        };

        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakerManager::with_clock(
                config.circuit_breaker.clone(),
                clock.clone(),
            ))
        });
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(RequestQueue::new(config.queue.clone())));
        let retry = self.retry.unwrap_or_else(|| {
            RetryPolicy::new(
                config
                    .retry
                    .clone()
                    .with_max_attempts(config.max_retries.saturating_add(1)),
            )
        });
        let pricing = self.pricing.unwrap_or_else(|| {
            config
                .pricing
                .iter()
                .cloned()
                .fold(Pricing::builtin(), Pricing::with_model)
        });

        info!(
            provider = %config.provider,
            fallbacks = config.fallback_chain.len(),
            timeout_ms = config.timeout_ms,
            max_retries = config.max_retries,
            persistent = self.store.is_some(),
            "router ready"
        );

        Ok(Router {
            inner: Arc::new(RouterInner {
                config,
                registry: self.registry,
                cache,
                keys: CacheKeyGenerator::new(),
                rate_limiter,
                breakers,
                retry,
                queue,
                pricing,
                _cleanup: cleanup,
            }),
        })
    }
}
