use crate::cache::{CacheKeyGenerator, CacheStats, CleanupTask, ResponseCache};
use crate::client::pricing::Pricing;
use crate::client::provider::{ProviderAdapter, ProviderContext, ProviderRegistry};
use crate::config::RelayConfig;
use crate::resilience::{
    CircuitBreaker, CircuitBreakerManager, HealthStatus, RateLimiter, RequestQueue, RetryPolicy,
    UsageStats,
};
use crate::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::{BoxStream, Error, ErrorContext, Result};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Outcome of a successful [`Router::chat`].
#[derive(Debug, Clone, PartialEq)]
pub struct RouterResponse {
    pub response: ChatResponse,
    /// Provider that produced the answer, also for cache hits.
    pub provider: String,
    pub model: String,
    /// Retries spent on the winning provider.
    pub retry_count: u32,
    pub cached: bool,
}

impl RouterResponse {
    pub fn content(&self) -> &str {
        &self.response.content
    }
}

/// Primary + fallback orchestration over registered providers.
///
/// Each non-streaming call goes through: cache probe, one rate-limit check, then for
/// every candidate in order the circuit breaker, the retry handler, the request
/// queue and a per-attempt timeout. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Router {
    pub(crate) inner: Arc<RouterInner>,
}

pub(crate) struct RouterInner {
    pub(crate) config: RelayConfig,
    pub(crate) registry: ProviderRegistry,
    pub(crate) cache: Arc<ResponseCache>,
    pub(crate) keys: CacheKeyGenerator,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) breakers: Arc<CircuitBreakerManager>,
    pub(crate) retry: RetryPolicy,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) pricing: Pricing,
    /// Stops with the last router clone.
    pub(crate) _cleanup: Option<CleanupTask>,
}

impl Router {
    /// Build a router with default components for `config`.
    pub async fn new(config: RelayConfig, registry: ProviderRegistry) -> Result<Self> {
        crate::client::builder::RouterBuilder::new(config, registry)
            .build()
            .await
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.inner.breakers
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.inner.queue
    }

    /// Primary followed by fallbacks, deduplicated.
    pub fn candidates(&self) -> Vec<String> {
        self.inner.config.candidates()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub async fn usage_stats(&self) -> UsageStats {
        self.inner.rate_limiter.usage_stats().await
    }

    pub fn health_status(&self) -> HealthStatus {
        self.inner.breakers.health_status()
    }

    /// Send `request` to the first provider that answers.
    ///
    /// Cancelling `request.cancel` aborts the whole call, including any fallback.
    pub async fn chat(&self, request: ChatRequest) -> Result<RouterResponse> {
        let cancel = request.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!("relay_chat", request_id = %request_id);
        async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("chat cancelled");
                    Err(Error::Cancelled)
                }
                result = self.inner.chat(&request) => result,
            }
        }
        .instrument(span)
        .await
    }

    /// Convenience wrapper over [`chat`](Self::chat) for a plain message list.
    pub async fn chat_messages(&self, messages: Vec<ChatMessage>) -> Result<RouterResponse> {
        self.chat(ChatRequest::new(messages)).await
    }

    /// Stream the answer as text chunks.
    ///
    /// Streaming skips the cache, the queue and the retry handler. If a provider fails
    /// before or during its stream, the next candidate is started; chunks already
    /// yielded are not taken back. Exhaustion ends the stream with
    /// [`Error::AllProvidersFailed`].
    pub fn chat_stream(&self, request: ChatRequest) -> BoxStream<'static, String> {
        let state = StreamState {
            router: self.clone(),
            cancel: request.cancel.clone().unwrap_or_default(),
            candidates: self.candidates().into(),
            request,
            current: None,
            attempted: Vec::new(),
            last_err: None,
            admitted: false,
            invoked: false,
            done: false,
        };
        Box::pin(futures::stream::unfold(state, |mut st| async move {
            let item = st.next_item().await?;
            Some((item, st))
        }))
    }

    /// Probe `provider` (or the primary) with a minimal call. No fallback.
    pub async fn test_connection(&self, provider: Option<&str>) -> bool {
        let inner = &self.inner;
        let provider = provider.unwrap_or(&inner.config.provider);
        let probe = ChatRequest::new(vec![ChatMessage::user("Hi")]).max_tokens(5);
        let adapter = match inner.prepare(provider, &probe) {
            Ok((adapter, _)) => adapter,
            Err(e) => {
                error!(provider, error = %e, "connection test failed");
                return false;
            }
        };
        match tokio::time::timeout(inner.config.timeout(), adapter.test_connection()).await {
            Ok(ok) => {
                info!(provider, ok, "connection test finished");
                ok
            }
            Err(_) => {
                error!(
                    provider,
                    timeout_ms = inner.config.timeout_ms,
                    "connection test timed out"
                );
                false
            }
        }
    }
}

impl RouterInner {
    /// Model for `provider`: request, then per-provider config, then the primary's
    /// configured model, then the registry default.
    fn resolve_model(&self, provider: &str, request: &ChatRequest) -> Option<String> {
        request
            .params
            .model
            .clone()
            .or_else(|| self.config.model_for(provider).map(str::to_string))
            .or_else(|| self.registry.default_model(provider).map(str::to_string))
    }

    /// Build the adapter for `provider` and the request it should receive.
    fn prepare(
        &self,
        provider: &str,
        request: &ChatRequest,
    ) -> Result<(Arc<dyn ProviderAdapter>, ChatRequest)> {
        let credential = self
            .config
            .credential(provider)
            .ok_or_else(|| Error::credential_missing(provider))?;
        let model = self.resolve_model(provider, request).ok_or_else(|| {
            Error::configuration_with_context(
                format!("No model configured for provider: {}", provider),
                ErrorContext::new()
                    .with_field_path(format!("models.{}", provider))
                    .with_source("router"),
            )
        })?;
        let ctx = ProviderContext {
            provider_id: provider.to_string(),
            credential: credential.to_string(),
            model: model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };
        let adapter = self.registry.create(&ctx)?;

        let mut req = request.clone();
        req.params.model = Some(model);
        req.params.temperature.get_or_insert(self.config.temperature);
        if req.params.max_tokens.is_none() {
            req.params.max_tokens = self.config.max_tokens;
        }
        Ok((adapter, req))
    }

    /// Look for a stored answer under each candidate's model, in priority order.
    ///
    /// Answers are keyed by the model that produced them, so a hit reports that
    /// candidate rather than the primary.
    async fn cached(
        &self,
        candidates: &[String],
        request: &ChatRequest,
    ) -> Option<RouterResponse> {
        let mut owners: Vec<(&str, String)> = Vec::with_capacity(candidates.len());
        let mut keys = Vec::with_capacity(candidates.len());
        for provider in candidates {
            let Some(model) = self.resolve_model(provider, request) else {
                continue;
            };
            let key = self.keys.for_request(&model, request);
            if !keys.contains(&key) {
                owners.push((provider.as_str(), model));
                keys.push(key);
            }
        }
        let (idx, response) = self.cache.get_first(&keys).await?;
        let (provider, model) = owners.swap_remove(idx);
        debug!(provider, model = %model, "served from cache");
        Some(RouterResponse {
            response,
            provider: provider.to_string(),
            model,
            retry_count: 0,
            cached: true,
        })
    }

    async fn chat(&self, request: &ChatRequest) -> Result<RouterResponse> {
        let candidates = self.config.candidates();
        if let Some(hit) = self.cached(&candidates, request).await {
            return Ok(hit);
        }

        if let Some(err) = self.rate_limiter.check_limit().await.rejection() {
            warn!(error = %err, "rejected by local rate limit");
            return Err(err);
        }

        let calls = AtomicUsize::new(0);
        let mut attempted = Vec::with_capacity(candidates.len());
        let mut last_err: Option<Error> = None;

        for provider in &candidates {
            attempted.push(provider.clone());
            let outcome = match self.prepare(provider, request) {
                Ok((adapter, req)) => self
                    .call_provider(provider, adapter, &req, &calls)
                    .await
                    .map(|(resp, retries)| (resp, retries, req)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok((response, retry_count, req)) => {
                    let model = req.params.model.unwrap_or_default();
                    let cost = self.pricing.estimate(&model, &response.usage);
                    self.rate_limiter.record_request(cost).await;
                    let key = self.keys.for_request(&model, request);
                    self.cache.set(&key, response.clone()).await;
                    info!(
                        provider = %provider,
                        model = %model,
                        retry_count,
                        cost,
                        "chat completed"
                    );
                    return Ok(RouterResponse {
                        response,
                        provider: provider.clone(),
                        model,
                        retry_count,
                        cached: false,
                    });
                }
                Err(e) if !e.kind().fallbackable() => return Err(e),
                Err(e) => {
                    warn!(
                        provider = %provider,
                        error_code = e.kind().code(),
                        error = %e,
                        "provider failed, trying next candidate"
                    );
                    last_err = Some(e);
                }
            }
        }

        if calls.load(Ordering::SeqCst) > 0 {
            self.rate_limiter.record_request(0.0).await;
        }
        Err(Error::AllProvidersFailed {
            attempted,
            last: Box::new(last_err.unwrap_or_else(no_candidates)),
        })
    }

    /// breaker → retry → queue → timeout → adapter
    async fn call_provider(
        &self,
        provider: &str,
        adapter: Arc<dyn ProviderAdapter>,
        req: &ChatRequest,
        calls: &AtomicUsize,
    ) -> Result<(ChatResponse, u32)> {
        let timeout = self.config.timeout();
        let queue = self.queue.as_ref();
        let retry = &self.retry;
        let adapter = adapter.as_ref();
        self.breakers
            .breaker(provider)
            .execute(move || async move {
                let (result, retries) = retry
                    .execute_counted(move || {
                        queue.enqueue(move || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            call_with_timeout(adapter, req, timeout).await
                        })
                    })
                    .await;
                result.map(|resp| (resp, retries))
            })
            .await
    }
}

async fn call_with_timeout(
    adapter: &dyn ProviderAdapter,
    req: &ChatRequest,
    after: Duration,
) -> Result<ChatResponse> {
    match tokio::time::timeout(after, adapter.chat(req)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout { after }),
    }
}

fn no_candidates() -> Error {
    Error::configuration_with_context(
        "no providers configured",
        ErrorContext::new()
            .with_field_path("provider")
            .with_source("router"),
    )
}

struct ActiveStream {
    provider: String,
    breaker: Arc<CircuitBreaker>,
    stream: BoxStream<'static, String>,
}

struct StreamState {
    router: Router,
    request: ChatRequest,
    cancel: CancellationToken,
    candidates: VecDeque<String>,
    current: Option<ActiveStream>,
    attempted: Vec<String>,
    last_err: Option<Error>,
    admitted: bool,
    invoked: bool,
    done: bool,
}

impl StreamState {
    async fn next_item(&mut self) -> Option<Result<String>> {
        if self.done {
            return None;
        }
        if self.cancel.is_cancelled() {
            return self.finish(Some(Err(Error::Cancelled))).await;
        }
        if !self.admitted {
            self.admitted = true;
            let status = self.router.inner.rate_limiter.check_limit().await;
            if let Some(err) = status.rejection() {
                warn!(error = %err, "stream rejected by local rate limit");
                self.done = true;
                return Some(Err(err));
            }
        }

        loop {
            if let Some(active) = self.current.as_mut() {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Some(Err(Error::Cancelled)),
                    item = active.stream.next() => item,
                };
                match next {
                    Some(Ok(chunk)) => return Some(Ok(chunk)),
                    None => {
                        active.breaker.on_success();
                        debug!(provider = %active.provider, "stream finished");
                        self.current = None;
                        return self.finish(None).await;
                    }
                    Some(Err(e)) if e.is_cancelled() => {
                        self.current = None;
                        return self.finish(Some(Err(e))).await;
                    }
                    Some(Err(e)) => {
                        active.breaker.on_failure();
                        warn!(
                            provider = %active.provider,
                            error_code = e.kind().code(),
                            error = %e,
                            "stream failed, trying next candidate"
                        );
                        self.last_err = Some(e);
                        self.current = None;
                        continue;
                    }
                }
            }

            let Some(provider) = self.candidates.pop_front() else {
                let err = Error::AllProvidersFailed {
                    attempted: std::mem::take(&mut self.attempted),
                    last: Box::new(self.last_err.take().unwrap_or_else(no_candidates)),
                };
                return self.finish(Some(Err(err))).await;
            };
            self.attempted.push(provider.clone());
            match self.open(&provider).await {
                Ok((breaker, stream)) => {
                    self.current = Some(ActiveStream {
                        provider,
                        breaker,
                        stream,
                    });
                }
                Err(e) if e.is_cancelled() => return self.finish(Some(Err(e))).await,
                Err(e) => {
                    warn!(
                        provider = %provider,
                        error_code = e.kind().code(),
                        error = %e,
                        "could not open stream, trying next candidate"
                    );
                    self.last_err = Some(e);
                }
            }
        }
    }

    async fn open(
        &mut self,
        provider: &str,
    ) -> Result<(Arc<CircuitBreaker>, BoxStream<'static, String>)> {
        let inner = self.router.inner.clone();
        let (adapter, req) = inner.prepare(provider, &self.request)?;
        let breaker = inner.breakers.breaker(provider);
        breaker.allow()?;
        self.invoked = true;

        let timeout = inner.config.timeout();
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(timeout, adapter.chat_stream(&req)) => r,
        };
        match opened {
            Ok(Ok(stream)) => Ok((breaker, stream)),
            Ok(Err(e)) => {
                if !e.is_cancelled() {
                    breaker.on_failure();
                }
                Err(e)
            }
            Err(_) => {
                breaker.on_failure();
                Err(Error::Timeout { after: timeout })
            }
        }
    }

    async fn finish(&mut self, last: Option<Result<String>>) -> Option<Result<String>> {
        self.done = true;
        if self.invoked {
            self.router.inner.rate_limiter.record_request(0.0).await;
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::builder::RouterBuilder;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
            let model = request.params.model.clone().unwrap_or_default();
            Ok(ChatResponse::new(format!("{}:{}", model, request.conversation_prompt())))
        }

        async fn chat_stream(&self, _: &ChatRequest) -> Result<BoxStream<'static, String>> {
            Ok(Box::pin(futures::stream::iter(vec![
                Ok("a".to_string()),
                Ok("b".to_string()),
            ])))
        }
    }

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with_provider("echo", "echo-1", |_| Ok(Arc::new(Echo) as Arc<dyn ProviderAdapter>))
            .with_provider("other", "other-1", |_| Ok(Arc::new(Echo) as Arc<dyn ProviderAdapter>))
    }

    async fn router(config: RelayConfig) -> Router {
        RouterBuilder::new(config, registry()).build().await.unwrap()
    }

    #[tokio::test]
    async fn test_model_precedence() {
        let r = router(
            RelayConfig::new("echo")
                .with_model("echo-big")
                .with_provider_model("other", "other-big"),
        )
        .await;
        let plain = ChatRequest::default();
        assert_eq!(r.inner.resolve_model("echo", &plain).as_deref(), Some("echo-big"));
        assert_eq!(r.inner.resolve_model("other", &plain).as_deref(), Some("other-big"));
        assert_eq!(
            r.inner
                .resolve_model("other", &ChatRequest::default().model("forced"))
                .as_deref(),
            Some("forced")
        );
    }

    #[tokio::test]
    async fn test_prepare_fills_unset_params_from_config() {
        let r = router(
            RelayConfig::new("echo")
                .with_credential("echo", "k")
                .with_temperature(0.1)
                .with_max_tokens(256),
        )
        .await;
        let (_, req) = r.inner.prepare("echo", &ChatRequest::default()).unwrap();
        assert_eq!(req.params.temperature, Some(0.1));
        assert_eq!(req.params.max_tokens, Some(256));

        let explicit = ChatRequest::default().temperature(0.9).max_tokens(8);
        let (_, req) = r.inner.prepare("echo", &explicit).unwrap();
        assert_eq!(req.params.temperature, Some(0.9));
        assert_eq!(req.params.max_tokens, Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_is_cached() {
        let r = router(RelayConfig::new("echo").with_credential("echo", "k")).await;
        let req = ChatRequest::new(vec![ChatMessage::user("hello")]);
        let first = r.chat(req.clone()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.content(), "echo-1:hello");
        let second = r.chat(req).await.unwrap();
        assert!(second.cached);
        assert_eq!(second.response, first.response);
        assert_eq!(r.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_request() {
        let r = router(RelayConfig::new("echo").with_credential("echo", "k")).await;
        let token = CancellationToken::new();
        token.cancel();
        let err = r
            .chat(ChatRequest::default().with_cancel(token))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(r.usage_stats().await.minute.used, 0);
    }

    #[tokio::test]
    async fn test_stream_collects_chunks() {
        let r = router(RelayConfig::new("echo").with_credential("echo", "k")).await;
        let chunks: Vec<String> = r
            .chat_stream(ChatRequest::default())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_connection_without_credential() {
        let r = router(RelayConfig::new("echo")).await;
        assert!(!r.test_connection(None).await);
        let r = router(RelayConfig::new("echo").with_credential("echo", "k")).await;
        assert!(r.test_connection(Some("echo")).await);
        assert!(!r.test_connection(Some("missing")).await);
    }
}
