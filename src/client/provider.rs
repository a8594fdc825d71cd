//! Provider adapters and the id → factory registry the router resolves them from.

use crate::types::{ChatMessage, ChatRequest, ChatResponse};
use crate::{BoxStream, Error, ErrorContext, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// One remote text-generation service, already bound to a credential and model.
///
/// Adapters translate [`ChatRequest`] to the provider's wire format and map failures
/// onto [`Error`] (typically [`Error::Remote`] with the HTTP status, or
/// [`Error::Network`]) so the router can classify them.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse>;

    async fn chat_stream(&self, request: &ChatRequest) -> Result<BoxStream<'static, String>>;

    /// Cheap liveness probe; the default sends a tiny chat.
    async fn test_connection(&self) -> bool {
        let probe = ChatRequest::new(vec![ChatMessage::user("Hi")]).max_tokens(5);
        self.chat(&probe).await.is_ok()
    }
}

/// Everything a factory needs to build an adapter for one call.
#[derive(Clone, PartialEq)]
pub struct ProviderContext {
    pub provider_id: String,
    pub credential: String,
    pub model: String,
    /// Configured default. The request's `params.temperature` carries the value for the call.
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for ProviderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderContext")
            .field("provider_id", &self.provider_id)
            .field("credential", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderContext) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

struct Registration {
    default_model: String,
    factory: ProviderFactory,
}

/// Capability map from provider id to adapter factory.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Registration>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` with the model used when neither the request nor the
    /// configuration names one.
    pub fn register<F>(&mut self, id: impl Into<String>, default_model: impl Into<String>, factory: F)
    where
        F: Fn(&ProviderContext) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync + 'static,
    {
        self.providers.insert(
            id.into(),
            Registration {
                default_model: default_model.into(),
                factory: Arc::new(factory),
            },
        );
    }

    pub fn with_provider<F>(mut self, id: impl Into<String>, default_model: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ProviderContext) -> Result<Arc<dyn ProviderAdapter>> + Send + Sync + 'static,
    {
        self.register(id, default_model, factory);
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn default_model(&self, id: &str) -> Option<&str> {
        self.providers.get(id).map(|r| r.default_model.as_str())
    }

    pub fn create(&self, ctx: &ProviderContext) -> Result<Arc<dyn ProviderAdapter>> {
        let reg = self.providers.get(&ctx.provider_id).ok_or_else(|| {
            Error::configuration_with_context(
                format!("Unknown provider: {}", ctx.provider_id),
                ErrorContext::new()
                    .with_field_path("provider")
                    .with_source("provider_registry"),
            )
        })?;
        (reg.factory)(ctx)
    }
}
