//! Relay configuration: YAML/JSON documents plus `AI_RELAY_*` environment overrides.
//!
//! ```yaml
//! provider: openai
//! model: gpt-4
//! fallback_chain: [anthropic, gemini]
//! credentials:
//!   openai: sk-...
//!   anthropic: sk-ant-...
//! timeout_ms: 30000
//! max_retries: 3
//! rate_limit:
//!   max_requests_per_minute: 10
//! circuit_breaker:
//!   failure_threshold: 5
//!   timeout: 60000
//! ```

use crate::cache::CacheConfig;
use crate::client::pricing::ModelPricing;
use crate::resilience::{CircuitBreakerConfig, QueueConfig, RateLimitConfig, RetryConfig};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Primary provider id.
    pub provider: String,
    /// Model for the primary provider; fallbacks use their own defaults unless
    /// listed in `models`.
    pub model: Option<String>,
    /// Per-provider model overrides.
    pub models: HashMap<String, String>,
    pub temperature: f64,
    #[serde(alias = "maxTokens")]
    pub max_tokens: Option<u32>,
    /// Provider id → secret. Empty values count as missing.
    #[serde(alias = "apiKeys")]
    pub credentials: HashMap<String, String>,
    #[serde(alias = "fallbackChain")]
    pub fallback_chain: Vec<String>,
    /// Per-attempt timeout.
    #[serde(alias = "timeout", alias = "timeoutMs")]
    pub timeout_ms: u64,
    /// Retries per candidate after the first attempt.
    #[serde(alias = "maxRetries")]
    pub max_retries: u32,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    /// Extra or overriding price entries on top of the built-in table.
    pub pricing: Vec<ModelPricing>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            models: HashMap::new(),
            temperature: 0.7,
            max_tokens: None,
            credentials: HashMap::new(),
            fallback_chain: Vec::new(),
            timeout_ms: 30_000,
            max_retries: 3,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            pricing: Vec::new(),
        }
    }
}

impl RelayConfig {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// Parse a YAML (or JSON) document.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: RelayConfig = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read {}: {}", path.display(), e),
                ErrorContext::new().with_source("config_loader"),
            )
        })?;
        debug!(path = %path.display(), "loading relay config");
        Self::from_yaml_str(&raw)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(provider.into(), model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn with_credential(mut self, provider: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials.insert(provider.into(), secret.into());
        self
    }

    pub fn with_fallbacks<I, S>(mut self, chain: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_chain = chain.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_rate_limit(mut self, cfg: RateLimitConfig) -> Self {
        self.rate_limit = cfg;
        self
    }

    pub fn with_circuit_breaker(mut self, cfg: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = cfg;
        self
    }

    pub fn with_retry(mut self, cfg: RetryConfig) -> Self {
        self.retry = cfg;
        self
    }

    pub fn with_cache(mut self, cfg: CacheConfig) -> Self {
        self.cache = cfg;
        self
    }

    pub fn with_queue(mut self, cfg: QueueConfig) -> Self {
        self.queue = cfg;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Primary provider followed by the fallback chain, duplicates removed, first-seen order kept.
    pub fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(1 + self.fallback_chain.len());
        for p in std::iter::once(&self.provider).chain(self.fallback_chain.iter()) {
            if !out.iter().any(|seen| seen == p) {
                out.push(p.clone());
            }
        }
        out
    }

    /// Non-empty credential for `provider`.
    pub fn credential(&self, provider: &str) -> Option<&str> {
        self.credentials
            .get(provider)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    /// Explicitly configured model for `provider`, if any.
    pub fn model_for(&self, provider: &str) -> Option<&str> {
        self.models.get(provider).map(String::as_str).or_else(|| {
            if provider == self.provider {
                self.model.as_deref()
            } else {
                None
            }
        })
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: String| {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("config_validation"),
            ))
        };
        if self.provider.trim().is_empty() {
            return invalid("provider", "primary provider must not be empty".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(
                "temperature",
                format!("temperature must be within 0.0..=2.0, got {}", self.temperature),
            );
        }
        if self.timeout_ms == 0 {
            return invalid("timeout_ms", "timeout must be positive".into());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid(
                "circuit_breaker.failure_threshold",
                "failure threshold must be at least 1".into(),
            );
        }
        if self.cache.cleanup_interval.is_some_and(|every| every.is_zero()) {
            return invalid(
                "cache.cleanup_interval",
                "cleanup interval must be positive".into(),
            );
        }
        if self.rate_limit.max_cost_per_day < 0.0 {
            return invalid(
                "rate_limit.max_cost_per_day",
                "cost ceiling must not be negative".into(),
            );
        }
        Ok(())
    }

    /// Apply `AI_RELAY_*` environment variables on top of the current values.
    ///
    /// - `AI_RELAY_PROVIDER`, `AI_RELAY_MODEL`, `AI_RELAY_FALLBACK_CHAIN` (comma separated)
    /// - `AI_RELAY_TIMEOUT_MS`, `AI_RELAY_MAX_RETRIES`
    /// - `AI_RELAY_RPM`, `AI_RELAY_RPH`, `AI_RELAY_RPD`, `AI_RELAY_MAX_COST_PER_DAY`
    /// - `AI_RELAY_BREAKER_FAILURE_THRESHOLD`, `AI_RELAY_BREAKER_TIMEOUT_MS`
    /// - `AI_RELAY_CACHE_TTL_SECS`, `AI_RELAY_QUEUE_INTERVAL_MS`
    /// - `AI_RELAY_API_KEY_<PROVIDER>` (provider id upper-cased, `-` as `_`)
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides_from(|k| std::env::var(k).ok())
    }

    /// Same as [`apply_env_overrides`](Self::apply_env_overrides) but reading from `lookup`.
    pub fn apply_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = parsed("AI_RELAY_PROVIDER") {
            self.provider = v;
        }
        if let Some(v) = parsed("AI_RELAY_MODEL") {
            self.model = Some(v);
        }
        if let Some(v) = parsed("AI_RELAY_FALLBACK_CHAIN") {
            self.fallback_chain = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(n) = parsed("AI_RELAY_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.timeout_ms = n.max(1);
        }
        if let Some(n) = parsed("AI_RELAY_MAX_RETRIES").and_then(|s| s.parse().ok()) {
            self.max_retries = n;
        }
        if let Some(n) = parsed("AI_RELAY_RPM").and_then(|s| s.parse().ok()) {
            self.rate_limit.max_requests_per_minute = n;
        }
        if let Some(n) = parsed("AI_RELAY_RPH").and_then(|s| s.parse().ok()) {
            self.rate_limit.max_requests_per_hour = n;
        }
        if let Some(n) = parsed("AI_RELAY_RPD").and_then(|s| s.parse().ok()) {
            self.rate_limit.max_requests_per_day = n;
        }
        if let Some(c) = parsed("AI_RELAY_MAX_COST_PER_DAY").and_then(|s| s.parse().ok()) {
            self.rate_limit.max_cost_per_day = c;
        }
        if let Some(n) = parsed("AI_RELAY_BREAKER_FAILURE_THRESHOLD").and_then(|s| s.parse::<u32>().ok()) {
            self.circuit_breaker.failure_threshold = n.max(1);
        }
        if let Some(ms) = parsed("AI_RELAY_BREAKER_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.circuit_breaker.timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parsed("AI_RELAY_CACHE_TTL_SECS").and_then(|s| s.parse().ok()) {
            self.cache.default_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = parsed("AI_RELAY_QUEUE_INTERVAL_MS").and_then(|s| s.parse().ok()) {
            self.queue.min_interval = Duration::from_millis(ms);
        }
        for p in self.candidates() {
            if let Some(secret) = parsed(&credential_var(&p)) {
                self.credentials.insert(p, secret);
            }
        }
        self
    }
}

fn credential_var(provider: &str) -> String {
    format!(
        "AI_RELAY_API_KEY_{}",
        provider.replace('-', "_").to_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.temperature, 0.7);
        assert_eq!(cfg.queue.min_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_yaml_with_nested_sections() {
        let cfg = RelayConfig::from_yaml_str(
            r#"
provider: openai
model: gpt-4
fallbackChain: [anthropic, openai, gemini]
apiKeys:
  openai: sk-1
  anthropic: ""
timeout: 5000
rate_limit:
  maxRequestsPerMinute: 3
circuit_breaker:
  failure_threshold: 2
  timeout: 1000
retry:
  initial_delay: 10
cache:
  default_ttl: 120
"#,
        )
        .unwrap();
        assert_eq!(cfg.candidates(), vec!["openai", "anthropic", "gemini"]);
        assert_eq!(cfg.credential("openai"), Some("sk-1"));
        assert_eq!(cfg.credential("anthropic"), None);
        assert_eq!(cfg.credential("gemini"), None);
        assert_eq!(cfg.timeout(), Duration::from_millis(5000));
        assert_eq!(cfg.rate_limit.max_requests_per_minute, 3);
        assert_eq!(cfg.rate_limit.max_requests_per_hour, 100);
        assert_eq!(cfg.circuit_breaker.timeout, Duration::from_secs(1));
        assert_eq!(cfg.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(cfg.cache.default_ttl, Duration::from_secs(120));
        assert_eq!(cfg.model_for("openai"), Some("gpt-4"));
        assert_eq!(cfg.model_for("anthropic"), None);
    }

    #[test]
    fn test_invalid_temperature_is_rejected() {
        let err = RelayConfig::from_yaml_str("temperature: 3.5").unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("temperature")
        );
    }

    #[test]
    fn test_zero_cleanup_interval_is_rejected() {
        let err = RelayConfig::from_yaml_str("cache:\n  cleanup_interval: 0").unwrap_err();
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("cache.cleanup_interval")
        );
        assert!(RelayConfig::from_yaml_str("cache:\n  cleanup_interval: 30").is_ok());
    }

    #[test]
    fn test_malformed_yaml() {
        let err = RelayConfig::from_yaml_str("provider: [unclosed").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_overrides_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("AI_RELAY_MAX_RETRIES", "1"),
            ("AI_RELAY_FALLBACK_CHAIN", "gemini, azure-openai"),
            ("AI_RELAY_RPM", "4"),
            ("AI_RELAY_BREAKER_FAILURE_THRESHOLD", "0"),
            ("AI_RELAY_API_KEY_AZURE_OPENAI", "az-key"),
            ("AI_RELAY_TIMEOUT_MS", "not-a-number"),
        ]);
        let cfg = RelayConfig::default()
            .apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.max_retries, 1);
        assert_eq!(cfg.fallback_chain, vec!["gemini", "azure-openai"]);
        assert_eq!(cfg.rate_limit.max_requests_per_minute, 4);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 1);
        assert_eq!(cfg.credential("azure-openai"), Some("az-key"));
        assert_eq!(cfg.timeout_ms, 30_000);
    }

    #[test]
    fn test_missing_file() {
        let err = RelayConfig::from_path("/definitely/not/here.yaml").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
