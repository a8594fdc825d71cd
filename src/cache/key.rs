//! Cache key generation.

use crate::types::message::{conversation_prompt, system_prompt};
use crate::types::{ChatMessage, ChatRequest};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Deterministic request fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub hash: String,
    pub model: Option<String>,
}

impl CacheKey {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn as_str(&self) -> &str {
        &self.hash
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Derives fingerprints from (model, system prompt, user prompt).
///
/// Prompts are normalized (trimmed, whitespace runs collapsed) before hashing.
/// The hash is SHA-256 over a canonical JSON document, so keys are stable across
/// restarts and builds.
#[derive(Debug, Clone, Default)]
pub struct CacheKeyGenerator {
    salt: Option<String>,
}

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self { salt: None }
    }

    /// Mix an application-specific salt into every key (e.g. a prompt-template version).
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn generate(&self, model: &str, system_prompt: &str, user_prompt: &str) -> CacheKey {
        let mut parts: BTreeMap<&str, String> = BTreeMap::new();
        parts.insert("model", model.to_string());
        parts.insert("system", normalize(system_prompt));
        parts.insert("user", normalize(user_prompt));
        if let Some(ref s) = self.salt {
            parts.insert("salt", s.clone());
        }
        // BTreeMap<&str, String> always serializes.
        let canonical = serde_json::to_string(&parts).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let hash: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        CacheKey::new(hash).with_model(model)
    }

    pub fn for_messages(&self, model: &str, messages: &[ChatMessage]) -> CacheKey {
        self.generate(
            model,
            &system_prompt(messages),
            &conversation_prompt(messages),
        )
    }

    /// Fingerprint of a full chat request for the given model id.
    pub fn for_request(&self, model: &str, request: &ChatRequest) -> CacheKey {
        self.for_messages(model, &request.messages)
    }
}

fn normalize(prompt: &str) -> String {
    prompt.split_whitespace().collect::<Vec<_>>().join(" ")
}
