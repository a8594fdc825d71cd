//! 持久化存储接口：缓存与限流器通过键值存储实现跨重启持久化。
//!
//! Key-value persistence consumed by the response cache and the rate limiter.
//!
//! The relay never owns a storage engine. Applications plug one in through
//! [`KeyValueStore`]; failures are reported as [`Error::Storage`] and the callers
//! degrade to memory-only operation.
//!
//! | Store | Description |
//! |-------|-------------|
//! | [`MemoryStore`] | Process-local map, useful for tests and ephemeral setups |
//! | [`NullStore`] | Discards writes, returns nothing |

use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch the given keys; missing keys are simply absent from the result.
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>>;
    async fn set(&self, items: HashMap<String, Value>) -> Result<()>;
    async fn remove(&self, keys: &[&str]) -> Result<()>;
    fn name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> Error {
        Error::storage_with_context(
            "memory store poisoned",
            ErrorContext::new().with_source("memory_store"),
        )
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>> {
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        Ok(keys
            .iter()
            .filter_map(|k| entries.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .extend(items);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| Self::poisoned())?;
        for k in keys {
            entries.remove(*k);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

pub struct NullStore;

impl NullStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for NullStore {
    async fn get(&self, _: &[&str]) -> Result<HashMap<String, Value>> {
        Ok(HashMap::new())
    }
    async fn set(&self, _: HashMap<String, Value>) -> Result<()> {
        Ok(())
    }
    async fn remove(&self, _: &[&str]) -> Result<()> {
        Ok(())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
