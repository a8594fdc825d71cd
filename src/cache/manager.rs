//! Response cache with TTL eviction and best-effort persistence.

use super::key::CacheKey;
use crate::clock::{system_clock, SharedClock};
use crate::store::SharedStore;
use crate::types::ChatResponse;
use crate::{Error, ErrorContext, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const CACHE_STORAGE_KEY: &str = "ai_response_cache";
pub const CACHE_STATS_STORAGE_KEY: &str = "ai_cache_stats";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "crate::utils::serde_duration::secs")]
    pub default_ttl: Duration,
    pub enabled: bool,
    pub max_entries: usize,
    /// Estimated provider cost avoided by one cache hit.
    pub average_unit_cost: f64,
    #[serde(with = "crate::utils::serde_duration::opt_secs")]
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60),
            enabled: true,
            max_entries: 1000,
            average_unit_cost: 0.002,
            cleanup_interval: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }
    pub fn with_average_unit_cost(mut self, cost: f64) -> Self {
        self.average_unit_cost = cost;
        self
    }
    pub fn with_cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = Some(every);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub data: T,
    pub created_at: u64,
    pub expires_at: u64,
    pub hit_count: u64,
}

impl<T> CacheEntry<T> {
    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage, rounded to one decimal.
    pub hit_rate: f64,
    /// hits × average unit cost, rounded to two decimals.
    pub estimated_cost_saved: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct Counters {
    hits: u64,
    misses: u64,
}

/// Periodic cleanup started by [`ResponseCache::spawn_cleanup`]; aborted on drop.
#[derive(Debug)]
pub struct CleanupTask {
    handle: tokio::task::JoinHandle<()>,
}

impl CleanupTask {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CleanupTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct State<T> {
    entries: HashMap<String, CacheEntry<T>>,
    counters: Counters,
}

/// Fingerprint → response cache.
///
/// - Expired entries are never returned; they are dropped on read and by [`cleanup`](Self::cleanup)
/// - Every mutation is mirrored to the optional [`KeyValueStore`](crate::store::KeyValueStore)
/// - The first persistence failure switches the cache to memory-only for the process lifetime
pub struct ResponseCache<T = ChatResponse> {
    config: CacheConfig,
    clock: SharedClock,
    store: Option<SharedStore>,
    persist: AtomicBool,
    state: Mutex<State<T>>,
}

impl<T> ResponseCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            store: None,
            persist: AtomicBool::new(false),
            state: Mutex::new(State {
                entries: HashMap::new(),
                counters: Counters::default(),
            }),
        }
    }

    pub fn with_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self.persist = AtomicBool::new(true);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some() && self.persist.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        // State stays consistent even if a holder panicked: every critical section
        // is a handful of map operations.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Restore entries and counters from the store, then drop what has expired.
    pub async fn load(&self) -> usize {
        let Some(store) = self.store.as_ref() else {
            return 0;
        };
        if !self.persist.load(Ordering::Relaxed) {
            return 0;
        }
        match store
            .get(&[CACHE_STORAGE_KEY, CACHE_STATS_STORAGE_KEY])
            .await
            .and_then(|mut stored| {
                let entries: Option<Vec<(String, CacheEntry<T>)>> = stored
                    .remove(CACHE_STORAGE_KEY)
                    .map(serde_json::from_value)
                    .transpose()?;
                let counters: Option<Counters> = stored
                    .remove(CACHE_STATS_STORAGE_KEY)
                    .map(serde_json::from_value)
                    .transpose()?;
                Ok((entries, counters))
            }) {
            Ok((entries, counters)) => {
                let mut st = self.lock();
                if let Some(entries) = entries {
                    st.entries = entries.into_iter().collect();
                }
                if let Some(counters) = counters {
                    st.counters = counters;
                }
            }
            Err(e) => self.disable_persistence("load", &e),
        }
        self.cleanup().await
    }

    pub async fn get(&self, key: &CacheKey) -> Option<T> {
        self.get_first(std::slice::from_ref(key))
            .await
            .map(|(_, data)| data)
    }

    /// Return the first live entry among `keys` together with its index.
    ///
    /// Counts as a single lookup: one hit, or one miss when nothing matches.
    /// Expired entries met on the way are dropped.
    pub async fn get_first(&self, keys: &[CacheKey]) -> Option<(usize, T)> {
        if !self.config.enabled || keys.is_empty() {
            return None;
        }
        let now = self.clock.now_ms();
        let result = {
            let mut st = self.lock();
            let mut found = None;
            for (idx, key) in keys.iter().enumerate() {
                match st.entries.get(key.as_str()).map(|e| e.is_expired(now)) {
                    None => {}
                    Some(true) => {
                        st.entries.remove(key.as_str());
                    }
                    Some(false) => {
                        found = st.entries.get_mut(key.as_str()).map(|entry| {
                            entry.hit_count += 1;
                            (idx, entry.data.clone())
                        });
                        break;
                    }
                }
            }
            if found.is_some() {
                st.counters.hits += 1;
            } else {
                st.counters.misses += 1;
            }
            found
        };
        debug!(
            keys = keys.len(),
            hit = result.as_ref().map(|(idx, _)| keys[*idx].as_str()),
            "response cache lookup"
        );
        self.save().await;
        result
    }

    pub async fn set(&self, key: &CacheKey, data: T) {
        self.set_with_ttl(key, data, self.config.default_ttl).await
    }

    pub async fn set_with_ttl(&self, key: &CacheKey, data: T, ttl: Duration) {
        if !self.config.enabled {
            return;
        }
        let now = self.clock.now_ms();
        {
            let mut st = self.lock();
            if !st.entries.contains_key(key.as_str()) {
                Self::evict_if_needed(&mut st.entries, self.config.max_entries, now);
            }
            st.entries.insert(
                key.hash.clone(),
                CacheEntry {
                    data,
                    created_at: now,
                    expires_at: now.saturating_add(ttl.as_millis() as u64),
                    hit_count: 0,
                },
            );
        }
        self.save().await;
    }

    pub async fn delete(&self, key: &CacheKey) -> bool {
        let removed = self.lock().entries.remove(key.as_str()).is_some();
        if removed {
            self.save().await;
        }
        removed
    }

    /// Drop expired entries; returns how many were removed.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = {
            let mut st = self.lock();
            let before = st.entries.len();
            st.entries.retain(|_, e| !e.is_expired(now));
            before - st.entries.len()
        };
        if removed > 0 {
            debug!(removed, "response cache cleanup");
            self.save().await;
        }
        removed
    }

    /// Remove every entry and reset the counters.
    pub async fn clear(&self) {
        {
            let mut st = self.lock();
            st.entries.clear();
            st.counters = Counters::default();
        }
        self.save().await;
    }

    pub fn stats(&self) -> CacheStats {
        let st = self.lock();
        let Counters { hits, misses } = st.counters;
        let total = hits + misses;
        let hit_rate = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        };
        CacheStats {
            size: st.entries.len(),
            hits,
            misses,
            hit_rate: (hit_rate * 10.0).round() / 10.0,
            estimated_cost_saved: (hits as f64 * self.config.average_unit_cost * 100.0).round()
                / 100.0,
        }
    }

    /// Run [`cleanup`](Self::cleanup) every `every` until the returned task is dropped.
    ///
    /// Must be called inside a tokio runtime. A zero interval is rejected.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> Result<CleanupTask> {
        if every.is_zero() {
            return Err(Error::configuration_with_context(
                "cache cleanup interval must be positive",
                ErrorContext::new()
                    .with_field_path("cache.cleanup_interval")
                    .with_source("response_cache"),
            ));
        }
        let cache = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup().await;
            }
        });
        debug!(every_ms = every.as_millis() as u64, "response cache cleanup scheduled");
        Ok(CleanupTask { handle })
    }

    fn evict_if_needed(entries: &mut HashMap<String, CacheEntry<T>>, max: usize, now: u64) {
        entries.retain(|_, e| !e.is_expired(now));
        while entries.len() >= max {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    async fn save(&self) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        if !self.persist.load(Ordering::Relaxed) {
            return;
        }
        let snapshot = {
            let st = self.lock();
            let entries: Vec<(&String, &CacheEntry<T>)> = st.entries.iter().collect();
            serde_json::to_value(&entries)
                .and_then(|e| Ok((e, serde_json::to_value(st.counters)?)))
        };
        let result = match snapshot {
            Ok((entries, counters)) => {
                store
                    .set(HashMap::from([
                        (CACHE_STORAGE_KEY.to_string(), entries),
                        (CACHE_STATS_STORAGE_KEY.to_string(), counters),
                    ]))
                    .await
            }
            Err(e) => Err(Error::from(e)),
        };
        if let Err(e) = result {
            self.disable_persistence("save", &e);
        }
    }

    fn disable_persistence(&self, op: &str, err: &Error) {
        if self.persist.swap(false, Ordering::Relaxed) {
            warn!(
                operation = op,
                store = self.store.as_ref().map(|s| s.name()).unwrap_or("none"),
                error = %err,
                "response cache persistence failed; continuing in memory only"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::{ErrorContext, Result};
    use async_trait::async_trait;
    use serde_json::Value;

    fn cache_at(clock: Arc<ManualClock>) -> ResponseCache<String> {
        ResponseCache::with_clock(CacheConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_get_after_set_until_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(clock.clone());
        let key = CacheKey::new("k");

        cache
            .set_with_ttl(&key, "v".to_string(), Duration::from_secs(10))
            .await;
        clock.advance(Duration::from_millis(9_999));
        assert_eq!(cache.get(&key).await.as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get(&key).await, None);
        assert_eq!(cache.stats().size, 0);
    }

    #[tokio::test]
    async fn test_repeated_reads_count_hits_and_do_not_mutate() {
        let cache = cache_at(Arc::new(ManualClock::new(0)));
        let key = CacheKey::new("k");
        cache.set(&key, "same".to_string()).await;

        let a = cache.get(&key).await;
        let b = cache.get(&key).await;
        assert_eq!(a, b);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn test_stats_rates() {
        let cache = cache_at(Arc::new(ManualClock::new(0)));
        let key = CacheKey::new("k");
        cache.set(&key, "v".to_string()).await;
        cache.get(&key).await;
        cache.get(&key).await;
        cache.get(&CacheKey::new("missing")).await;

        let stats = cache.stats();
        assert_eq!(stats.hit_rate, 66.7);
        assert_eq!(stats.estimated_cost_saved, 0.0);

        for _ in 0..8 {
            cache.get(&key).await;
        }
        assert_eq!(cache.stats().estimated_cost_saved, 0.02);
    }

    #[tokio::test]
    async fn test_cleanup_counts_removed() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(clock.clone());
        cache
            .set_with_ttl(&CacheKey::new("short"), "a".into(), Duration::from_secs(1))
            .await;
        cache
            .set_with_ttl(&CacheKey::new("long"), "b".into(), Duration::from_secs(100))
            .await;
        clock.advance(Duration::from_secs(5));
        assert_eq!(cache.cleanup().await, 1);
        assert_eq!(cache.stats().size, 1);
    }

    #[tokio::test]
    async fn test_clear_resets_counters() {
        let cache = cache_at(Arc::new(ManualClock::new(0)));
        let key = CacheKey::new("k");
        cache.set(&key, "v".into()).await;
        cache.get(&key).await;
        cache.clear().await;
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[tokio::test]
    async fn test_evicts_oldest_when_full() {
        let clock = Arc::new(ManualClock::new(0));
        let cache: ResponseCache<String> = ResponseCache::with_clock(
            CacheConfig::default().with_max_entries(2),
            clock.clone(),
        );
        cache.set(&CacheKey::new("a"), "1".into()).await;
        clock.advance(Duration::from_millis(1));
        cache.set(&CacheKey::new("b"), "2".into()).await;
        clock.advance(Duration::from_millis(1));
        cache.set(&CacheKey::new("c"), "3".into()).await;

        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.get(&CacheKey::new("a")).await, None);
        assert!(cache.get(&CacheKey::new("c")).await.is_some());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_transparent() {
        let cache: ResponseCache<String> = ResponseCache::with_clock(
            CacheConfig::default().with_enabled(false),
            Arc::new(ManualClock::new(0)),
        );
        let key = CacheKey::new("k");
        cache.set(&key, "v".into()).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_get_first_prefers_earliest_live_key() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_at(clock.clone());
        let (a, b, c) = (CacheKey::new("a"), CacheKey::new("b"), CacheKey::new("c"));
        cache.set_with_ttl(&a, "a".into(), Duration::from_secs(1)).await;
        cache.set(&c, "c".into()).await;

        clock.advance(Duration::from_secs(2));
        let keys = [a.clone(), b, c];
        assert_eq!(cache.get_first(&keys).await, Some((2, "c".to_string())));
        assert_eq!(cache.stats().size, 1);

        assert_eq!(cache.get_first(&keys[..2]).await, None);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_persists_and_restores() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new());
        let key = CacheKey::new("k");

        let first = cache_at(clock.clone()).with_store(store.clone());
        first.set(&key, "kept".into()).await;
        first.get(&key).await;

        let second = cache_at(clock.clone()).with_store(store.clone());
        assert_eq!(second.load().await, 0);
        assert_eq!(second.stats().hits, 1);
        assert_eq!(second.get(&key).await.as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_load_drops_expired_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new());
        let first = cache_at(clock.clone()).with_store(store.clone());
        first
            .set_with_ttl(&CacheKey::new("k"), "v".into(), Duration::from_secs(1))
            .await;

        clock.advance(Duration::from_secs(2));
        let second = cache_at(clock).with_store(store);
        assert_eq!(second.load().await, 1);
        assert_eq!(second.stats().size, 0);
    }

    struct BrokenStore;

    #[async_trait]
    impl KeyValueStore for BrokenStore {
        async fn get(&self, _: &[&str]) -> Result<HashMap<String, Value>> {
            Err(Error::storage_with_context("disk gone", ErrorContext::new()))
        }
        async fn set(&self, _: HashMap<String, Value>) -> Result<()> {
            Err(Error::storage_with_context("disk gone", ErrorContext::new()))
        }
        async fn remove(&self, _: &[&str]) -> Result<()> {
            Ok(())
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[tokio::test]
    async fn test_storage_failure_degrades_to_memory() {
        let cache = cache_at(Arc::new(ManualClock::new(0))).with_store(Arc::new(BrokenStore));
        assert!(cache.is_persistent());

        let key = CacheKey::new("k");
        cache.set(&key, "v".into()).await;
        assert!(!cache.is_persistent());
        assert_eq!(cache.get(&key).await.as_deref(), Some("v"));
    }
}
