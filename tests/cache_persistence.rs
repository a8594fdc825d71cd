//! Response cache expiry, statistics and store round trips.

use ai_relay::cache::{CacheConfig, CacheKeyGenerator, ResponseCache, CACHE_STORAGE_KEY};
use ai_relay::clock::{ManualClock, SharedClock};
use ai_relay::store::{KeyValueStore, MemoryStore, SharedStore};
use ai_relay::types::{ChatMessage, ChatResponse};
use std::sync::Arc;
use std::time::Duration;

fn cache_with(clock: SharedClock, store: Option<SharedStore>) -> ResponseCache {
    let cache = ResponseCache::with_clock(
        CacheConfig::new().with_ttl(Duration::from_secs(60)),
        clock,
    );
    match store {
        Some(s) => cache.with_store(s),
        None => cache,
    }
}

#[tokio::test]
async fn test_entry_expires_after_ttl() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with(clock.clone(), None);
    let key = CacheKeyGenerator::new().generate("gpt-4", "", "hello");

    cache.set(&key, ChatResponse::new("hi")).await;
    clock.advance(Duration::from_secs(59));
    assert_eq!(cache.get(&key).await.unwrap().content, "hi");

    clock.advance(Duration::from_secs(1));
    assert!(cache.get(&key).await.is_none());
    assert_eq!(cache.stats().size, 0);
}

#[tokio::test]
async fn test_repeated_hits_return_identical_data() {
    let clock = Arc::new(ManualClock::new(1_000));
    let cache = cache_with(clock, None);
    let key = CacheKeyGenerator::new().for_messages(
        "claude-3-haiku",
        &[ChatMessage::system("terse"), ChatMessage::user("2+2?")],
    );
    cache.set(&key, ChatResponse::new("4")).await;

    let first = cache.get(&key).await;
    let second = cache.get(&key).await;
    assert!(first.is_some());
    assert_eq!(first, second);

    let stats = cache.stats();
    assert_eq!(stats.hits, 2);
    assert_eq!(stats.misses, 0);
    assert_eq!(stats.hit_rate, 100.0);
    assert_eq!(stats.estimated_cost_saved, 0.0);
}

#[tokio::test]
async fn test_entries_and_counters_survive_restart() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(1_000));
    let keys = CacheKeyGenerator::new();
    let short = keys.generate("m", "", "short lived");
    let long = keys.generate("m", "", "long lived");

    {
        let cache = cache_with(clock.clone(), Some(store.clone()));
        cache
            .set_with_ttl(&short, ChatResponse::new("soon gone"), Duration::from_secs(5))
            .await;
        cache.set(&long, ChatResponse::new("still here")).await;
        assert!(cache.get(&long).await.is_some());
        assert!(cache.is_persistent());
    }
    assert!(store
        .get(&[CACHE_STORAGE_KEY])
        .await
        .unwrap()
        .contains_key(CACHE_STORAGE_KEY));

    clock.advance(Duration::from_secs(10));
    let cache = cache_with(clock.clone(), Some(store));
    assert_eq!(cache.load().await, 1);

    let stats = cache.stats();
    assert_eq!(stats.size, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(
        cache.get(&long).await.map(|r| r.content),
        Some("still here".to_string())
    );
    assert!(cache.get(&short).await.is_none());
}

#[tokio::test]
async fn test_clear_resets_everything() {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let cache = cache_with(Arc::new(ManualClock::new(0)), Some(store.clone()));
    let key = CacheKeyGenerator::new().generate("m", "", "x");
    cache.set(&key, ChatResponse::new("y")).await;
    cache.get(&key).await;

    cache.clear().await;
    assert_eq!(cache.stats(), Default::default());

    let reloaded = cache_with(Arc::new(ManualClock::new(0)), Some(store));
    reloaded.load().await;
    assert_eq!(reloaded.stats().size, 0);
    assert_eq!(reloaded.stats().hits, 0);
}
