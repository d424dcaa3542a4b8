//! # Caching Integration Tests
//!
//! The response cache, deduplicator and key generator working together over a
//! shared in-memory backend.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use storefront_proxy::caching::stores::{InMemoryBackend, InMemoryBackendConfig};
use storefront_proxy::caching::{
    CacheKeyGenerator, DedupClaim, KvBackend, RequestDeduplicator, RequestShape, ResponseCache,
    ResponseCacheConfig, CACHE_TAGS_METADATA,
};
use tokio::time::sleep;

fn backend() -> Arc<dyn KvBackend> {
    Arc::new(InMemoryBackend::new(InMemoryBackendConfig::default()))
}

fn tagged(tags: &str) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    metadata.insert(CACHE_TAGS_METADATA.to_string(), tags.to_string());
    metadata
}

fn key(keys: &CacheKeyGenerator, path: &str, params: &[(&str, &str)]) -> String {
    keys.generate(
        &RequestShape::new("GET", path).with_params(
            params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        ),
    )
}

#[tokio::test]
async fn test_reordered_queries_hit_the_same_entry() {
    let cache = ResponseCache::new(backend(), ResponseCacheConfig::default());
    let keys = CacheKeyGenerator::default();

    let stored_under = key(&keys, "products", &[("per_page", "10"), ("category", "15")]);
    let stored = cache
        .set(
            &stored_under,
            r#"[{"id":1}]"#.to_string(),
            Duration::from_secs(60),
            tagged("products"),
        )
        .await;

    let looked_up = key(&keys, "products", &[("category", "15"), ("per_page", "10")]);
    let entry = cache.get(&looked_up).await.expect("entry under canonical key");
    assert_eq!(entry.integrity_tag, stored.integrity_tag);

    let other_page = key(&keys, "products", &[("category", "15"), ("per_page", "20")]);
    assert!(cache.get(&other_page).await.is_none());
}

#[tokio::test]
async fn test_tag_invalidation_spares_other_resources() {
    let cache = ResponseCache::new(backend(), ResponseCacheConfig::default());
    let keys = CacheKeyGenerator::default();
    let ttl = Duration::from_secs(60);

    let list = key(&keys, "products", &[]);
    let single = key(&keys, "products/42", &[]);
    let categories = key(&keys, "categories", &[]);
    cache.set(&list, "[]".to_string(), ttl, tagged("products")).await;
    cache.set(&single, "{}".to_string(), ttl, tagged("products")).await;
    cache.set(&categories, "[]".to_string(), ttl, tagged("categories")).await;

    assert_eq!(cache.invalidate_by_tag("products").await, 2);
    assert!(cache.get(&list).await.is_none());
    assert!(cache.get(&single).await.is_none());
    assert!(cache.get(&categories).await.is_some());

    let stats = cache.stats().await;
    assert_eq!(stats.invalidations, 2);
    assert_eq!(stats.entries, Some(1));
}

#[tokio::test]
async fn test_invalidate_all_keeps_dedup_claims() {
    let shared = backend();
    let cache = ResponseCache::new(shared.clone(), ResponseCacheConfig::default());
    let keys = CacheKeyGenerator::default();

    let products = key(&keys, "products", &[]);
    cache.set(&products, "[]".to_string(), Duration::from_secs(60), tagged("products")).await;
    shared
        .set("dedup-claim:woo:GET:products?", b"1", Duration::from_secs(60))
        .await
        .unwrap();

    assert_eq!(cache.invalidate_all().await, 1);
    assert!(shared.get("dedup-claim:woo:GET:products?").await.unwrap().is_some());
}

#[tokio::test]
async fn test_expired_entry_survives_as_stale_until_grace_ends() {
    let cache = ResponseCache::new(
        backend(),
        ResponseCacheConfig {
            key_prefix: "woo:".to_string(),
            stale_grace: Duration::from_millis(200),
        },
    );

    cache
        .set("woo:GET:shop?", r#"{"currency":"EUR"}"#.to_string(), Duration::ZERO, BTreeMap::new())
        .await;

    assert!(cache.get("woo:GET:shop?").await.is_none());
    let stale = cache.get_stale("woo:GET:shop?").await.expect("stale copy");
    assert!(!stale.is_fresh());
    assert_eq!(stale.body, r#"{"currency":"EUR"}"#);

    sleep(Duration::from_millis(300)).await;
    assert!(cache.get_stale("woo:GET:shop?").await.is_none());
}

#[tokio::test]
async fn test_concurrent_misses_populate_cache_once() {
    let cache = Arc::new(ResponseCache::new(backend(), ResponseCacheConfig::default()));
    let dedup: Arc<RequestDeduplicator<String>> = Arc::new(RequestDeduplicator::new());
    let fetches = Arc::new(AtomicUsize::new(0));
    let key = "woo:GET:products?per_page=10".to_string();

    let callers = (0..8).map(|_| {
        let cache = cache.clone();
        let dedup = dedup.clone();
        let fetches = fetches.clone();
        let key = key.clone();
        async move {
            if let Some(entry) = cache.get(&key).await {
                return entry.body;
            }
            let leader_cache = cache.clone();
            let leader_key = key.clone();
            let outcome = dedup
                .deduplicate(&key, Duration::from_millis(200), move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(30)).await;
                    let body = r#"[{"id":7}]"#.to_string();
                    leader_cache
                        .set(&leader_key, body.clone(), Duration::from_secs(60), tagged("products"))
                        .await;
                    Ok(body)
                })
                .await;
            outcome.result.unwrap()
        }
    });

    let bodies = join_all(callers).await;
    assert!(bodies.iter().all(|body| body == r#"[{"id":7}]"#));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().await.writes, 1);
}

#[tokio::test]
async fn test_in_process_claim_always_wins() {
    let claim = DedupClaim::new(backend());
    assert!(claim.try_claim("woo:GET:products?", Duration::from_millis(100)).await);
    assert!(claim.try_claim("woo:GET:products?", Duration::from_millis(100)).await);
}
