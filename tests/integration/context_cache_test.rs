//! Context sharing and concurrent acquisition.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::Barrier;
use txguard::config::ConnectionConfig;
use txguard::context::ContextCache;

use super::common::CountingFactory;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_acquire_converges_on_one_context() {
    const TASKS: usize = 16;

    let factory = Arc::new(CountingFactory::with_delay(Duration::from_millis(20)));
    let cache = Arc::new(ContextCache::new(factory.clone()));
    let config = ConnectionConfig::memory("race");
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let cache = cache.clone();
            let config = config.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                cache.acquire(&config).await
            })
        })
        .collect();

    let mut contexts = Vec::with_capacity(TASKS);
    for handle in handles {
        contexts.push(handle.await.unwrap().unwrap());
    }

    let winner = &contexts[0];
    assert!(contexts.iter().all(|c| Arc::ptr_eq(c, winner)));
    assert_eq!(winner.ref_count(), TASKS);
    assert!(!winner.is_closed());
    assert_eq!(cache.len(), 1);

    // Losing candidates are closed; exactly one service stays live.
    assert!(factory.constructed() >= 1);
    assert_eq!(factory.constructed() - factory.discarded(), 1);

    for ctx in &contexts {
        cache.release(&config, ctx).await.unwrap();
    }
    assert!(winner.is_closed());
    assert!(cache.is_empty());
    assert_eq!(factory.discarded(), factory.constructed());
}

#[tokio::test]
async fn test_sequential_acquire_builds_once() {
    let factory = Arc::new(CountingFactory::default());
    let cache = ContextCache::new(factory.clone());
    let config = ConnectionConfig::memory("seq");

    let a = cache.acquire(&config).await.unwrap();
    let b = cache.acquire(&config).await.unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(factory.constructed(), 1);
    assert_eq!(a.ref_count(), 2);

    cache.release(&config, &a).await.unwrap();
    assert!(!a.is_closed());
    assert!(cache.contains(&config));

    cache.release(&config, &b).await.unwrap();
    assert!(a.is_closed());
    assert!(!cache.contains(&config));
}

#[tokio::test]
async fn test_distinct_configs_get_distinct_contexts() {
    let factory = Arc::new(CountingFactory::default());
    let cache = ContextCache::new(factory.clone());

    let a = cache.acquire(&ConnectionConfig::memory("a")).await.unwrap();
    let b = cache.acquire(&ConnectionConfig::memory("b")).await.unwrap();

    let mut slow = ConnectionConfig::memory("a");
    slow.operation_timeout_ms = 60_000;
    let c = cache.acquire(&slow).await.unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(cache.len(), 3);
    assert_eq!(factory.constructed(), 3);
}

#[tokio::test]
async fn test_release_after_replacement_leaves_new_entry() {
    let factory = Arc::new(CountingFactory::default());
    let cache = ContextCache::new(factory.clone());
    let config = ConnectionConfig::memory("replace");

    let old = cache.acquire(&config).await.unwrap();
    assert_eq!(cache.close_all().await, 1);
    assert!(old.is_closed());

    let new = cache.acquire(&config).await.unwrap();
    assert!(!Arc::ptr_eq(&old, &new));

    // Releasing the stale context must not evict its replacement.
    cache.release(&config, &old).await.unwrap();
    assert!(cache.contains(&config));
    assert!(!new.is_closed());
}

#[tokio::test]
async fn test_close_all_ignores_references() {
    let factory = Arc::new(CountingFactory::default());
    let cache = ContextCache::new(factory.clone());

    let a = cache.acquire(&ConnectionConfig::memory("a")).await.unwrap();
    let _again = cache.acquire(&ConnectionConfig::memory("a")).await.unwrap();
    let b = cache.acquire(&ConnectionConfig::memory("b")).await.unwrap();

    assert_eq!(cache.close_all().await, 2);
    assert!(cache.is_empty());
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(factory.discarded(), 2);
}

#[tokio::test]
async fn test_failed_validation_setup_is_not_cached() {
    let factory = Arc::new(CountingFactory::default());
    let cache = ContextCache::new(factory.clone());
    let config = ConnectionConfig::memory("bad").with_validation_table("1bad name");

    let err = cache.acquire(&config).await.unwrap_err();
    assert!(err.to_string().contains("1bad name"));
    assert!(cache.is_empty());
}
