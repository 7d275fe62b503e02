//! Integration tests against a real Redis.
//!
//! Tests use testcontainers to spin up a Redis instance and are ignored by
//! default because they need Docker: `cargo test -- --ignored`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use admissions_cache::{
    Cache, CacheStore, ChangeContext, ChangeType, Invalidator, Memoizer, MemoizerConfig,
    RateLimiter, RedisConfig, RedisStore, connect_store,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

async fn redis_store() -> Arc<RedisStore> {
    let config = RedisConfig {
        url: Some(get_redis_url().await),
        ..Default::default()
    };
    Arc::new(RedisStore::connect(&config).await.expect("connect"))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_primitives() {
    let store = redis_store().await;
    let key = format!("{}:lock", unique("statistics"));
    let ttl = Duration::from_secs(5);

    assert!(store.set_if_absent(&key, "owner-1", ttl).await.unwrap());
    assert!(!store.set_if_absent(&key, "owner-2", ttl).await.unwrap());
    assert!(!store.delete_if_equals(&key, "owner-2").await.unwrap());
    assert!(store.delete_if_equals(&key, "owner-1").await.unwrap());
    assert_eq!(store.get(&key).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_lock_expires() {
    let store = redis_store().await;
    let key = format!("{}:lock", unique("dashboard"));

    assert!(
        store
            .set_if_absent(&key, "crashed", Duration::from_millis(200))
            .await
            .unwrap()
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        store
            .set_if_absent(&key, "next", Duration::from_secs(5))
            .await
            .unwrap()
    );
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_incr_and_expire() {
    let store = redis_store().await;
    let key = unique("rate_limit:api:test");
    let ttl = Duration::from_millis(300);

    assert_eq!(store.incr_and_expire(&key, ttl).await.unwrap(), 1);
    assert_eq!(store.incr_and_expire(&key, ttl).await.unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.incr_and_expire(&key, ttl).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_scan_and_invalidate() {
    let store = redis_store().await;
    let cache = Cache::new(store.clone());
    let cohort = unique("cohort");
    let ttl = Duration::from_secs(60);

    let scoped = format!("report:cohort:{cohort}:summary");
    cache.set(&scoped, &1, ttl).await;
    cache.set("dashboard:all", &1, ttl).await;

    Invalidator::new(cache.clone())
        .invalidate_after_change(ChangeType::Enrollment, &ChangeContext::cohort(&cohort))
        .await;

    assert_eq!(cache.get::<i32>(&scoped).await, None);
    assert_eq!(cache.get::<i32>("dashboard:all").await, None);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_memoizer_stampede_across_clients() {
    let url = get_redis_url().await;
    let key = unique("statistics");
    let calls = Arc::new(AtomicUsize::new(0));

    // Separate pools stand in for separate processes.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let config = RedisConfig {
            url: Some(url.clone()),
            ..Default::default()
        };
        let store = RedisStore::connect(&config).await.expect("connect");
        let memo = Memoizer::new(Cache::new(Arc::new(store)), MemoizerConfig::default());
        let key = key.clone();
        let calls = Arc::clone(&calls);
        handles.push(tokio::spawn(async move {
            memo.get_or_compute(&key, Duration::from_secs(60), Duration::from_secs(5), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<_, std::convert::Infallible>(99)
            })
            .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), 99);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_rate_limiter_on_redis() {
    let store = redis_store().await;
    let limiter = RateLimiter::new(Cache::new(store));
    let key = unique("api:webhook");
    let now = 1_700_000_000_000;

    for _ in 0..3 {
        assert!(limiter.check_at(&key, 3, Duration::from_secs(60), now).await.allowed);
    }
    assert!(!limiter.check_at(&key, 3, Duration::from_secs(60), now).await.allowed);
}

#[tokio::test]
async fn test_unreachable_redis_falls_back_to_local() {
    let config = RedisConfig {
        url: Some("redis://127.0.0.1:1".into()),
        timeout_ms: 500,
        ..Default::default()
    };
    let store = connect_store(&config).await;
    assert_eq!(store.mode(), "local");
}

#[tokio::test]
async fn test_disabled_redis() {
    let config = RedisConfig {
        enabled: false,
        ..Default::default()
    };
    let store = connect_store(&config).await;
    assert_eq!(store.mode(), "local");
}
