//! Integration tests for the resilience primitives
//!
//! These tests verify that the primitives compose the way the publish
//! pipeline uses them and hold up under concurrent callers.

use busguard_core_resilience::prelude::*;
use busguard_core_resilience::{RetryContext, RetryObserver};
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

/// Test connection for integration tests
#[derive(Debug)]
struct TestConnection {
    id: usize,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl TestConnection {
    fn send(&self) -> Result<(), ResilienceError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ResilienceError::Transient(format!(
                "connection {} detached",
                self.id
            )))
        }
    }
}

#[async_trait::async_trait]
impl Closeable for TestConnection {
    type Error = ResilienceError;

    async fn close(&self) -> Result<(), ResilienceError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Test connection factory
struct TestConnectionFactory {
    counter: AtomicUsize,
    should_fail: AtomicBool,
}

impl TestConnectionFactory {
    fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            should_fail: AtomicBool::new(false),
        }
    }
}

#[async_trait::async_trait]
impl ResourceFactory<TestConnection> for TestConnectionFactory {
    type Error = ResilienceError;

    async fn create(&self) -> Result<TestConnection, ResilienceError> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ResilienceError::Construction(
                "Simulated connection failure".to_string(),
            ));
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestConnection {
            id,
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    fn describe(&self) -> String {
        "test-namespace".to_string()
    }
}

#[derive(Default)]
struct CountingObserver {
    retries: AtomicUsize,
    keys: Mutex<Vec<String>>,
}

impl RetryObserver for CountingObserver {
    fn on_retry(&self, _error: &dyn Display, _delay: Duration, context: &RetryContext) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().push(context.operation_key.clone());
    }
}

fn classify(error: &ResilienceError) -> ErrorClass {
    if error.is_transient() {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

fn quick_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        jitter_factor: 0.0,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_pool_round_robin_visits_every_slot() {
    let factory = Arc::new(TestConnectionFactory::new());
    let pool = ResourcePool::new(factory, PoolConfig::with_size(3));

    let mut slots = Vec::new();
    for _ in 0..4 {
        let conn = pool.acquire().await.unwrap();
        slots.push(pool.slot_of(&conn).unwrap());
    }

    assert_eq!(slots, vec![0, 1, 2, 0]);
}

#[tokio::test]
async fn test_concurrent_first_acquisitions_share_one_construction() {
    let factory = Arc::new(TestConnectionFactory::new());
    let pool = Arc::new(ResourcePool::new(factory.clone(), PoolConfig::with_size(2)));

    let acquisitions = (0..64).map(|_| {
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await.unwrap() }
    });
    let connections = join_all(acquisitions).await;

    assert_eq!(connections.len(), 64);
    assert_eq!(factory.counter.load(Ordering::SeqCst), 2);
    assert_eq!(pool.stats().resolved, 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_replaces_failed_connection_and_recovers() {
    let factory = Arc::new(TestConnectionFactory::new());
    let pool = ResourcePool::new(factory.clone(), PoolConfig::with_size(1));
    let retry = RetryPolicy::new(quick_retry(2));

    let first = pool.acquire().await.unwrap();
    first.healthy.store(false, Ordering::SeqCst);

    let shared = &pool;
    let result = retry
        .execute(
            "ns/orders",
            &CancellationToken::new(),
            |_ctx| async move {
                let pool = shared;
                let conn = pool.acquire().await?;
                conn.send().map_err(|e| {
                    pool.fail_resource(&conn, &e.to_string());
                    e
                })?;
                Ok::<_, ResilienceError>(conn.id)
            },
            &classify,
        )
        .await;

    assert_eq!(result.unwrap(), 2);
    assert_eq!(pool.stats().replaced_total, 1);
    assert_eq!(pool.stats().pending_closes, 1);

    // The replaced connection stays open until the grace period elapses
    assert!(!first.closed.load(Ordering::SeqCst));
    let past_grace = pool.config().grace_period + Duration::from_secs(1);
    tokio::time::sleep(past_grace).await;
    assert!(first.closed.load(Ordering::SeqCst));
    assert_eq!(pool.stats().pending_closes, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_drives_failover() {
    let observer = Arc::new(CountingObserver::default());
    let retry = RetryPolicy::new(quick_retry(2)).with_observer(observer.clone());
    let controller = FailoverController::new(FailoverConfig {
        exception_threshold: 1,
        sliding_duration: Duration::from_secs(30),
        ..Default::default()
    });
    let cancel = CancellationToken::new();

    let target = controller.active();
    let outcome: Result<(), _> = retry
        .execute(
            "ns/orders",
            &cancel,
            |_ctx| async move {
                match target {
                    Target::Primary => Err(ResilienceError::Transient("primary down".into())),
                    Target::Secondary => Ok(()),
                }
            },
            &classify,
        )
        .await;

    let err = outcome.unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(err.attempts(), 3);
    assert_eq!(observer.retries.load(Ordering::SeqCst), 2);

    controller.record_failure_for(target);
    assert!(controller.should_failover_for(target));
    assert!(controller.trip_from(target));

    let fallback = controller.active();
    assert_eq!(fallback, Target::Secondary);
    let outcome: Result<(), ResilienceError> = retry
        .execute(
            "ns/orders",
            &cancel,
            |_ctx| async move {
                match fallback {
                    Target::Primary => Err(ResilienceError::Transient("primary down".into())),
                    Target::Secondary => Ok(()),
                }
            },
            &classify,
        )
        .await
        .map_err(|e| e.into_last_error().unwrap());
    assert!(outcome.is_ok());
    assert!(observer.keys.lock().iter().all(|k| k == "ns/orders"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishers_trip_once() {
    let controller = Arc::new(FailoverController::new(FailoverConfig {
        exception_threshold: 4,
        sliding_duration: Duration::from_secs(60),
        ..Default::default()
    }));

    let failures = (0..32).map(|_| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.record_failure_for(Target::Primary) })
    });
    join_all(failures).await;

    // Every publisher saw the primary fail and races to trip it
    let trippers = (0..32).map(|_| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            controller.should_failover_for(Target::Primary)
                && controller.trip_from(Target::Primary)
        })
    });

    let tripped = join_all(trippers)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();

    assert_eq!(tripped, 1);
    assert_eq!(controller.active(), Target::Secondary);
    assert_eq!(controller.trips(), 1);
    assert_eq!(controller.failure_count(Target::Primary), 32);
}

#[tokio::test]
async fn test_cache_close_and_evict_under_concurrency() {
    let cache: Arc<KeyedClientCache<EntityKey, TestConnection>> =
        Arc::new(KeyedClientCache::new());
    let factory = Arc::new(TestConnectionFactory::new());

    let lookups = (0..16).map(|i| {
        let cache = Arc::clone(&cache);
        let factory = Arc::clone(&factory);
        let topic = if i % 2 == 0 { "Orders" } else { "orders" };
        async move {
            cache
                .get_or_create(EntityKey::new("ns", topic), || factory.create())
                .await
                .unwrap()
        }
    });
    let senders = join_all(lookups).await;

    assert_eq!(factory.counter.load(Ordering::SeqCst), 1);
    assert!(senders.iter().all(|s| Arc::ptr_eq(s, &senders[0])));

    let key = EntityKey::new("NS", "ORDERS");
    assert!(cache.try_close_and_evict(&key).await);
    assert!(senders[0].closed.load(Ordering::SeqCst));
    assert!(cache.try_close_and_evict(&key).await);
    assert!(!cache.contains_key(&key));
}

#[tokio::test]
async fn test_construction_failure_does_not_poison_slot() {
    let factory = Arc::new(TestConnectionFactory::new());
    factory.should_fail.store(true, Ordering::SeqCst);
    let pool = ResourcePool::new(factory.clone(), PoolConfig::with_size(1));

    let err = assert_err!(pool.acquire().await);
    assert!(err.is_transient());
    assert_eq!(pool.stats().resolved, 0);

    factory.should_fail.store(false, Ordering::SeqCst);
    let conn = assert_ok!(pool.acquire().await);
    assert_eq!(conn.id, 1);
}

#[test]
fn test_sliding_window_concurrent_writers() {
    let counter = Arc::new(SlidingWindowCounter::new(Duration::from_secs(300)));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            scope.spawn(move || {
                for _ in 0..500 {
                    counter.increment();
                }
            });
        }
    });

    assert_eq!(counter.get_count(), 2000);
}
