//! Keyed Client Cache: memoized get-or-create of resources by identity
//!
//! Each key maps to a single-flight cell. Callers racing to create the same
//! key share one construction and receive the same `Arc`. A failed
//! construction leaves the cell empty so the next caller tries again.
//!
//! # Example
//!
//! ```no_run
//! use busguard_core_resilience::keyed_cache::{EntityKey, KeyedClientCache};
//! # use busguard_core_resilience::resource_pool::Closeable;
//! # struct Sender;
//! # #[async_trait::async_trait]
//! # impl Closeable for Sender {
//! #     type Error = std::convert::Infallible;
//! #     async fn close(&self) -> Result<(), Self::Error> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), std::convert::Infallible> {
//! let cache: KeyedClientCache<EntityKey, Sender> = KeyedClientCache::new();
//! let key = EntityKey::new("orders-ns", "order-created");
//!
//! let sender = cache
//!     .get_or_create(key.clone(), || async { Ok::<_, std::convert::Infallible>(Sender) })
//!     .await?;
//! assert!(cache.contains_key(&key));
//!
//! cache.try_close_and_evict(&key).await;
//! # drop(sender);
//! # Ok(())
//! # }
//! ```

use crate::resource_pool::Closeable;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Composite identity of a broker entity: namespace plus entity name.
///
/// Broker entity names are case-insensitive, so equality and hashing ignore
/// ASCII case. The original casing is kept for display.
#[derive(Debug, Clone)]
pub struct EntityKey {
    namespace: String,
    entity: String,
}

impl EntityKey {
    pub fn new(namespace: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entity: entity.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.namespace.eq_ignore_ascii_case(&other.namespace)
            && self.entity.eq_ignore_ascii_case(&other.entity)
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.namespace.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(b'/');
        for byte in self.entity.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.entity)
    }
}

/// One cache entry. `closed` is claimed by whoever closes the resource, so
/// an eviction racing the creator never closes it twice.
struct Entry<T> {
    cell: OnceCell<Arc<T>>,
    closed: AtomicBool,
}

impl<T> Entry<T> {
    fn empty() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
            closed: AtomicBool::new(false),
        })
    }

    fn claim_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Thread-safe get-or-create cache of closeable resources
pub struct KeyedClientCache<K, T> {
    entries: DashMap<K, Arc<Entry<T>>>,
}

impl<K, T> KeyedClientCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Closeable,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the cached resource for `key`, constructing it with `factory`
    /// on a miss. Concurrent callers for one key converge on one instance.
    ///
    /// If the key is evicted while the construction is in flight, the new
    /// resource is closed instead of cached. The creator still receives it,
    /// and its next use fails with whatever a closed resource reports.
    pub async fn get_or_create<F, Fut, E>(&self, key: K, factory: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        // The shard guard is released before awaiting construction.
        let entry = Arc::clone(
            self.entries
                .entry(key.clone())
                .or_insert_with(Entry::empty)
                .value(),
        );

        let result = entry
            .cell
            .get_or_try_init(|| async {
                let resource = factory().await?;
                debug!(key = %key, "created cached client");
                Ok::<_, E>(Arc::new(resource))
            })
            .await
            .map(Arc::clone);

        match result {
            Ok(resource) => {
                if !self.holds(&key, &entry) && entry.claim_close() {
                    debug!(key = %key, "key evicted during construction, closing new client");
                    if let Err(e) = resource.close().await {
                        warn!(key = %key, error = %e, "failed to close orphaned client");
                    }
                }
                Ok(resource)
            }
            Err(e) => {
                // Drop the empty entry unless another caller is still waiting on it
                self.entries.remove_if(&key, |_, current| {
                    Arc::ptr_eq(current, &entry)
                        && !current.cell.initialized()
                        && Arc::strong_count(current) == 2
                });
                Err(e)
            }
        }
    }

    fn holds(&self, key: &K, entry: &Arc<Entry<T>>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    /// Close the resource for `key` (if any) and remove it.
    ///
    /// Returns true when the key is gone afterwards, including when it was
    /// never present. Returns false only if closing the resource failed; the
    /// entry is removed either way.
    pub async fn try_close_and_evict(&self, key: &K) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => Self::close_entry(key, &entry).await,
            None => true,
        }
    }

    /// Like [`try_close_and_evict`](Self::try_close_and_evict), but only if
    /// `key` still maps to `instance`. Returns false when the key has moved
    /// on to another instance (or is gone) and nothing was evicted.
    pub async fn try_close_and_evict_instance(&self, key: &K, instance: &Arc<T>) -> bool {
        let removed = self.entries.remove_if(key, |_, entry| {
            entry
                .cell
                .get()
                .is_some_and(|current| Arc::ptr_eq(current, instance))
        });

        match removed {
            Some((_, entry)) => Self::close_entry(key, &entry).await,
            None => false,
        }
    }

    // An unresolved entry is closed by its creator once construction ends
    async fn close_entry(key: &K, entry: &Entry<T>) -> bool {
        let Some(resource) = entry.cell.get() else {
            return true;
        };
        if !entry.claim_close() {
            return true;
        }

        match resource.close().await {
            Ok(()) => {
                debug!(key = %key, "closed and evicted cached client");
                true
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to close evicted client");
                false
            }
        }
    }

    /// Whether a constructed resource is cached for `key`
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.cell.initialized())
    }

    /// Number of constructed entries
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys with a constructed resource
    pub fn keys(&self) -> Vec<K> {
        self.entries
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close and evict every entry. Returns the number of close failures.
    pub async fn close_all(&self) -> usize {
        let mut failures = 0;
        for key in self.keys() {
            if !self.try_close_and_evict(&key).await {
                failures += 1;
            }
        }
        failures
    }
}

impl<K, T> Default for KeyedClientCache<K, T>
where
    K: Eq + Hash + Clone + fmt::Display,
    T: Closeable,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;
    use std::collections::hash_map::DefaultHasher;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug)]
    struct TestSender {
        id: usize,
        closed: AtomicBool,
        fail_close: bool,
    }

    #[async_trait::async_trait]
    impl Closeable for TestSender {
        type Error = ResilienceError;

        async fn close(&self) -> Result<(), ResilienceError> {
            self.closed.store(true, Ordering::SeqCst);
            if self.fail_close {
                Err(ResilienceError::Close("link detached".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn sender(id: usize) -> TestSender {
        TestSender {
            id,
            closed: AtomicBool::new(false),
            fail_close: false,
        }
    }

    fn hash_of(key: &EntityKey) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_entity_key_is_case_insensitive() {
        let a = EntityKey::new("Orders-NS", "Order-Created");
        let b = EntityKey::new("orders-ns", "order-created");
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert_eq!(a.to_string(), "Orders-NS/Order-Created");

        let c = EntityKey::new("orders-ns", "order-updated");
        assert_ne!(a, c);
    }

    #[test]
    fn test_entity_key_components_do_not_bleed() {
        // "a/b" + "c" must not collide with "a" + "b/c" in equality
        let a = EntityKey::new("a/b", "c");
        let b = EntityKey::new("a", "b/c");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_get_or_create_memoizes() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "topic");

        let first = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(1))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(2))
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.id, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_parallel_creators_converge_on_one_instance() {
        let cache: Arc<KeyedClientCache<EntityKey, TestSender>> =
            Arc::new(KeyedClientCache::new());
        let created = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let created = Arc::clone(&created);
                tokio::spawn(async move {
                    cache
                        .get_or_create(EntityKey::new("ns", "Topic"), || async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            let id = created.fetch_add(1, Ordering::SeqCst) + 1;
                            Ok::<_, ResilienceError>(sender(id))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "topic");

        let result = cache
            .get_or_create(key.clone(), || async {
                Err::<TestSender, _>(ResilienceError::Construction("refused".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(!cache.contains_key(&key));

        let retried = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(7))
            })
            .await
            .unwrap();
        assert_eq!(retried.id, 7);
        assert!(cache.contains_key(&key));
    }

    #[tokio::test]
    async fn test_failed_creation_does_not_leave_an_entry() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();

        for name in ["no-such-topic-1", "no-such-topic-2", "no-such-topic-3"] {
            let result = cache
                .get_or_create(EntityKey::new("ns", name), || async {
                    Err::<TestSender, _>(ResilienceError::Construction("not found".to_string()))
                })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(cache.entries.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_during_construction_closes_new_client() {
        let cache: Arc<KeyedClientCache<EntityKey, TestSender>> =
            Arc::new(KeyedClientCache::new());
        let key = EntityKey::new("ns", "topic");

        let creating = {
            let cache = Arc::clone(&cache);
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_create(key, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, ResilienceError>(sender(1))
                    })
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cache.try_close_and_evict(&key).await);

        let created = creating.await.unwrap();
        assert_eq!(created.id, 1);
        assert!(created.closed.load(Ordering::SeqCst));
        assert!(!cache.contains_key(&key));
        assert_eq!(cache.close_all().await, 0);
    }

    #[tokio::test]
    async fn test_evict_instance_leaves_newer_instance_alone() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "topic");

        let stale = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(1))
            })
            .await
            .unwrap();
        assert!(cache.try_close_and_evict_instance(&key, &stale).await);
        assert!(stale.closed.load(Ordering::SeqCst));

        let current = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(2))
            })
            .await
            .unwrap();

        // A second holder of the stale instance must not evict its successor
        assert!(!cache.try_close_and_evict_instance(&key, &stale).await);
        assert!(cache.contains_key(&key));
        assert!(!current.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_and_evict() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "topic");
        let first = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(1))
            })
            .await
            .unwrap();

        assert!(cache.try_close_and_evict(&key).await);
        assert!(first.closed.load(Ordering::SeqCst));
        assert!(!cache.contains_key(&key));

        // Next lookup builds a fresh instance
        let fresh = cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(sender(2))
            })
            .await
            .unwrap();
        assert_eq!(fresh.id, 2);
    }

    #[tokio::test]
    async fn test_evict_missing_key_is_idempotent() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "never-created");

        assert!(cache.try_close_and_evict(&key).await);
        assert!(cache.try_close_and_evict(&key).await);
    }

    #[tokio::test]
    async fn test_evict_reports_close_failure() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        let key = EntityKey::new("ns", "topic");
        cache
            .get_or_create(key.clone(), || async {
                Ok::<_, ResilienceError>(TestSender {
                    id: 1,
                    closed: AtomicBool::new(false),
                    fail_close: true,
                })
            })
            .await
            .unwrap();

        assert!(!cache.try_close_and_evict(&key).await);
        assert!(!cache.contains_key(&key));
    }

    #[tokio::test]
    async fn test_close_all() {
        let cache: KeyedClientCache<EntityKey, TestSender> = KeyedClientCache::new();
        for (i, topic) in ["a", "b", "c"].iter().enumerate() {
            cache
                .get_or_create(EntityKey::new("ns", *topic), || async move {
                    Ok::<_, ResilienceError>(sender(i))
                })
                .await
                .unwrap();
        }

        assert_eq!(cache.close_all().await, 0);
        assert!(cache.is_empty());
    }
}
