//! Round-robin resource pool with lazy construction and graceful replacement
//!
//! The pool holds a fixed number of slots. Each slot starts out unresolved and
//! constructs its resource on first acquisition; concurrent first acquisitions
//! of one slot share a single construction. Slots are selected round-robin with
//! an atomic counter, so the hot path never takes a pool-wide lock.
//!
//! A resource reported as failed is swapped out of its slot immediately. The
//! old resource is closed only after a grace period, so callers still holding
//! it can finish what they are doing.
//!
//! # Example
//!
//! ```no_run
//! use busguard_core_resilience::resource_pool::{
//!     Closeable, PoolConfig, ResourceFactory, ResourcePool,
//! };
//! use busguard_core_resilience::ResilienceError;
//! use std::sync::Arc;
//!
//! struct Connection;
//!
//! #[async_trait::async_trait]
//! impl Closeable for Connection {
//!     type Error = ResilienceError;
//!     async fn close(&self) -> Result<(), ResilienceError> {
//!         Ok(())
//!     }
//! }
//!
//! struct Connector;
//!
//! #[async_trait::async_trait]
//! impl ResourceFactory<Connection> for Connector {
//!     type Error = ResilienceError;
//!     async fn create(&self) -> Result<Connection, ResilienceError> {
//!         Ok(Connection)
//!     }
//! }
//!
//! # async fn example() -> Result<(), ResilienceError> {
//! let pool = ResourcePool::new(Arc::new(Connector), PoolConfig::with_size(4));
//!
//! let conn = pool.acquire().await?;
//! // Use the connection...
//!
//! // Something went wrong with it: swap it out, close it later
//! pool.fail_resource(&conn, "socket reset");
//! # Ok(())
//! # }
//! ```

use parking_lot::RwLock;
use serde::Serialize;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default delay before a replaced resource is closed
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of slots in the pool (clamped to at least 1)
    pub size: usize,
    /// How long a replaced resource stays open before it is closed
    pub grace_period: Duration,
    /// Maximum lifetime of a resource; older resources are recycled on
    /// their next acquisition
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 1,
            grace_period: DEFAULT_GRACE_PERIOD,
            max_lifetime: None,
        }
    }
}

impl PoolConfig {
    /// Default configuration with the given number of slots
    pub fn with_size(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }
}

/// Constructs one live resource per call
#[async_trait::async_trait]
pub trait ResourceFactory<T: Send + Sync + 'static>: Send + Sync {
    /// Error raised when construction fails
    type Error: Send + 'static;

    /// Create a new resource
    async fn create(&self) -> Result<T, Self::Error>;

    /// Human-readable identity for diagnostics (e.g. a namespace name)
    fn describe(&self) -> String {
        std::any::type_name::<T>().to_string()
    }
}

/// A resource that must be released explicitly
#[async_trait::async_trait]
pub trait Closeable: Send + Sync + 'static {
    /// Error raised when closing fails
    type Error: Display + Send;

    /// Release the resource
    async fn close(&self) -> Result<(), Self::Error>;
}

#[derive(Debug)]
struct Resolved<T> {
    resource: Arc<T>,
    created_at: Instant,
}

/// One position in the pool. Replacement installs a fresh `Slot`; the old
/// one is never reset in place.
#[derive(Debug)]
struct Slot<T> {
    cell: OnceCell<Resolved<T>>,
}

impl<T> Slot<T> {
    fn unresolved() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
        })
    }
}

/// A fixed-size round-robin pool of lazily constructed resources
pub struct ResourcePool<T, E> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<T, Error = E>>,
    slots: Vec<RwLock<Arc<Slot<T>>>>,
    next: AtomicUsize,
    replaced_total: AtomicU64,
    pending_closes: Arc<AtomicUsize>,
}

impl<T, E> ResourcePool<T, E>
where
    T: Closeable,
    E: Send + 'static,
{
    /// Create a pool; no resource is constructed until first acquisition
    pub fn new<F>(factory: Arc<F>, mut config: PoolConfig) -> Self
    where
        F: ResourceFactory<T, Error = E> + 'static,
    {
        let factory: Arc<dyn ResourceFactory<T, Error = E>> = factory;
        config.size = config.size.max(1);
        let slots = (0..config.size)
            .map(|_| RwLock::new(Slot::unresolved()))
            .collect();

        Self {
            config,
            factory,
            slots,
            next: AtomicUsize::new(0),
            replaced_total: AtomicU64::new(0),
            pending_closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire the resource in the next round-robin slot.
    ///
    /// Construction errors propagate to the caller and leave the slot
    /// unresolved, so the next acquisition of that slot tries again.
    pub async fn acquire(&self) -> Result<Arc<T>, E> {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        self.acquire_slot(index).await
    }

    async fn acquire_slot(&self, index: usize) -> Result<Arc<T>, E> {
        let mut recycled = false;

        loop {
            let slot = self.slots[index].read().clone();
            let resolved = slot
                .cell
                .get_or_try_init(|| async {
                    let resource = self.factory.create().await?;
                    debug!(
                        slot = index,
                        resource = %self.factory.describe(),
                        "constructed pooled resource"
                    );
                    Ok::<_, E>(Resolved {
                        resource: Arc::new(resource),
                        created_at: Instant::now(),
                    })
                })
                .await?;

            if let Some(max_lifetime) = self.config.max_lifetime {
                if !recycled && resolved.created_at.elapsed() > max_lifetime {
                    recycled = true;
                    self.replace_slot(index, &slot, "maximum lifetime reached");
                    continue;
                }
            }

            return Ok(Arc::clone(&resolved.resource));
        }
    }

    /// Swap a failed resource out of its slot.
    ///
    /// The slot gets a fresh unresolved handle so its next acquisition builds
    /// a new resource. The failed resource is closed after the grace period.
    /// Returns false when the resource is no longer in the pool (another
    /// caller already replaced it).
    pub fn fail_resource(&self, resource: &Arc<T>, cause: &str) -> bool {
        for (index, lock) in self.slots.iter().enumerate() {
            let current = lock.read().clone();
            let holds_resource = current
                .cell
                .get()
                .is_some_and(|resolved| Arc::ptr_eq(&resolved.resource, resource));

            if holds_resource {
                return self.replace_slot(index, &current, cause);
            }
        }

        debug!(
            resource = %self.factory.describe(),
            cause,
            "failed resource already replaced"
        );
        false
    }

    /// Index of the slot currently holding `resource`
    pub fn slot_of(&self, resource: &Arc<T>) -> Option<usize> {
        self.slots.iter().position(|lock| {
            lock.read()
                .cell
                .get()
                .is_some_and(|resolved| Arc::ptr_eq(&resolved.resource, resource))
        })
    }

    /// Whether `resource` is still pooled and within its maximum lifetime.
    ///
    /// Anything derived from a resource that is no longer live should be
    /// rebuilt from a fresh [`acquire`](Self::acquire).
    pub fn is_live(&self, resource: &Arc<T>) -> bool {
        self.slots.iter().any(|lock| {
            lock.read().cell.get().is_some_and(|resolved| {
                Arc::ptr_eq(&resolved.resource, resource)
                    && self
                        .config
                        .max_lifetime
                        .map_or(true, |max| resolved.created_at.elapsed() <= max)
            })
        })
    }

    fn replace_slot(&self, index: usize, expected: &Arc<Slot<T>>, cause: &str) -> bool {
        let old = {
            let mut guard = self.slots[index].write();
            if !Arc::ptr_eq(&*guard, expected) {
                return false;
            }
            std::mem::replace(&mut *guard, Slot::unresolved())
        };
        self.replaced_total.fetch_add(1, Ordering::Relaxed);

        if let Some(resolved) = old.cell.get() {
            warn!(
                resource = %self.factory.describe(),
                slot = index,
                pool_size = self.slots.len(),
                outstanding = Arc::strong_count(&resolved.resource).saturating_sub(1),
                grace_period = ?self.config.grace_period,
                cause,
                "replacing pooled resource"
            );
            self.schedule_close(Arc::clone(&resolved.resource));
        }

        true
    }

    fn schedule_close(&self, resource: Arc<T>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    resource = %self.factory.describe(),
                    "no async runtime available, dropping replaced resource without closing it"
                );
                return;
            }
        };

        let grace_period = self.config.grace_period;
        let pending = Arc::clone(&self.pending_closes);
        let description = self.factory.describe();
        pending.fetch_add(1, Ordering::Relaxed);

        handle.spawn(async move {
            tokio::time::sleep(grace_period).await;
            match resource.close().await {
                Ok(()) => debug!(resource = %description, "closed replaced resource"),
                Err(e) => warn!(
                    resource = %description,
                    error = %e,
                    "failed to close replaced resource"
                ),
            }
            pending.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.slots.len(),
            resolved: self
                .slots
                .iter()
                .filter(|lock| lock.read().cell.initialized())
                .count(),
            replaced_total: self.replaced_total.load(Ordering::Relaxed),
            pending_closes: self.pending_closes.load(Ordering::Relaxed),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of slots
    pub size: usize,
    /// Slots holding a constructed resource
    pub resolved: usize,
    /// Resources swapped out since the pool was created
    pub replaced_total: u64,
    /// Replaced resources still waiting out their grace period
    pub pending_closes: usize,
}
