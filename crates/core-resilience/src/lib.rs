//! Busguard Core Resilience: Pure-logic fault tolerance primitives
//!
//! # Overview
//!
//! This crate provides the building blocks the publish pipeline is assembled
//! from. Each primitive is independent and safe to share across tasks:
//!
//! - **Resource Pool**: Fixed-size, lazily-constructed, round-robin pool with in-place slot replacement
//! - **Keyed Client Cache**: Single-flight get-or-create of closeable resources by identity
//! - **Sliding Window Counter**: Lock-free hit counting over a trailing time window
//! - **Retry Policy**: Exponential backoff with jitter, classification and cancellation
//! - **Failover Controller**: Threshold-driven active/passive switch between two targets
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of:
//! - Brokers, SDKs or wire protocols
//! - Persistence of any kind
//! - Application-specific concerns
//!
//! Backend-specific behaviour enters only through the traits at its seams
//! ([`ResourceFactory`], [`Closeable`], [`Classify`]).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Your Application                │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Failover Controller               │  ← Which target?
//! │  (Sliding window per target, CAS trip)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Retry Policy                      │  ← Ride out transient faults
//! │  (Backoff + jitter, cancellable waits)  │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Resource Pool                     │  ← Shared connections
//! │  (Round-robin, replace on failure)      │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Keyed Client Cache                │  ← Per-entity senders
//! │  (Get-or-create, close and evict)       │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!         External Broker
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use busguard_core_resilience::prelude::*;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), RetryError<ResilienceError>> {
//! let controller = FailoverController::new(FailoverConfig {
//!     exception_threshold: 3,
//!     sliding_duration: Duration::from_secs(30),
//!     ..Default::default()
//! });
//! let retry = RetryPolicy::new(RetryConfig::default());
//! let cancel = CancellationToken::new();
//!
//! let target = controller.active();
//! let outcome = retry
//!     .execute(
//!         "orders/order-created",
//!         &cancel,
//!         |_ctx| async { Ok::<_, ResilienceError>(()) },
//!         &|e: &ResilienceError| {
//!             if e.is_transient() {
//!                 ErrorClass::Transient
//!             } else {
//!                 ErrorClass::Fatal
//!             }
//!         },
//!     )
//!     .await;
//!
//! if outcome.is_err() {
//!     controller.record_failure_for(target);
//!     if controller.should_failover_for(target) {
//!         controller.trip_from(target);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod failover;
pub mod keyed_cache;
pub mod resource_pool;
pub mod retry;
pub mod sliding_window;

// Re-export main types for convenience
pub use error::{ResilienceError, RetryError};
pub use failover::{FailbackPolicy, FailoverConfig, FailoverController, FailoverSnapshot, Target};
pub use keyed_cache::{EntityKey, KeyedClientCache};
pub use resource_pool::{Closeable, PoolConfig, PoolStats, ResourceFactory, ResourcePool};
pub use retry::{
    Classify, ErrorClass, RetryConfig, RetryContext, RetryObserver, RetryPolicy,
    TracingRetryObserver,
};
pub use sliding_window::SlidingWindowCounter;

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use busguard_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::error::{ResilienceError, RetryError};
    pub use super::failover::{FailbackPolicy, FailoverConfig, FailoverController, Target};
    pub use super::keyed_cache::{EntityKey, KeyedClientCache};
    pub use super::resource_pool::{Closeable, PoolConfig, ResourceFactory, ResourcePool};
    pub use super::retry::{Classify, ErrorClass, RetryConfig, RetryPolicy};
    pub use super::sliding_window::SlidingWindowCounter;
}
