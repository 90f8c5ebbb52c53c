/*!
 * Busguard - resilient message-bus publishing
 *
 * A publish layer that keeps sends available through broker trouble:
 * - Lazily built, round-robin connection pools with grace-period replacement
 * - Per-entity sender caching
 * - Retry with exponential backoff, jitter and per-backend classification
 * - Primary/secondary failover driven by a sliding failure window
 * - A failure log for messages that could not be delivered, with replay
 *
 * The resilience primitives live in `busguard-core-resilience`; this crate
 * wires them to a broker abstraction.
 */

pub mod broker;
pub mod commands;
pub mod config;
pub mod error;
pub mod failure_log;
pub mod logging;
pub mod pipeline;
pub mod policy;

// Re-export commonly used types
pub use broker::{BrokerConnector, BrokerError, Message, NamespaceConfig};
pub use config::BusguardConfig;
pub use error::{BusguardError, PublishError, Result};
pub use failure_log::{FailedMessageRecord, FailureLog, FailureQuery, InMemoryFailureLog};
pub use pipeline::{PublishPipeline, PublishStatus, ReplayReport};
pub use policy::{BrokerRetryPolicy, HttpRetryPolicy};

pub use busguard_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
