//! In-process simulated broker
//!
//! Namespaces are created on first use. Each can be switched down (every
//! connect and send fails with a transient communication error), made to
//! fail its next N sends, or given a sticky fault to return. Delivered
//! messages are kept per entity for inspection.
//!
//! # Example
//!
//! ```
//! use busguard::broker::memory::MemoryBroker;
//! use busguard::broker::{
//!     BrokerConnection, BrokerConnector, EntitySender, Message, NamespaceConfig,
//! };
//!
//! # async fn example() -> Result<(), busguard::broker::BrokerError> {
//! let broker = MemoryBroker::new();
//! let namespace = NamespaceConfig::new("orders-ns", "Endpoint=memory://orders-ns");
//!
//! let connection = broker.connect(&namespace).await?;
//! let sender = connection.create_sender("order-created").await?;
//! sender.send(&Message::new("order-created", b"{}".to_vec())).await?;
//!
//! assert_eq!(broker.delivered_count("orders-ns", "order-created"), 1);
//! # Ok(())
//! # }
//! ```

use crate::broker::{
    BrokerConnection, BrokerConnector, BrokerError, EntitySender, Message, NamespaceConfig,
};
use async_trait::async_trait;
use busguard_core_resilience::Closeable;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Default maximum payload size, matching a standard-tier broker
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

#[derive(Debug)]
struct NamespaceState {
    name: String,
    down: AtomicBool,
    failures_pending: AtomicUsize,
    fault: Mutex<Option<BrokerError>>,
    latency: Mutex<Option<Duration>>,
    max_message_size: AtomicUsize,
    connects: AtomicUsize,
    sends: AtomicUsize,
    delivered: Mutex<HashMap<String, Vec<Message>>>,
}

impl NamespaceState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            down: AtomicBool::new(false),
            failures_pending: AtomicUsize::new(0),
            fault: Mutex::new(None),
            latency: Mutex::new(None),
            max_message_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
            connects: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.down.load(Ordering::SeqCst) {
            Err(BrokerError::communication(format!(
                "namespace {} is unreachable",
                self.name
            )))
        } else {
            Ok(())
        }
    }

    fn take_pending_failure(&self) -> bool {
        self.failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Simulated broker shared by every connection it opens
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    namespaces: Arc<DashMap<String, Arc<NamespaceState>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self, name: &str) -> Arc<NamespaceState> {
        let entry = self
            .namespaces
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(NamespaceState::new(name)));
        Arc::clone(entry.value())
    }

    /// Take a namespace down or bring it back
    pub fn set_down(&self, namespace: &str, down: bool) {
        self.namespace(namespace).down.store(down, Ordering::SeqCst);
    }

    pub fn is_down(&self, namespace: &str) -> bool {
        self.namespace(namespace).down.load(Ordering::SeqCst)
    }

    /// Fail the next `count` sends with a transient error
    pub fn fail_next_sends(&self, namespace: &str, count: usize) {
        self.namespace(namespace)
            .failures_pending
            .store(count, Ordering::SeqCst);
    }

    /// Return `fault` from every send until cleared with `None`
    pub fn set_fault(&self, namespace: &str, fault: Option<BrokerError>) {
        *self.namespace(namespace).fault.lock() = fault;
    }

    /// Delay every send by `latency`
    pub fn set_latency(&self, namespace: &str, latency: Option<Duration>) {
        *self.namespace(namespace).latency.lock() = latency;
    }

    pub fn set_max_message_size(&self, namespace: &str, limit: usize) {
        self.namespace(namespace)
            .max_message_size
            .store(limit, Ordering::SeqCst);
    }

    /// Messages accepted for an entity, in arrival order
    pub fn delivered(&self, namespace: &str, entity: &str) -> Vec<Message> {
        self.namespace(namespace)
            .delivered
            .lock()
            .get(&entity.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn delivered_count(&self, namespace: &str, entity: &str) -> usize {
        self.namespace(namespace)
            .delivered
            .lock()
            .get(&entity.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }

    /// Total messages accepted by a namespace across all entities
    pub fn total_delivered(&self, namespace: &str) -> usize {
        self.namespace(namespace)
            .delivered
            .lock()
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Successful connects to a namespace
    pub fn connect_count(&self, namespace: &str) -> usize {
        self.namespace(namespace).connects.load(Ordering::SeqCst)
    }

    /// Send attempts against a namespace, failed ones included
    pub fn send_attempts(&self, namespace: &str) -> usize {
        self.namespace(namespace).sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self, namespace: &NamespaceConfig) -> Result<MemoryConnection, BrokerError> {
        if namespace.connection_string.trim().is_empty() {
            return Err(BrokerError::Unauthorized(format!(
                "no credentials for namespace {}",
                namespace.name
            )));
        }

        let state = self.namespace(&namespace.name);
        state.check_reachable()?;
        let id = state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        trace!(namespace = %namespace.name, connection = id, "memory connection opened");

        Ok(MemoryConnection {
            id,
            state,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Connection to a simulated namespace
#[derive(Debug)]
pub struct MemoryConnection {
    id: usize,
    state: Arc<NamespaceState>,
    // Shared with every sender created on this connection
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    /// 1-based connection number within its namespace
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Closeable for MemoryConnection {
    type Error = BrokerError;

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Closed(format!("connection {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    type Sender = MemorySender;

    async fn create_sender(&self, entity: &str) -> Result<MemorySender, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed(format!("connection {}", self.id)));
        }
        self.state.check_reachable()?;

        Ok(MemorySender {
            entity: entity.to_string(),
            connection_id: self.id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
            connection_closed: Arc::clone(&self.closed),
        })
    }

    fn namespace(&self) -> &str {
        &self.state.name
    }
}

/// Sender bound to one simulated entity
#[derive(Debug)]
pub struct MemorySender {
    entity: String,
    connection_id: usize,
    state: Arc<NamespaceState>,
    closed: AtomicBool,
    connection_closed: Arc<AtomicBool>,
}

impl MemorySender {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Id of the connection this sender was created on
    pub fn connection_id(&self) -> usize {
        self.connection_id
    }
}

#[async_trait]
impl Closeable for MemorySender {
    type Error = BrokerError;

    async fn close(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl EntitySender for MemorySender {
    async fn send(&self, message: &Message) -> Result<(), BrokerError> {
        self.state.sends.fetch_add(1, Ordering::SeqCst);

        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.is_closed() {
            return Err(BrokerError::Closed(format!("sender for {}", self.entity)));
        }
        if self.connection_closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed(format!("connection {}", self.connection_id)));
        }
        self.state.check_reachable()?;
        if self.state.take_pending_failure() {
            return Err(BrokerError::communication("injected transient failure"));
        }
        let fault = self.state.fault.lock().clone();
        if let Some(fault) = fault {
            return Err(fault);
        }

        let limit = self.state.max_message_size.load(Ordering::SeqCst);
        if message.payload.len() > limit {
            return Err(BrokerError::MessageTooLarge {
                size: message.payload.len(),
                limit,
            });
        }

        self.state
            .delivered
            .lock()
            .entry(self.entity.to_ascii_lowercase())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    fn entity(&self) -> &str {
        &self.entity
    }
}
