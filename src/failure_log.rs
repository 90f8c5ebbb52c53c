//! Failure log: terminal capture of messages the pipeline could not deliver
//!
//! The pipeline hands every undeliverable message to a [`FailureLog`] and
//! forgets about it. The log owns the record from then on and supports the
//! lookups an out-of-band replay needs: by id, by topic and by time range.
//!
//! [`InMemoryFailureLog`] is a bounded ring: once full, the oldest record is
//! dropped to make room. Durable implementations live outside this crate.
//!
//! # Example
//!
//! ```
//! use busguard::broker::Message;
//! use busguard::failure_log::{
//!     FailedMessageRecord, FailureClassification, FailureLog, FailureQuery, InMemoryFailureLog,
//! };
//!
//! # async fn example() -> Result<(), busguard::failure_log::FailureLogError> {
//! let log = InMemoryFailureLog::new(1000);
//! let record = FailedMessageRecord::new(
//!     Message::new("order-created", b"{}".to_vec()),
//!     FailureClassification::Exhausted,
//!     "namespace unreachable",
//!     4,
//!     None,
//! );
//! log.record(record).await?;
//!
//! let failed = log.query(&FailureQuery::for_topic("order-created")).await?;
//! assert_eq!(failed.len(), 1);
//! # Ok(())
//! # }
//! ```

use crate::broker::Message;
use async_trait::async_trait;
use busguard_core_resilience::Target;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Why a message ended up in the failure log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClassification {
    /// Transient failures outlasted retries on every available target
    Exhausted,
    /// The broker rejected the message outright
    Fatal,
}

impl fmt::Display for FailureClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClassification::Exhausted => write!(f, "exhausted"),
            FailureClassification::Fatal => write!(f, "fatal"),
        }
    }
}

/// A message the pipeline gave up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedMessageRecord {
    /// Record id (distinct from the message id)
    pub id: String,
    pub message: Message,
    pub classification: FailureClassification,
    pub last_error: String,
    /// Attempts made across all targets
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Target of the final attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
}

impl FailedMessageRecord {
    pub fn new(
        message: Message,
        classification: FailureClassification,
        last_error: impl Into<String>,
        attempts: u32,
        target: Option<Target>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message,
            classification,
            last_error: last_error.into(),
            attempts,
            failed_at: Utc::now(),
            target,
        }
    }
}

/// Filter for [`FailureLog::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureQuery {
    /// Entity name, matched case-insensitively
    pub topic: Option<String>,
    /// Inclusive lower bound on `failed_at`
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `failed_at`
    pub to: Option<DateTime<Utc>>,
}

impl FailureQuery {
    /// Match every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_topic(topic: impl Into<String>) -> Self {
        Self {
            topic: Some(topic.into()),
            ..Default::default()
        }
    }

    pub fn since(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn until(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn matches(&self, record: &FailedMessageRecord) -> bool {
        let topic_ok = self
            .topic
            .as_deref()
            .map_or(true, |topic| topic.eq_ignore_ascii_case(&record.message.entity));
        let from_ok = self.from.map_or(true, |from| record.failed_at >= from);
        let to_ok = self.to.map_or(true, |to| record.failed_at < to);
        topic_ok && from_ok && to_ok
    }
}

/// Errors raised by a failure log backend
#[derive(Debug, Error)]
pub enum FailureLogError {
    /// The backing store could not be reached
    #[error("Failure log unavailable: {0}")]
    Unavailable(String),
}

/// Durable sink for undeliverable messages
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Take ownership of a failed message
    async fn record(&self, record: FailedMessageRecord) -> Result<(), FailureLogError>;

    async fn get(&self, id: &str) -> Result<Option<FailedMessageRecord>, FailureLogError>;

    /// Records matching `query`, oldest first
    async fn query(
        &self,
        query: &FailureQuery,
    ) -> Result<Vec<FailedMessageRecord>, FailureLogError>;

    /// Remove a record. Returns false when no record had that id.
    async fn remove(&self, id: &str) -> Result<bool, FailureLogError>;
}

/// Bounded in-memory failure log.
///
/// Records beyond the capacity push out the oldest ones to prevent
/// unbounded memory growth.
#[derive(Debug)]
pub struct InMemoryFailureLog {
    entries: Mutex<VecDeque<FailedMessageRecord>>,
    max_capacity: usize,
    total_received: AtomicU64,
    total_dropped: AtomicU64,
}

impl InMemoryFailureLog {
    /// Create a log holding at most `max_capacity` records (minimum 1)
    pub fn new(max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_capacity.min(1024))),
            max_capacity,
            total_received: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of every record, oldest first
    pub fn entries(&self) -> Vec<FailedMessageRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return every record
    pub fn drain(&self) -> Vec<FailedMessageRecord> {
        self.entries.lock().drain(..).collect()
    }

    pub fn stats(&self) -> FailureLogStats {
        FailureLogStats {
            current_count: self.len(),
            max_capacity: self.max_capacity,
            total_received: self.total_received.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl FailureLog for InMemoryFailureLog {
    async fn record(&self, record: FailedMessageRecord) -> Result<(), FailureLogError> {
        self.total_received.fetch_add(1, Ordering::Relaxed);

        let mut entries = self.entries.lock();
        if entries.len() >= self.max_capacity {
            if let Some(dropped) = entries.pop_front() {
                self.total_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    record = %dropped.id,
                    message_id = %dropped.message.id,
                    capacity = self.max_capacity,
                    "failure log full, dropping oldest record"
                );
            }
        }
        entries.push_back(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<FailedMessageRecord>, FailureLogError> {
        Ok(self.entries.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn query(
        &self,
        query: &FailureQuery,
    ) -> Result<Vec<FailedMessageRecord>, FailureLogError> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<bool, FailureLogError> {
        let mut entries = self.entries.lock();
        match entries.iter().position(|r| r.id == id) {
            Some(index) => {
                entries.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Statistics for the in-memory failure log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureLogStats {
    /// Current number of records
    pub current_count: usize,
    /// Maximum capacity
    pub max_capacity: usize,
    /// Total records ever received
    pub total_received: u64,
    /// Total records dropped due to capacity overflow
    pub total_dropped: u64,
}
