/*!
 * Broker error taxonomy
 */

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by a broker connection or sender
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Network or service-side communication failure. The broker SDK may
    /// flag some of these as not worth retrying.
    #[error("Communication failure: {reason}")]
    Communication { reason: String, transient: bool },

    /// The broker did not answer in time
    #[error("Broker operation timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Queue or topic does not exist
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Payload exceeds the broker's size limit
    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The message was rejected as invalid
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The connection or sender was already closed
    #[error("{0} is closed")]
    Closed(String),
}

impl BrokerError {
    /// A transient communication failure
    pub fn communication(reason: impl Into<String>) -> Self {
        BrokerError::Communication {
            reason: reason.into(),
            transient: true,
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Communication { transient, .. } => *transient,
            BrokerError::Timeout(_) => true,
            // A fresh sender or connection clears this
            BrokerError::Closed(_) => true,
            BrokerError::Unauthorized(_)
            | BrokerError::EntityNotFound(_)
            | BrokerError::MessageTooLarge { .. }
            | BrokerError::Malformed(_) => false,
        }
    }
}
