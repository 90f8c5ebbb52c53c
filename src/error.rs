/*!
 * Error types for Busguard
 */

use crate::broker::BrokerError;
use crate::failure_log::FailureLogError;
use busguard_core_resilience::Target;
use std::fmt;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BusguardError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Failure of a single publish call.
///
/// Exhaustion is normally absorbed and reported through `PublishStatus`;
/// it only shows up here as `Undelivered` when the pipeline is configured
/// to surface it.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The message is missing routing metadata
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// The broker rejected the message; it was not retried
    #[error("Fatal broker error on {target} after {attempts} attempt(s): {source}")]
    Fatal {
        target: Target,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    /// The caller cancelled the publish
    #[error("Publish cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    /// Retries were exhausted on every available target
    #[error("Message undelivered after {attempts} attempt(s) (failure log written: {logged}): {last_error}")]
    Undelivered {
        attempts: u32,
        logged: bool,
        last_error: BrokerError,
    },
}

impl PublishError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PublishError::InvalidMessage(_) | PublishError::Fatal { .. })
    }
}

#[derive(Debug, Error)]
pub enum BusguardError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Broker error outside a publish (e.g. acquiring a connection)
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Publish failed
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// Failure log error
    #[error("Failure log error: {0}")]
    FailureLog(#[from] FailureLogError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl BusguardError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            BusguardError::Config(_) | BusguardError::Io(_) => EXIT_FATAL,
            BusguardError::Publish(e) if e.is_fatal() => EXIT_FATAL,
            BusguardError::Broker(e) if !e.is_transient() => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        match self {
            BusguardError::Config(_) => true,
            BusguardError::Broker(e) => !e.is_transient(),
            BusguardError::Publish(e) => e.is_fatal(),
            BusguardError::Io(_) | BusguardError::FailureLog(_) | BusguardError::Other(_) => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            BusguardError::Config(_) => ErrorCategory::Configuration,
            BusguardError::Io(_) => ErrorCategory::IoError,
            BusguardError::Broker(_) => ErrorCategory::Network,
            BusguardError::Publish(_) => ErrorCategory::Delivery,
            BusguardError::FailureLog(_) => ErrorCategory::Persistence,
            BusguardError::Other(_) => ErrorCategory::Unknown,
        }
    }
}

impl From<toml::de::Error> for BusguardError {
    fn from(err: toml::de::Error) -> Self {
        BusguardError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for BusguardError {
    fn from(err: toml::ser::Error) -> Self {
        BusguardError::Config(format!("TOML serialize error: {}", err))
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration errors
    Configuration,
    /// I/O operation errors
    IoError,
    /// Broker connectivity errors
    Network,
    /// Message delivery errors
    Delivery,
    /// Failure log errors
    Persistence,
    /// Uncategorized errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::IoError => write!(f, "io"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Delivery => write!(f, "delivery"),
            ErrorCategory::Persistence => write!(f, "persistence"),
            ErrorCategory::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let config = BusguardError::Config("missing primary".into());
        assert_eq!(config.exit_code(), EXIT_FATAL);
        assert_eq!(
            BusguardError::Publish(PublishError::Undelivered {
                attempts: 8,
                logged: true,
                last_error: BrokerError::communication("down"),
            })
            .exit_code(),
            EXIT_PARTIAL
        );
        assert_eq!(
            BusguardError::Publish(PublishError::InvalidMessage("no entity".into())).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            BusguardError::Broker(BrokerError::Unauthorized("bad key".into())).exit_code(),
            EXIT_FATAL
        );
    }

    #[test]
    fn test_is_fatal() {
        assert!(BusguardError::Config("x".into()).is_fatal());
        assert!(!BusguardError::Broker(BrokerError::communication("reset")).is_fatal());
        assert!(BusguardError::Publish(PublishError::Fatal {
            target: Target::Primary,
            attempts: 1,
            source: BrokerError::EntityNotFound("orders".into()),
        })
        .is_fatal());
        assert!(!BusguardError::Publish(PublishError::Cancelled { attempts: 2 }).is_fatal());
    }

    #[test]
    fn test_category_display() {
        let config = BusguardError::Config("x".into());
        assert_eq!(config.category().to_string(), "configuration");
        assert_eq!(
            BusguardError::Other("x".into()).category(),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn test_toml_error_is_config() {
        let err: BusguardError = toml::from_str::<toml::Value>("not = [valid")
            .unwrap_err()
            .into();
        assert!(matches!(err, BusguardError::Config(_)));
    }

    #[test]
    fn test_publish_error_display() {
        let err = PublishError::Fatal {
            target: Target::Secondary,
            attempts: 1,
            source: BrokerError::Unauthorized("expired".into()),
        };
        assert_eq!(
            err.to_string(),
            "Fatal broker error on secondary after 1 attempt(s): Unauthorized: expired"
        );
    }
}
