/*!
 * Per-backend error classification
 *
 * Each backend gets its own classifier value object so the retry policy
 * itself stays backend-agnostic.
 */

use crate::broker::BrokerError;
use busguard_core_resilience::{Classify, ErrorClass};
use std::collections::BTreeSet;
use std::fmt;

/// Broker sends: retry communication failures the SDK did not flag as
/// permanent, timeouts and closed handles. Everything else is fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct BrokerRetryPolicy;

impl Classify<BrokerError> for BrokerRetryPolicy {
    fn classify(&self, error: &BrokerError) -> ErrorClass {
        if error.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

/// A failed HTTP-style call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    pub method: String,
    /// None when the request never got a response
    pub status: Option<u16>,
    pub reason: String,
}

impl HttpFailure {
    pub fn status(method: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            status: Some(status),
            reason: reason.into(),
        }
    }

    pub fn connection(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            status: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for HttpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(
                f,
                "{} failed with status {}: {}",
                self.method, status, self.reason
            ),
            None => write!(f, "{} failed: {}", self.method, self.reason),
        }
    }
}

impl std::error::Error for HttpFailure {}

/// HTTP-style backends: retry 5xx, 408 and any configured extra status
/// codes, but only for methods in the allow-list (empty list = every
/// method). Connection failures without a status are transient.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRetryPolicy {
    retry_status_codes: BTreeSet<u16>,
    retry_http_methods: BTreeSet<String>,
}

impl HttpRetryPolicy {
    pub fn new<C, M, S>(retry_status_codes: C, retry_http_methods: M) -> Self
    where
        C: IntoIterator<Item = u16>,
        M: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            retry_status_codes: retry_status_codes.into_iter().collect(),
            retry_http_methods: retry_http_methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Check if a response status is worth retrying
    pub fn is_retryable_status(&self, status: u16) -> bool {
        (500..600).contains(&status) || status == 408 || self.retry_status_codes.contains(&status)
    }

    /// Check if a request method may be retried
    pub fn is_retryable_method(&self, method: &str) -> bool {
        self.retry_http_methods.is_empty()
            || self
                .retry_http_methods
                .contains(&method.trim().to_ascii_uppercase())
    }

    pub fn retry_status_codes(&self) -> impl Iterator<Item = u16> + '_ {
        self.retry_status_codes.iter().copied()
    }

    pub fn retry_http_methods(&self) -> impl Iterator<Item = &str> {
        self.retry_http_methods.iter().map(String::as_str)
    }
}

impl Classify<HttpFailure> for HttpRetryPolicy {
    fn classify(&self, failure: &HttpFailure) -> ErrorClass {
        if !self.is_retryable_method(&failure.method) {
            return ErrorClass::Fatal;
        }

        match failure.status {
            None => ErrorClass::Transient,
            Some(status) if self.is_retryable_status(status) => ErrorClass::Transient,
            Some(_) => ErrorClass::Fatal,
        }
    }
}
