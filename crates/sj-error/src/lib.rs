// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unified error taxonomy for the Swearjar pipeline.
//!
//! Every pipeline error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag) and through it an [`ErrorClass`] that decides how the caller
//! reacts: retry with backoff, reschedule, fail the item, skip the resource,
//! or unwind on cancellation. Use the builder returned by [`CoreError::new`]
//! to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorClass
// ---------------------------------------------------------------------------

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient failure; retry with backoff.
    Retryable,
    /// A dependency is temporarily missing; retry at the next scheduled pass.
    Unavailable,
    /// The item itself is bad; do not retry.
    Fatal,
    /// The resource is permanently gone (404 hour, revoked consent); record
    /// and skip.
    Terminal,
    /// Context was cancelled; unwind and finalize.
    Cancelled,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retryable => "retryable",
            Self::Unavailable => "unavailable",
            Self::Fatal => "fatal",
            Self::Terminal => "terminal",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that will not
/// change across patch releases; `err_text` columns and logs key off it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Network / upstream --
    /// TCP/TLS/transport-level failure talking to an upstream.
    NetworkTransport,
    /// Upstream answered 429 Too Many Requests.
    UpstreamThrottled,
    /// Upstream answered a 5xx status.
    UpstreamUnavailable,
    /// The hour's archive does not exist upstream (404).
    HourArchiveMissing,

    // -- Relational store --
    /// Serialization failure; the transaction should be retried.
    DbSerialization,
    /// Deadlock detected; the transaction should be retried.
    DbDeadlock,
    /// Connection-level database failure.
    DbConnection,
    /// Any other database failure.
    DbQuery,

    // -- Columnar store --
    /// ClickHouse HTTP interface returned an error.
    ColumnarQuery,
    /// ClickHouse unreachable or answered 5xx.
    ColumnarUnavailable,

    // -- Pipeline items --
    /// An event or utterance failed structural validation.
    InvalidItem,
    /// The event payload had an unknown shape for its declared type.
    PayloadShape,
    /// The archive stream was malformed at the first record.
    StreamCorrupt,

    // -- Rulepack --
    /// Rulepack JSON failed to parse or declared an unsupported version.
    RulepackInvalid,
    /// A template failed to compile after slot expansion.
    RulepackCompile,

    // -- Identity / consent --
    /// A principal mapping the operation needs is not populated yet.
    IdentityUnavailable,
    /// Consent evidence is gone (410/451); the resource is skipped.
    ConsentGone,

    // -- Coordination --
    /// Another worker holds a live lease on the hour.
    LeaseHeld,
    /// The requested range is empty or inverted.
    RangeInvalid,

    // -- Lifecycle --
    /// The surrounding context was cancelled.
    ContextCancelled,
    /// Catch-all for unexpected internal errors (including panics).
    Internal,
}

impl ErrorCode {
    /// The [`ErrorClass`] this code belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NetworkTransport
            | Self::UpstreamThrottled
            | Self::UpstreamUnavailable
            | Self::DbSerialization
            | Self::DbDeadlock
            | Self::DbConnection
            | Self::ColumnarUnavailable => ErrorClass::Retryable,

            Self::IdentityUnavailable => ErrorClass::Unavailable,

            Self::DbQuery
            | Self::ColumnarQuery
            | Self::InvalidItem
            | Self::PayloadShape
            | Self::StreamCorrupt
            | Self::RulepackInvalid
            | Self::RulepackCompile
            | Self::RangeInvalid
            | Self::Internal => ErrorClass::Fatal,

            Self::HourArchiveMissing | Self::ConsentGone | Self::LeaseHeld => ErrorClass::Terminal,

            Self::ContextCancelled => ErrorClass::Cancelled,
        }
    }

    /// Stable `&'static str` representation (e.g. `"DB_DEADLOCK"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkTransport => "NETWORK_TRANSPORT",
            Self::UpstreamThrottled => "UPSTREAM_THROTTLED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::HourArchiveMissing => "HOUR_ARCHIVE_MISSING",
            Self::DbSerialization => "DB_SERIALIZATION",
            Self::DbDeadlock => "DB_DEADLOCK",
            Self::DbConnection => "DB_CONNECTION",
            Self::DbQuery => "DB_QUERY",
            Self::ColumnarQuery => "COLUMNAR_QUERY",
            Self::ColumnarUnavailable => "COLUMNAR_UNAVAILABLE",
            Self::InvalidItem => "INVALID_ITEM",
            Self::PayloadShape => "PAYLOAD_SHAPE",
            Self::StreamCorrupt => "STREAM_CORRUPT",
            Self::RulepackInvalid => "RULEPACK_INVALID",
            Self::RulepackCompile => "RULEPACK_COMPILE",
            Self::IdentityUnavailable => "IDENTITY_UNAVAILABLE",
            Self::ConsentGone => "CONSENT_GONE",
            Self::LeaseHeld => "LEASE_HELD",
            Self::RangeInvalid => "RANGE_INVALID",
            Self::ContextCancelled => "CONTEXT_CANCELLED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CoreError
// ---------------------------------------------------------------------------

/// Unified pipeline error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and structured context for logs.
pub struct CoreError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl CoreError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// Values that fail to serialise are silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.class()`.
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    /// True when a retry loop should attempt this operation again.
    ///
    /// Covers both transient failures and temporarily-missing dependencies.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Retryable | ErrorClass::Unavailable)
    }

    /// True when the error came from cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// Terminal status text for coordinator rows, truncated to `max` chars
    /// on a character boundary.
    pub fn err_text(&self, max: usize) -> String {
        let full = self.to_string();
        if full.chars().count() <= max {
            return full;
        }
        full.chars().take(max).collect()
    }
}

impl fmt::Debug for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("CoreError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if let Some(ref src) = self.source {
            write!(f, ": {src}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Convenience alias for pipeline results.
pub type CoreResult<T> = Result<T, CoreError>;

// ---------------------------------------------------------------------------
// Classification helpers
// ---------------------------------------------------------------------------

/// Map an HTTP status from the archive upstream to an error code.
///
/// `404` is terminal for the hour; `429` and `5xx` are retryable; anything
/// else unexpected is fatal for the item.
pub fn classify_http_status(status: u16) -> ErrorCode {
    match status {
        404 => ErrorCode::HourArchiveMissing,
        410 | 451 => ErrorCode::ConsentGone,
        429 => ErrorCode::UpstreamThrottled,
        500..=599 => ErrorCode::UpstreamUnavailable,
        _ => ErrorCode::InvalidItem,
    }
}

/// Map a Postgres SQLSTATE to an error code.
///
/// `40001` (serialization_failure) and `40P01` (deadlock_detected) retry;
/// class `08` (connection exceptions) retries; the rest fail the query.
pub fn classify_pg_sqlstate(state: &str) -> ErrorCode {
    match state {
        "40001" => ErrorCode::DbSerialization,
        "40P01" => ErrorCode::DbDeadlock,
        s if s.starts_with("08") => ErrorCode::DbConnection,
        _ => ErrorCode::DbQuery,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
