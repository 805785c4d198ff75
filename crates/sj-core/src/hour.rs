// SPDX-License-Identifier: MIT OR Apache-2.0
//! UTC hour references and coordinator sub-states.
//!
//! The **hour** is the pipeline's unit of work: every coordinator row,
//! archive file, and retention decision is keyed by a UTC timestamp truncated
//! to the hour. [`HourRef`] guarantees that truncation by construction.

use chrono::{DateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// HourRef
// ---------------------------------------------------------------------------

/// A UTC timestamp truncated to the hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HourRef(DateTime<Utc>);

impl HourRef {
    /// Truncate an arbitrary instant down to its hour.
    pub fn truncate(at: DateTime<Utc>) -> Self {
        let secs = at.timestamp();
        let floored = secs - secs.rem_euclid(3600);
        // Flooring a valid timestamp cannot leave the representable range.
        match Utc.timestamp_opt(floored, 0).single() {
            Some(dt) => Self(dt),
            None => Self(at),
        }
    }

    /// Parse the CLI form `YYYY-MM-DDTHH` (e.g. `2025-08-01T00`).
    pub fn parse(s: &str) -> Result<Self, HourParseError> {
        let naive = chrono::NaiveDateTime::parse_from_str(&format!("{s}:00:00"), "%Y-%m-%dT%H:%M:%S")
            .map_err(|e| HourParseError::BadFormat {
                input: s.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::truncate(Utc.from_utc_datetime(&naive)))
    }

    /// The underlying (truncated) instant.
    pub fn at(&self) -> DateTime<Utc> {
        self.0
    }

    /// The first instant after this hour.
    pub fn next(&self) -> Self {
        Self(self.0 + chrono::Duration::hours(1))
    }

    /// Upstream archive object name: date plus unpadded hour
    /// (`2025-08-01-0` … `2025-08-01-23`).
    pub fn archive_name(&self) -> String {
        format!("{}-{}", self.0.format("%Y-%m-%d"), self.0.hour())
    }

    /// Local cache file stem with a zero-padded hour (`2025-08-01-00`),
    /// so directory listings sort chronologically.
    pub fn cache_key(&self) -> String {
        self.0.format("%Y-%m-%d-%H").to_string()
    }

    /// Hours in `[start, end]`, oldest first. Empty when `end < start`.
    pub fn range_inclusive(start: Self, end: Self) -> Vec<Self> {
        let mut hours = Vec::new();
        let mut cur = start;
        while cur <= end {
            hours.push(cur);
            cur = cur.next();
        }
        hours
    }

    /// Number of hours in `[start, end]`; 0 when inverted.
    pub fn span_hours(start: Self, end: Self) -> i64 {
        if end < start {
            return 0;
        }
        (end.0 - start.0).num_hours() + 1
    }
}

impl fmt::Display for HourRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H"))
    }
}

/// Errors parsing an [`HourRef`] from its CLI form.
#[derive(Debug, thiserror::Error)]
pub enum HourParseError {
    /// The input did not match `YYYY-MM-DDTHH`.
    #[error("invalid hour '{input}' (expected YYYY-MM-DDTHH): {reason}")]
    BadFormat {
        /// Raw input.
        input: String,
        /// Parser detail.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Coordinator sub-states
// ---------------------------------------------------------------------------

/// Backfill sub-state of a coordinator row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BfStatus {
    /// Seeded, never claimed.
    Pending,
    /// Claimed by a worker with a live lease.
    Running,
    /// Completed successfully.
    Ok,
    /// Failed; claimable again.
    Error,
}

impl BfStatus {
    /// Column value (`pending`, `running`, `ok`, `error`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Nightshift sub-state of a coordinator row.
///
/// May only leave `pending` once the hour's `bf_status` is `ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NsStatus {
    /// Not yet archived.
    Pending,
    /// Claimed by a nightshift worker.
    Running,
    /// Archive written and retention applied.
    RetentionApplied,
    /// Failed; claimable again.
    Error,
}

impl NsStatus {
    /// Column value (`pending`, `running`, `retention_applied`, `error`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RetentionApplied => "retention_applied",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
