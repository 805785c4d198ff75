// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-hour metrics recorded on coordinator rows at finish time.

use serde::{Deserialize, Serialize};

/// Metrics for one backfilled hour.
///
/// Invariant for hours finishing `ok`: `inserted + deduped == utterances`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillMetrics {
    /// Events decoded from the archive.
    pub events: u64,
    /// Uncompressed bytes read.
    pub bytes: u64,
    /// Utterances extracted (non-empty text only).
    pub utterances: u64,
    /// Rows newly inserted.
    pub inserted: u64,
    /// Rows deduplicated by the natural key.
    pub deduped: u64,
    /// Hits written by the inline detect path, when enabled.
    pub hits: u64,
    /// Archive fetch wall time.
    pub fetch_ms: u64,
    /// Read + extract + normalize wall time.
    pub read_ms: u64,
    /// Insert wall time.
    pub insert_ms: u64,
    /// Inline detect wall time.
    pub detect_ms: u64,
    /// Terminal error text, truncated to 500 chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_text: Option<String>,
}

impl BackfillMetrics {
    /// Accounting check for `ok` hours.
    pub fn balanced(&self) -> bool {
        self.inserted + self.deduped == self.utterances
    }
}

/// Metrics for one nightshift pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NightshiftMetrics {
    /// Archive rows written to `commit_crimes`.
    pub archived: u64,
    /// Hit rows removed by retention.
    pub pruned_hits: u64,
    /// Utterance rows removed by retention.
    pub pruned_utterances: u64,
    /// Total wall time.
    pub elapsed_ms: u64,
    /// Terminal error text, truncated to 500 chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err_text: Option<String>,
}
