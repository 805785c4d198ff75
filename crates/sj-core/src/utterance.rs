// SPDX-License-Identifier: MIT OR Apache-2.0
//! Extracted utterances and their deterministic identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Fixed namespace for deterministic utterance UUIDs (v5).
const UTTERANCE_NAMESPACE: Uuid = Uuid::from_u128(0x8d1c_7a04_52be_4e21_9ad3_6f0b_02c5_e671);

// ---------------------------------------------------------------------------
// SourceKind
// ---------------------------------------------------------------------------

/// Coarse utterance source, used for grouping and partition pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Commit message from a push.
    Commit,
    /// Issue title or body.
    Issue,
    /// Pull request title or body.
    Pr,
    /// Any comment body (issue, review, commit).
    Comment,
}

impl SourceKind {
    /// Column value (`commit`, `issue`, `pr`, `comment`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Issue => "issue",
            Self::Pr => "pr",
            Self::Comment => "comment",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Utterance
// ---------------------------------------------------------------------------

/// One natural-language utterance projected from an event.
///
/// Natural key: `(event_id, source, ordinal)`. The `utterance_id` is a
/// deterministic UUID over that key, so retried inserts collide instead of
/// duplicating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Utterance {
    /// Deterministic v5 UUID over the natural key.
    pub utterance_id: Uuid,
    /// Source event ID.
    pub event_id: String,
    /// Source event type (`PushEvent`, …).
    pub event_type: String,
    /// Numeric repository ID (possibly synthetic).
    pub repo_id: i64,
    /// Numeric actor ID (possibly synthetic).
    pub actor_id: i64,
    /// Repository slug, kept for consent-gated reveal only.
    pub repo_name: String,
    /// Actor login, kept for consent-gated reveal only.
    pub actor_login: String,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
    /// Coarse source.
    pub source: SourceKind,
    /// Detailed source (e.g. `pr:body`).
    pub source_detail: String,
    /// Per-event sequence number, starting at 0.
    pub ordinal: i32,
    /// Text as found in the payload.
    pub text_raw: String,
    /// Text after the normalization pipeline.
    pub text_normalized: String,
    /// Detected language, when the script is unambiguous.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang_code: Option<String>,
    /// Dominant Unicode script, when detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Deterministic UUID for an utterance's natural key.
pub fn utterance_uuid(event_id: &str, source: SourceKind, ordinal: i32) -> Uuid {
    let name = format!("{event_id}\u{0}{source}\u{0}{ordinal}");
    Uuid::new_v5(&UTTERANCE_NAMESPACE, name.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
