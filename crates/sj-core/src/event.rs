// SPDX-License-Identifier: MIT OR Apache-2.0
//! GitHub Archive event envelopes.
//!
//! Hourly archive files are gzip-compressed JSON Lines; each line is one
//! [`EventEnvelope`]. Historical feeds sometimes carry zero/absent IDs, which
//! the reader repairs with deterministic synthetic values before extraction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sj_identity::synthetic_numeric_id;

/// The actor block of an event envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActor {
    /// Numeric actor ID; `0` in some historical feeds.
    #[serde(default)]
    pub id: i64,
    /// Actor login.
    #[serde(default)]
    pub login: String,
}

/// The repo block of an event envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRepo {
    /// Numeric repository ID; `0` in some historical feeds.
    #[serde(default)]
    pub id: i64,
    /// `owner/name` slug.
    #[serde(default)]
    pub name: String,
}

/// One event from the public firehose.
///
/// `payload` stays as raw JSON; the extractor projects it per event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event ID as the feed carries it (a decimal string; may be empty).
    #[serde(default)]
    pub id: String,
    /// Event type (`PushEvent`, `IssuesEvent`, …).
    #[serde(rename = "type", default)]
    pub event_type: String,
    /// Acting user.
    #[serde(default)]
    pub actor: EventActor,
    /// Target repository.
    #[serde(default)]
    pub repo: EventRepo,
    /// Type-specific payload, projected later by the extractor.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Fill missing/zero IDs with deterministic synthetic values.
    ///
    /// Synthetic values are pure functions of the envelope's natural fields,
    /// so re-reading the same archive converges on identical IDs.
    pub fn fill_synthetic_ids(&mut self) {
        if self.id.is_empty() || self.id == "0" {
            let natural = format!(
                "{}|{}|{}|{}",
                self.event_type,
                self.actor.login,
                self.repo.name,
                self.created_at.to_rfc3339()
            );
            self.id = synthetic_numeric_id("event", &natural).to_string();
        }
        if self.actor.id == 0 && !self.actor.login.is_empty() {
            self.actor.id = synthetic_numeric_id("actor", &self.actor.login);
        }
        if self.repo.id == 0 && !self.repo.name.is_empty() {
            self.repo.id = synthetic_numeric_id("repo", &self.repo.name);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
