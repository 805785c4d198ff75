// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `commit_crimes` archive: denormalized hit rows per hour.

use crate::client::ClickhouseClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sj_core::HourRef;
use sj_error::CoreResult;
use sj_identity::Hid;
use tracing::info;
use uuid::Uuid;

/// Namespace for deterministic archive row IDs.
const HIT_ID_NAMESPACE: Uuid = Uuid::from_u128(0x41c3_99b2_7d6e_4cc0_b1fa_0d52_9e88_a7c3);

/// Deterministic archive row ID over the hit's uniqueness key.
///
/// Identical across nightshift re-runs, so the slice key
/// `(bucket_hour, detver, hit_id)` makes rewrites idempotent.
pub fn archive_hit_id(
    utterance_id: Uuid,
    term: &str,
    span_start: u32,
    span_end: u32,
    detver: i32,
) -> Uuid {
    let name = format!("{utterance_id}\u{0}{term}\u{0}{span_start}\u{0}{span_end}\u{0}{detver}");
    Uuid::new_v5(&HIT_ID_NAMESPACE, name.as_bytes())
}

/// One denormalized archive row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRow {
    /// Hour partition key.
    pub bucket_hour: DateTime<Utc>,
    /// Detector generation the slice was built from.
    pub detver: i32,
    /// Deterministic row ID (see [`archive_hit_id`]).
    pub hit_id: Uuid,
    /// Owning utterance.
    pub utterance_id: Uuid,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
    /// Coarse source.
    pub source: String,
    /// Repository HID.
    pub repo_hid: Hid,
    /// Actor HID.
    pub actor_hid: Hid,
    /// Repository slug; present only with an active opt-in receipt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    /// Detected language, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang_code: Option<String>,
    /// Detected script, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Normalized text length in bytes, copied at archive time.
    pub text_len: i32,
    /// Matched term.
    pub term: String,
    /// Persisted category.
    pub category: String,
    /// Numeric severity.
    pub severity: u8,
    /// Persisted severity label.
    pub severity_label: String,
    /// Span start.
    pub span_start: u32,
    /// Span end.
    pub span_end: u32,
    /// Which matcher found it.
    pub detector_source: String,
    /// Target classification.
    pub target_type: String,
    /// Target alias, when tagged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
}

/// Repository over the `commit_crimes` table.
#[derive(Clone)]
pub struct ArchiveStore {
    client: ClickhouseClient,
}

impl ArchiveStore {
    /// Wrap a client.
    pub fn new(client: ClickhouseClient) -> Self {
        Self { client }
    }

    fn slice_filter(hour: HourRef, detver: i32) -> String {
        format!(
            "bucket_hour = parseDateTimeBestEffort('{}') AND detver = {}",
            hour.at().to_rfc3339(),
            detver
        )
    }

    /// Rows currently in the `(hour, detver)` slice.
    pub async fn count_slice(&self, hour: HourRef, detver: i32) -> CoreResult<u64> {
        let sql = format!(
            "SELECT count() FROM {}.commit_crimes WHERE {} FORMAT TabSeparated",
            self.client.database(),
            Self::slice_filter(hour, detver)
        );
        self.client.query_count(&sql).await
    }

    /// Synchronously delete the `(hour, detver)` slice, if present.
    ///
    /// Idempotent prelude to a slice rewrite; deleting an absent slice is a
    /// no-op rather than an error.
    pub async fn delete_slice(&self, hour: HourRef, detver: i32) -> CoreResult<u64> {
        let existing = self.count_slice(hour, detver).await?;
        if existing == 0 {
            return Ok(0);
        }
        let sql = format!(
            "ALTER TABLE {}.commit_crimes DELETE WHERE {} SETTINGS mutations_sync = 2",
            self.client.database(),
            Self::slice_filter(hour, detver)
        );
        self.client.execute(&sql).await?;
        info!(component = "columnar", hour = %hour, detver, rows = existing, "archive slice deleted");
        Ok(existing)
    }

    /// Insert archive rows.
    pub async fn insert(&self, rows: &[ArchiveRow]) -> CoreResult<u64> {
        self.client.insert_json_rows("commit_crimes", rows).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
