// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hit rows in the columnar store.

use crate::client::ClickhouseClient;
use async_trait::async_trait;
use sj_core::{HitRecord, HourRef};
use sj_detect::HitSink;
use sj_error::{CoreError, CoreResult, ErrorCode};
use tracing::debug;

/// Repository over the `hits` table.
///
/// The table is a `ReplacingMergeTree` keyed by
/// `(utterance_id, term, span_start, span_end, detector_version)`, so a
/// retried write collapses to one row at merge time: at-most-once archival
/// without an upsert protocol.
#[derive(Clone)]
pub struct HitStore {
    client: ClickhouseClient,
}

impl HitStore {
    /// Wrap a client.
    pub fn new(client: ClickhouseClient) -> Self {
        Self { client }
    }

    fn hour_filter(hour: HourRef) -> String {
        format!(
            "created_at >= parseDateTimeBestEffort('{}') AND created_at < parseDateTimeBestEffort('{}')",
            hour.at().to_rfc3339(),
            hour.next().at().to_rfc3339()
        )
    }

    /// Number of hits recorded for an hour at a detector version.
    pub async fn count_for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<u64> {
        let sql = format!(
            "SELECT count() FROM {}.hits WHERE {} AND detector_version = {} FORMAT TabSeparated",
            self.client.database(),
            Self::hour_filter(hour),
            detver
        );
        self.client.query_count(&sql).await
    }

    /// Read an hour's hits back for the nightshift join.
    pub async fn for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<Vec<HitRecord>> {
        let sql = format!(
            r#"SELECT utterance_id,
                      formatDateTime(created_at, '%FT%TZ', 'UTC') AS created_at,
                      source, repo_hid, actor_hid, lang_code, term, category,
                      severity, severity_label, span_start, span_end,
                      detector_version, detector_source, pre_context, post_context,
                      zones, ctx_action, target_type, target_id, target_name,
                      target_span_start, target_span_end, target_distance
               FROM {}.hits
               WHERE {} AND detector_version = {}
               ORDER BY utterance_id, span_start, term
               FORMAT JSONEachRow"#,
            self.client.database(),
            Self::hour_filter(hour),
            detver
        );
        let body = self.client.query_raw(&sql).await?;

        let mut rows = Vec::new();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: HitRecord = serde_json::from_str(line).map_err(|e| {
                CoreError::new(ErrorCode::ColumnarQuery, "malformed hit row from store")
                    .with_context("line", line.chars().take(200).collect::<String>())
                    .with_source(e)
            })?;
            rows.push(row);
        }
        debug!(component = "columnar", hour = %hour, rows = rows.len(), "hits read back");
        Ok(rows)
    }

    /// Delete an hour's raw hits (retention), synchronously.
    pub async fn delete_hour(&self, hour: HourRef) -> CoreResult<u64> {
        let count_sql = format!(
            "SELECT count() FROM {}.hits WHERE {} FORMAT TabSeparated",
            self.client.database(),
            Self::hour_filter(hour)
        );
        let to_delete = self.client.query_count(&count_sql).await?;
        if to_delete == 0 {
            return Ok(0);
        }
        let sql = format!(
            "ALTER TABLE {}.hits DELETE WHERE {} SETTINGS mutations_sync = 2",
            self.client.database(),
            Self::hour_filter(hour)
        );
        self.client.execute(&sql).await?;
        Ok(to_delete)
    }
}

#[async_trait]
impl HitSink for HitStore {
    async fn write_hits(&self, rows: &[HitRecord]) -> CoreResult<u64> {
        self.client.insert_json_rows("hits", rows).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
