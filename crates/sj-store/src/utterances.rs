// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bulk utterance storage and the detect read path.
//!
//! Inserts are chunk-sized `UNNEST` statements inside one transaction; the
//! unique natural key `(event_id, source, ordinal)` turns retries into
//! counted dedups. The detect read path pages `(created_at, id)` keyset
//! windows and excludes denied principals in SQL.

use crate::{map_db_err, PgStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sj_core::{SourceKind, Utterance, WriteInput};
use sj_detect::{PageKey, UtterancePage};
use sj_error::CoreResult;
use sj_identity::{actor_hid32, repo_hid32};
use sqlx::Row;
use uuid::Uuid;

/// Outcome of one batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    /// Rows newly inserted.
    pub inserted: u64,
    /// Rows that collided with the natural key.
    pub deduped: u64,
}

/// Repository over the `utterances` table.
#[derive(Clone)]
pub struct UtteranceStore {
    store: PgStore,
}

/// Denormalized utterance features the nightshift archive copies.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceFeatures {
    /// Utterance identity.
    pub utterance_id: Uuid,
    /// Normalized text length in bytes.
    pub text_len: i32,
    /// Detected language, if any.
    pub lang_code: Option<String>,
    /// Detected script, if any.
    pub script: Option<String>,
    /// Numeric repo ID, for the consent-gated name reveal.
    pub repo_id: i64,
    /// Repository slug; persisted to the archive only with an opt-in receipt.
    pub repo_name: String,
}

impl UtteranceStore {
    /// Wrap a store handle.
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    /// Insert one batch in a single transaction.
    ///
    /// `statement_timeout` is lifted for the transaction: bulk inserts on a
    /// cold partition can legitimately exceed the pool default.
    pub async fn insert_batch(&self, batch: &[Utterance]) -> CoreResult<InsertOutcome> {
        if batch.is_empty() {
            return Ok(InsertOutcome::default());
        }

        let mut ids = Vec::with_capacity(batch.len());
        let mut event_ids = Vec::with_capacity(batch.len());
        let mut event_types = Vec::with_capacity(batch.len());
        let mut repo_ids = Vec::with_capacity(batch.len());
        let mut actor_ids = Vec::with_capacity(batch.len());
        let mut repo_names = Vec::with_capacity(batch.len());
        let mut actor_logins = Vec::with_capacity(batch.len());
        let mut created_ats = Vec::with_capacity(batch.len());
        let mut sources = Vec::with_capacity(batch.len());
        let mut source_details = Vec::with_capacity(batch.len());
        let mut ordinals = Vec::with_capacity(batch.len());
        let mut texts_raw = Vec::with_capacity(batch.len());
        let mut texts_norm = Vec::with_capacity(batch.len());
        let mut lang_codes: Vec<Option<String>> = Vec::with_capacity(batch.len());
        let mut scripts: Vec<Option<String>> = Vec::with_capacity(batch.len());

        for u in batch {
            ids.push(u.utterance_id);
            event_ids.push(u.event_id.clone());
            event_types.push(u.event_type.clone());
            repo_ids.push(u.repo_id);
            actor_ids.push(u.actor_id);
            repo_names.push(u.repo_name.clone());
            actor_logins.push(u.actor_login.clone());
            created_ats.push(u.created_at);
            sources.push(u.source.as_str().to_string());
            source_details.push(u.source_detail.clone());
            ordinals.push(u.ordinal);
            texts_raw.push(u.text_raw.clone());
            texts_norm.push(u.text_normalized.clone());
            lang_codes.push(u.lang_code.clone());
            scripts.push(u.script.clone());
        }

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| map_db_err(e, "insert begin"))?;

        sqlx::query("SET LOCAL statement_timeout = 0")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err(e, "insert timeout"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO utterances (
                utterance_id, event_id, event_type, repo_id, actor_id,
                repo_name, actor_login, created_at, source, source_detail,
                ordinal, text_raw, text_normalized, lang_code, script
            )
            SELECT *
            FROM UNNEST(
                $1::uuid[], $2::text[], $3::text[], $4::bigint[], $5::bigint[],
                $6::text[], $7::text[], $8::timestamptz[], $9::text[], $10::text[],
                $11::int[], $12::text[], $13::text[], $14::text[], $15::text[]
            )
            ON CONFLICT (event_id, source, ordinal) DO NOTHING
            "#,
        )
        .bind(&ids)
        .bind(&event_ids)
        .bind(&event_types)
        .bind(&repo_ids)
        .bind(&actor_ids)
        .bind(&repo_names)
        .bind(&actor_logins)
        .bind(&created_ats)
        .bind(&sources)
        .bind(&source_details)
        .bind(&ordinals)
        .bind(&texts_raw)
        .bind(&texts_norm)
        .bind(&lang_codes)
        .bind(&scripts)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "insert utterances"))?;

        tx.commit().await.map_err(|e| map_db_err(e, "insert commit"))?;

        let inserted = result.rows_affected();
        Ok(InsertOutcome {
            inserted,
            deduped: batch.len() as u64 - inserted,
        })
    }

    /// Delete an hour's raw utterances (retention). Returns rows removed.
    pub async fn delete_hour(&self, hour: sj_core::HourRef) -> CoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM utterances WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(hour.at())
        .bind(hour.next().at())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "delete_hour"))?;
        Ok(result.rows_affected())
    }

    /// Denormalized features for the nightshift archive join.
    pub async fn features_by_ids(&self, ids: &[Uuid]) -> CoreResult<Vec<UtteranceFeatures>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT utterance_id, length(text_normalized) AS text_len,
                   lang_code, script, repo_id, repo_name
            FROM utterances
            WHERE utterance_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "features_by_ids"))?;

        Ok(rows
            .into_iter()
            .map(|r| UtteranceFeatures {
                utterance_id: r.get("utterance_id"),
                text_len: r.get("text_len"),
                lang_code: r.get("lang_code"),
                script: r.get("script"),
                repo_id: r.get("repo_id"),
                repo_name: r.get("repo_name"),
            })
            .collect())
    }
}

fn source_kind_of(s: &str) -> SourceKind {
    match s {
        "commit" => SourceKind::Commit,
        "issue" => SourceKind::Issue,
        "pr" => SourceKind::Pr,
        _ => SourceKind::Comment,
    }
}

#[async_trait]
impl UtterancePage for UtteranceStore {
    /// Keyset page for the detect service. Denied principals are excluded by
    /// joining the deny views through the identity map.
    async fn page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<PageKey>,
        limit: u32,
    ) -> CoreResult<Vec<WriteInput>> {
        let (cursor_at, cursor_id) = match cursor {
            Some(k) => (Some(k.created_at), Some(k.id)),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT u.utterance_id, u.created_at, u.source, u.repo_id, u.actor_id,
                   u.lang_code, u.text_normalized
            FROM utterances u
            WHERE u.created_at >= $1
              AND u.created_at < $2
              AND ($3::timestamptz IS NULL OR (u.created_at, u.utterance_id) > ($3, $4))
              AND NOT EXISTS (
                    SELECT 1 FROM active_deny_repos d
                    JOIN principal_ids pi ON pi.hid = d.repo_hid AND pi.kind = 'repo'
                    WHERE pi.numeric_id = u.repo_id
              )
              AND NOT EXISTS (
                    SELECT 1 FROM active_deny_actors d
                    JOIN principal_ids pi ON pi.hid = d.actor_hid AND pi.kind = 'actor'
                    WHERE pi.numeric_id = u.actor_id
              )
            ORDER BY u.created_at, u.utterance_id
            LIMIT $5
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(i64::from(limit))
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "page utterances"))?;

        Ok(rows
            .into_iter()
            .map(|r| {
                let repo_id: i64 = r.get("repo_id");
                let actor_id: i64 = r.get("actor_id");
                WriteInput {
                    utterance_id: r.get("utterance_id"),
                    created_at: r.get("created_at"),
                    source: source_kind_of(r.get::<String, _>("source").as_str()),
                    repo_hid: repo_hid32(repo_id),
                    actor_hid: actor_hid32(actor_id),
                    lang_code: r.get("lang_code"),
                    text_normalized: r.get("text_normalized"),
                }
            })
            .collect())
    }
}
