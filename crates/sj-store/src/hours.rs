// SPDX-License-Identifier: MIT OR Apache-2.0
//! The hour coordinator: one row per UTC hour, two orthogonal sub-states.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside a transaction so concurrent
//! claimers never block on (or double-claim) the same row. Leases are
//! advisory and self-expiring: a claim is valid only while
//! `now() < lease_expires_at`, and a crashed worker's row becomes claimable
//! again the moment its lease lapses.

use crate::{map_db_err, PgStore};
use chrono::{DateTime, Utc};
use sj_core::{BackfillMetrics, BfStatus, HourRef, NightshiftMetrics, NsStatus};
use sj_error::{CoreError, CoreResult, ErrorCode};
use sqlx::Row;
use std::time::Duration;
use tracing::debug;

/// Coordinator over the `ingest_hours` table.
#[derive(Clone)]
pub struct HourCoordinator {
    store: PgStore,
}

impl HourCoordinator {
    /// Wrap a store handle.
    pub fn new(store: PgStore) -> Self {
        Self { store }
    }

    /// Idempotently seed `pending` rows for every hour in `[start, end]`.
    pub async fn preseed(&self, start: HourRef, end: HourRef) -> CoreResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO ingest_hours (hour_utc, bf_status, ns_status)
            SELECT h, 'pending', 'pending'
            FROM generate_series($1::timestamptz, $2::timestamptz, interval '1 hour') AS h
            ON CONFLICT (hour_utc) DO NOTHING
            "#,
        )
        .bind(start.at())
        .bind(end.at())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "preseed"))?;
        Ok(result.rows_affected())
    }

    /// Atomically claim the lowest claimable hour for backfill.
    ///
    /// Claimable: `bf_status ∈ {pending, error}` with no live lease, or a
    /// `running` row whose lease has lapsed (crashed worker). Returns `None`
    /// when the window is drained.
    pub async fn claim_next_bf(
        &self,
        window: Option<(HourRef, HourRef)>,
        worker: &str,
        ttl: Duration,
    ) -> CoreResult<Option<HourRef>> {
        let (start, end) = match window {
            Some((s, e)) => (Some(s.at()), Some(e.at())),
            None => (None, None),
        };
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| map_db_err(e, "claim begin"))?;

        let row = sqlx::query(
            r#"
            SELECT hour_utc
            FROM ingest_hours
            WHERE (
                    bf_status IN ('pending', 'error')
                    OR (bf_status = 'running' AND bf_lease_expires_at <= now())
                  )
              AND (bf_lease_expires_at IS NULL OR bf_lease_expires_at <= now())
              AND ($1::timestamptz IS NULL OR hour_utc >= $1)
              AND ($2::timestamptz IS NULL OR hour_utc <= $2)
            ORDER BY hour_utc
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "claim select"))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let hour_utc: DateTime<Utc> = row.get("hour_utc");

        sqlx::query(
            r#"
            UPDATE ingest_hours
            SET bf_status = 'running',
                bf_lease_owner = $2,
                bf_lease_expires_at = now() + make_interval(secs => $3),
                bf_started_at = now()
            WHERE hour_utc = $1
            "#,
        )
        .bind(hour_utc)
        .bind(worker)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "claim update"))?;

        tx.commit().await.map_err(|e| map_db_err(e, "claim commit"))?;

        let hour = HourRef::truncate(hour_utc);
        debug!(component = "coordinator", hour = %hour, worker, "claimed backfill hour");
        Ok(Some(hour))
    }

    /// Best-effort start marker; claim already stamps the lease.
    pub async fn start_bf(&self, hour: HourRef) -> CoreResult<()> {
        sqlx::query("UPDATE ingest_hours SET bf_started_at = now() WHERE hour_utc = $1")
            .bind(hour.at())
            .execute(self.store.pool())
            .await
            .map_err(|e| map_db_err(e, "start_bf"))?;
        Ok(())
    }

    /// Write terminal backfill state: status, metrics, cleared lease.
    ///
    /// Runs even after lease expiry; the next claimer observes the terminal
    /// status and skips.
    pub async fn finish_bf(
        &self,
        hour: HourRef,
        status: BfStatus,
        metrics: &BackfillMetrics,
    ) -> CoreResult<()> {
        if !matches!(status, BfStatus::Ok | BfStatus::Error) {
            return Err(CoreError::new(
                ErrorCode::Internal,
                "finish_bf requires a terminal status",
            ));
        }
        sqlx::query(
            r#"
            UPDATE ingest_hours
            SET bf_status = $2,
                bf_events = $3,
                bf_bytes = $4,
                bf_utterances = $5,
                bf_inserted = $6,
                bf_deduped = $7,
                bf_hits = $8,
                bf_fetch_ms = $9,
                bf_read_ms = $10,
                bf_insert_ms = $11,
                bf_detect_ms = $12,
                bf_err_text = $13,
                bf_finished_at = now(),
                bf_lease_owner = NULL,
                bf_lease_expires_at = NULL
            WHERE hour_utc = $1
            "#,
        )
        .bind(hour.at())
        .bind(status.as_str())
        .bind(metrics.events as i64)
        .bind(metrics.bytes as i64)
        .bind(metrics.utterances as i64)
        .bind(metrics.inserted as i64)
        .bind(metrics.deduped as i64)
        .bind(metrics.hits as i64)
        .bind(metrics.fetch_ms as i64)
        .bind(metrics.read_ms as i64)
        .bind(metrics.insert_ms as i64)
        .bind(metrics.detect_ms as i64)
        .bind(metrics.err_text.as_deref())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "finish_bf"))?;
        Ok(())
    }

    /// Atomically claim the lowest nightshift-ready hour.
    ///
    /// Nightshift may only run after backfill finished `ok`.
    pub async fn claim_next_ns(&self, worker: &str, ttl: Duration) -> CoreResult<Option<HourRef>> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| map_db_err(e, "ns claim begin"))?;

        let row = sqlx::query(
            r#"
            SELECT hour_utc
            FROM ingest_hours
            WHERE bf_status = 'ok'
              AND (
                    ns_status IN ('pending', 'error')
                    OR (ns_status = 'running' AND ns_lease_expires_at <= now())
                  )
              AND (ns_lease_expires_at IS NULL OR ns_lease_expires_at <= now())
            ORDER BY hour_utc
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "ns claim select"))?;

        let Some(row) = row else {
            tx.rollback().await.ok();
            return Ok(None);
        };
        let hour_utc: DateTime<Utc> = row.get("hour_utc");

        sqlx::query(
            r#"
            UPDATE ingest_hours
            SET ns_status = 'running',
                ns_lease_owner = $2,
                ns_lease_expires_at = now() + make_interval(secs => $3),
                ns_started_at = now()
            WHERE hour_utc = $1
            "#,
        )
        .bind(hour_utc)
        .bind(worker)
        .bind(ttl.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err(e, "ns claim update"))?;

        tx.commit().await.map_err(|e| map_db_err(e, "ns claim commit"))?;
        Ok(Some(HourRef::truncate(hour_utc)))
    }

    /// Direct single-hour nightshift start: `pending|error → running`.
    ///
    /// Zero rows updated means the hour is not ready or another worker holds
    /// it; surfaced as [`ErrorCode::LeaseHeld`] for a clean skip.
    pub async fn start_ns(&self, hour: HourRef, worker: &str, ttl: Duration) -> CoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_hours
            SET ns_status = 'running',
                ns_lease_owner = $2,
                ns_lease_expires_at = now() + make_interval(secs => $3),
                ns_started_at = now()
            WHERE hour_utc = $1
              AND bf_status = 'ok'
              AND (
                    ns_status IN ('pending', 'error')
                    OR (ns_status = 'running' AND ns_lease_expires_at <= now())
                  )
            "#,
        )
        .bind(hour.at())
        .bind(worker)
        .bind(ttl.as_secs_f64())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "start_ns"))?;

        if result.rows_affected() == 0 {
            return Err(
                CoreError::new(ErrorCode::LeaseHeld, "hour not ready or already claimed")
                    .with_context("hour", hour.to_string()),
            );
        }
        Ok(())
    }

    /// Write terminal nightshift state: status, metrics, cleared lease.
    pub async fn finish_ns(
        &self,
        hour: HourRef,
        status: NsStatus,
        metrics: &NightshiftMetrics,
    ) -> CoreResult<()> {
        if !matches!(status, NsStatus::RetentionApplied | NsStatus::Error) {
            return Err(CoreError::new(
                ErrorCode::Internal,
                "finish_ns requires a terminal status",
            ));
        }
        sqlx::query(
            r#"
            UPDATE ingest_hours
            SET ns_status = $2,
                ns_archived = $3,
                ns_pruned_hits = $4,
                ns_pruned_utterances = $5,
                ns_elapsed_ms = $6,
                ns_err_text = $7,
                ns_finished_at = now(),
                ns_lease_owner = NULL,
                ns_lease_expires_at = NULL
            WHERE hour_utc = $1
            "#,
        )
        .bind(hour.at())
        .bind(status.as_str())
        .bind(metrics.archived as i64)
        .bind(metrics.pruned_hits as i64)
        .bind(metrics.pruned_utterances as i64)
        .bind(metrics.elapsed_ms as i64)
        .bind(metrics.err_text.as_deref())
        .execute(self.store.pool())
        .await
        .map_err(|e| map_db_err(e, "finish_ns"))?;
        Ok(())
    }

    /// Current backfill status of an hour, if the row exists.
    pub async fn bf_status(&self, hour: HourRef) -> CoreResult<Option<String>> {
        let row = sqlx::query("SELECT bf_status FROM ingest_hours WHERE hour_utc = $1")
            .bind(hour.at())
            .fetch_optional(self.store.pool())
            .await
            .map_err(|e| map_db_err(e, "bf_status"))?;
        Ok(row.map(|r| r.get::<String, _>("bf_status")))
    }
}
