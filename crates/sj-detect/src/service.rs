// SPDX-License-Identifier: MIT OR Apache-2.0
//! The paging detect service.
//!
//! Pages utterances for a window out of storage in `(created_at, id)` keyset
//! order, scans each row under a bounded worker pool, and writes best-hit
//! rows to the hit sink in chunks. The service also implements the narrow
//! [`DetectWriter`] capability the backfill orchestrator consumes for its
//! inline path, which keeps the crates free of a dependency cycle.

use crate::detector::{compose_records, Detector};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use sj_core::{HitRecord, HourRef, WriteInput};
use sj_error::{CoreError, CoreResult, ErrorCode};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Keyset cursor into the utterance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageKey {
    /// Last-seen creation time.
    pub created_at: DateTime<Utc>,
    /// Last-seen utterance ID (tiebreaker).
    pub id: Uuid,
}

/// Read side: pages utterance write-inputs for a window.
///
/// Implementations must exclude rows whose repo or actor HID is in the
/// active deny sets; consent gates reads, not writes.
#[async_trait]
pub trait UtterancePage: Send + Sync {
    /// Fetch up to `limit` rows in `[start, end)` strictly after `cursor`,
    /// ordered by `(created_at, id)`.
    async fn page(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        cursor: Option<PageKey>,
        limit: u32,
    ) -> CoreResult<Vec<WriteInput>>;
}

/// Write side: persists hit rows to the columnar store.
#[async_trait]
pub trait HitSink: Send + Sync {
    /// Write rows; returns the number accepted.
    async fn write_hits(&self, rows: &[HitRecord]) -> CoreResult<u64>;
}

/// Narrow capability handed to the backfill orchestrator: detect and write
/// in one step from pre-extracted utterance summaries.
#[async_trait]
pub trait DetectWriter: Send + Sync {
    /// Scan the inputs and write the resulting hits. Returns hits written.
    async fn write(&self, inputs: &[WriteInput]) -> CoreResult<u64>;
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Tuning for a [`DetectService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectOptions {
    /// Concurrent scans in flight.
    pub workers: usize,
    /// Rows per storage page.
    pub page_size: u32,
    /// Rows per sink write.
    pub write_chunk: usize,
    /// Scan but never write.
    pub dry_run: bool,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            workers: 8,
            page_size: 500,
            write_chunk: 1000,
            dry_run: false,
        }
    }
}

/// Counters reported by a detect run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectOutcome {
    /// Utterances scanned.
    pub scanned: u64,
    /// Hit rows produced.
    pub hits: u64,
    /// Hit rows written (0 on dry runs).
    pub written: u64,
}

/// Pages, scans, and writes for a window.
pub struct DetectService {
    detector: Detector,
    source: Arc<dyn UtterancePage>,
    sink: Arc<dyn HitSink>,
    opts: DetectOptions,
}

impl DetectService {
    /// Wire a service from its ports.
    pub fn new(
        detector: Detector,
        source: Arc<dyn UtterancePage>,
        sink: Arc<dyn HitSink>,
        opts: DetectOptions,
    ) -> Self {
        Self {
            detector,
            source,
            sink,
            opts,
        }
    }

    /// Scan every utterance in `[start, end]` (inclusive hours).
    pub async fn run_range(&self, start: HourRef, end: HourRef) -> CoreResult<DetectOutcome> {
        if end < start {
            return Err(CoreError::new(ErrorCode::RangeInvalid, "end before start")
                .with_context("start", start.to_string())
                .with_context("end", end.to_string()));
        }
        let window_start = start.at();
        let window_end = end.next().at();

        let mut outcome = DetectOutcome::default();
        let mut cursor: Option<PageKey> = None;

        loop {
            let page = self
                .source
                .page(window_start, window_end, cursor, self.opts.page_size)
                .await?;
            if page.is_empty() {
                break;
            }
            let exhausted = (page.len() as u32) < self.opts.page_size;
            cursor = page.last().map(|w| PageKey {
                created_at: w.created_at,
                id: w.utterance_id,
            });

            outcome.scanned += page.len() as u64;
            let rows = self.scan_page(page).await?;
            outcome.hits += rows.len() as u64;
            outcome.written += self.write_rows(rows).await?;

            debug!(
                component = "detect",
                scanned = outcome.scanned,
                hits = outcome.hits,
                "page complete"
            );
            if exhausted {
                break;
            }
        }

        info!(
            component = "detect",
            start = %start,
            end = %end,
            scanned = outcome.scanned,
            hits = outcome.hits,
            written = outcome.written,
            dry_run = self.opts.dry_run,
            "detect range complete"
        );
        Ok(outcome)
    }

    /// Scan a page under the bounded pool. Scans are CPU-bound, so each row
    /// runs on the blocking pool.
    async fn scan_page(&self, page: Vec<WriteInput>) -> CoreResult<Vec<HitRecord>> {
        let results: Vec<CoreResult<Vec<HitRecord>>> = stream::iter(page)
            .map(|input| {
                let detector = self.detector.clone();
                async move {
                    tokio::task::spawn_blocking(move || compose_records(&detector, &input))
                        .await
                        .map_err(|e| {
                            CoreError::new(ErrorCode::Internal, "scan task panicked")
                                .with_context("detail", e.to_string())
                        })
                }
            })
            .buffered(self.opts.workers.max(1))
            .collect()
            .await;

        let mut rows = Vec::new();
        for result in results {
            rows.extend(result?);
        }
        Ok(rows)
    }

    async fn write_rows(&self, rows: Vec<HitRecord>) -> CoreResult<u64> {
        if self.opts.dry_run || rows.is_empty() {
            return Ok(0);
        }
        let mut written = 0u64;
        for chunk in rows.chunks(self.opts.write_chunk.max(1)) {
            written += self.sink.write_hits(chunk).await?;
        }
        Ok(written)
    }
}

#[async_trait]
impl DetectWriter for DetectService {
    async fn write(&self, inputs: &[WriteInput]) -> CoreResult<u64> {
        let rows = self.scan_page(inputs.to_vec()).await?;
        self.write_rows(rows).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use sj_core::SourceKind;
    use sj_normalize::normalize;
    use sj_rulepack::CompiledPack;
    use std::sync::Mutex;

    fn detector() -> Detector {
        Detector::new(Arc::new(CompiledPack::bundled().unwrap()), 1)
    }

    fn hour(s: &str) -> HourRef {
        HourRef::parse(s).unwrap()
    }

    fn write_input(n: u64, text: &str) -> WriteInput {
        WriteInput {
            utterance_id: Uuid::from_u128(u128::from(n)),
            created_at: hour("2025-08-01T00").at() + chrono::Duration::seconds(n as i64),
            source: SourceKind::Comment,
            repo_hid: sj_identity::repo_hid32(1),
            actor_hid: sj_identity::actor_hid32(1),
            lang_code: None,
            text_normalized: normalize(text),
        }
    }

    /// Pages rows out of a vec with real keyset semantics.
    struct VecSource {
        rows: Vec<WriteInput>,
    }

    #[async_trait]
    impl UtterancePage for VecSource {
        async fn page(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            cursor: Option<PageKey>,
            limit: u32,
        ) -> CoreResult<Vec<WriteInput>> {
            let mut rows: Vec<WriteInput> = self
                .rows
                .iter()
                .filter(|w| w.created_at >= start && w.created_at < end)
                .filter(|w| match cursor {
                    None => true,
                    Some(k) => (w.created_at, w.utterance_id) > (k.created_at, k.id),
                })
                .cloned()
                .collect();
            rows.sort_by_key(|w| (w.created_at, w.utterance_id));
            rows.truncate(limit as usize);
            Ok(rows)
        }
    }

    #[derive(Default)]
    struct MemSink {
        rows: Mutex<Vec<HitRecord>>,
        calls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl HitSink for MemSink {
        async fn write_hits(&self, rows: &[HitRecord]) -> CoreResult<u64> {
            self.calls.lock().unwrap().push(rows.len());
            self.rows.lock().unwrap().extend_from_slice(rows);
            Ok(rows.len() as u64)
        }
    }

    fn service(rows: Vec<WriteInput>, opts: DetectOptions) -> (DetectService, Arc<MemSink>) {
        let sink = Arc::new(MemSink::default());
        let svc = DetectService::new(
            detector(),
            Arc::new(VecSource { rows }),
            sink.clone(),
            opts,
        );
        (svc, sink)
    }

    #[tokio::test]
    async fn scans_and_writes_a_range() {
        let rows = vec![
            write_input(1, "this is shit"),
            write_input(2, "perfectly clean text"),
            write_input(3, "fuck you dependabot - thanks for nothing"),
        ];
        let (svc, sink) = service(rows, DetectOptions::default());
        let outcome = svc
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        assert_eq!(outcome.scanned, 3);
        assert!(outcome.hits >= 3, "shit + template + fuck: {outcome:?}");
        assert_eq!(outcome.written, outcome.hits);
        assert_eq!(sink.rows.lock().unwrap().len() as u64, outcome.written);
    }

    #[tokio::test]
    async fn paging_visits_every_row_once() {
        let rows: Vec<WriteInput> = (0..25).map(|n| write_input(n, "shit")).collect();
        let (svc, sink) = service(
            rows,
            DetectOptions {
                page_size: 10,
                ..Default::default()
            },
        );
        let outcome = svc
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        assert_eq!(outcome.scanned, 25);
        assert_eq!(outcome.hits, 25);
        let ids: Vec<Uuid> = sink.rows.lock().unwrap().iter().map(|r| r.utterance_id).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 25, "no utterance scanned twice");
    }

    #[tokio::test]
    async fn dry_run_counts_but_never_writes() {
        let rows = vec![write_input(1, "total shit")];
        let (svc, sink) = service(
            rows,
            DetectOptions {
                dry_run: true,
                ..Default::default()
            },
        );
        let outcome = svc
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        assert_eq!(outcome.hits, 1);
        assert_eq!(outcome.written, 0);
        assert!(sink.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_chunking_bounds_sink_calls() {
        let rows: Vec<WriteInput> = (0..7).map(|n| write_input(n, "shit")).collect();
        let (svc, sink) = service(
            rows,
            DetectOptions {
                write_chunk: 3,
                page_size: 100,
                ..Default::default()
            },
        );
        svc.run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        let calls = sink.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let (svc, _) = service(vec![], DetectOptions::default());
        let err = svc
            .run_range(hour("2025-08-01T05"), hour("2025-08-01T00"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeInvalid);
    }

    #[tokio::test]
    async fn rows_outside_the_window_are_ignored() {
        let mut late = write_input(9, "shit");
        late.created_at = hour("2025-08-01T02").at();
        let rows = vec![write_input(1, "shit"), late];
        let (svc, _) = service(rows, DetectOptions::default());
        let outcome = svc
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(outcome.scanned, 1);
    }

    #[tokio::test]
    async fn detect_writer_capability_scans_and_writes() {
        let (svc, sink) = service(vec![], DetectOptions::default());
        let written = svc
            .write(&[write_input(1, "what the 5h1t"), write_input(2, "clean")])
            .await
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(sink.rows.lock().unwrap()[0].term, "shit");
    }
}
