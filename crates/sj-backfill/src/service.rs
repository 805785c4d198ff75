// SPDX-License-Identifier: MIT OR Apache-2.0
//! Orchestrator service: range planning, worker loops, hour processing.

use crate::ports::{Coordinator, HourSource, InsertStats, PrincipalEnsurer, UtteranceSink};
use futures::FutureExt;
use sj_config::BackfillConfig;
use sj_core::{BackfillMetrics, BfStatus, HourRef, Utterance, WriteInput};
use sj_detect::DetectWriter;
use sj_error::{CoreError, CoreResult, ErrorCode};
use sj_identity::{actor_hid32, repo_hid32, Hid};
use sj_retry::{retry_async, BackoffPolicy, CancelToken};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Chunk size for inline detect writes.
const DETECT_CHUNK: usize = 1000;

/// Aggregated result of a range run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeOutcome {
    /// Hours finishing `ok`.
    pub hours_ok: u64,
    /// Hours finishing `error`.
    pub hours_error: u64,
    /// Hours skipped because another worker held them.
    pub hours_skipped: u64,
    /// Utterances newly inserted.
    pub inserted: u64,
    /// Utterances deduplicated.
    pub deduped: u64,
    /// Hits written by the inline detect path.
    pub hits: u64,
}

impl RangeOutcome {
    fn merge(&mut self, other: RangeOutcome) {
        self.hours_ok += other.hours_ok;
        self.hours_error += other.hours_error;
        self.hours_skipped += other.hours_skipped;
        self.inserted += other.inserted;
        self.deduped += other.deduped;
        self.hits += other.hits;
    }
}

enum HourStatus {
    Ok,
    Error,
    Skipped,
}

/// The backfill orchestrator. Clones share ports, config, and cancellation.
#[derive(Clone)]
pub struct BackfillService {
    coordinator: Arc<dyn Coordinator>,
    source: Arc<dyn HourSource>,
    sink: Arc<dyn UtteranceSink>,
    principals: Arc<dyn PrincipalEnsurer>,
    detect: Option<Arc<dyn DetectWriter>>,
    cfg: BackfillConfig,
    cancel: CancelToken,
}

impl BackfillService {
    /// Wire a service from its ports. `detect` enables the inline path.
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        source: Arc<dyn HourSource>,
        sink: Arc<dyn UtteranceSink>,
        principals: Arc<dyn PrincipalEnsurer>,
        detect: Option<Arc<dyn DetectWriter>>,
        cfg: BackfillConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            coordinator,
            source,
            sink,
            principals,
            detect,
            cfg,
            cancel,
        }
    }

    /// Preseed only: make every hour in `[start, end]` claimable.
    pub async fn plan_range(&self, start: HourRef, end: HourRef) -> CoreResult<u64> {
        self.validate_range(start, end)?;
        let seeded = self.coordinator.preseed(start, end).await?;
        info!(component = "backfill", start = %start, end = %end, seeded, "range planned");
        Ok(seeded)
    }

    /// Preseed and process every hour in `[start, end]` (inclusive).
    ///
    /// Returns an error when any hour ended in `error`; the outcome counts
    /// ride along in the error context.
    pub async fn run_range(&self, start: HourRef, end: HourRef) -> CoreResult<RangeOutcome> {
        self.validate_range(start, end)?;
        self.coordinator.preseed(start, end).await?;
        self.run_workers(Some((start, end))).await
    }

    /// Process whatever is claimable, unbounded (resume mode).
    pub async fn run_resume(&self) -> CoreResult<RangeOutcome> {
        self.run_workers(None).await
    }

    fn validate_range(&self, start: HourRef, end: HourRef) -> CoreResult<()> {
        if end < start {
            return Err(CoreError::new(ErrorCode::RangeInvalid, "end before start")
                .with_context("start", start.to_string())
                .with_context("end", end.to_string()));
        }
        let span = HourRef::span_hours(start, end);
        if self.cfg.max_range_hours > 0 && span > i64::from(self.cfg.max_range_hours) {
            return Err(CoreError::new(ErrorCode::RangeInvalid, "range exceeds configured cap")
                .with_context("hours", span)
                .with_context("max_range_hours", self.cfg.max_range_hours));
        }
        Ok(())
    }

    async fn run_workers(&self, window: Option<(HourRef, HourRef)>) -> CoreResult<RangeOutcome> {
        let mut handles = Vec::with_capacity(self.cfg.workers);
        for idx in 0..self.cfg.workers {
            let svc = self.clone();
            let tag = format!("{}:w{idx}", worker_base());
            handles.push(tokio::spawn(async move { svc.worker_loop(window, tag).await }));
        }

        let mut outcome = RangeOutcome::default();
        for handle in handles {
            match handle.await {
                Ok(worker_outcome) => outcome.merge(worker_outcome),
                Err(join_err) => {
                    error!(component = "backfill", error = %join_err, "worker task died");
                    outcome.hours_error += 1;
                }
            }
        }

        info!(
            component = "backfill",
            hours_ok = outcome.hours_ok,
            hours_error = outcome.hours_error,
            hours_skipped = outcome.hours_skipped,
            inserted = outcome.inserted,
            deduped = outcome.deduped,
            hits = outcome.hits,
            "range complete"
        );

        if outcome.hours_error > 0 {
            return Err(CoreError::new(ErrorCode::Internal, "hours ended in error")
                .with_context("hours_error", outcome.hours_error)
                .with_context("hours_ok", outcome.hours_ok));
        }
        Ok(outcome)
    }

    fn claim_ttl(&self) -> Duration {
        if self.cfg.leases {
            self.cfg.lease_ttl
        } else {
            // Leases "off" still needs crash recovery eventually; a long TTL
            // keeps rows effectively pinned for the run's lifetime.
            Duration::from_secs(6 * 3600)
        }
    }

    async fn worker_loop(&self, window: Option<(HourRef, HourRef)>, tag: String) -> RangeOutcome {
        let mut outcome = RangeOutcome::default();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let claimed = match retry_async(&BackoffPolicy::insert(), "claim", |_| {
                self.coordinator.claim_next(window, &tag, self.claim_ttl())
            })
            .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(component = "backfill", worker = %tag, error = %err, "claim failed");
                    outcome.hours_error += 1;
                    break;
                }
            };
            let Some(hour) = claimed else {
                debug!(component = "backfill", worker = %tag, "window drained");
                break;
            };

            let (status, metrics) = self.process_hour(hour, &tag).await;
            match status {
                HourStatus::Ok => {
                    outcome.hours_ok += 1;
                    outcome.inserted += metrics.inserted;
                    outcome.deduped += metrics.deduped;
                    outcome.hits += metrics.hits;
                }
                HourStatus::Error => outcome.hours_error += 1,
                HourStatus::Skipped => outcome.hours_skipped += 1,
            }

            if !self.cfg.delay_per_hour.is_zero() {
                tokio::time::sleep(self.cfg.delay_per_hour).await;
            }
        }
        outcome
    }

    /// One hour under bounded retry, always finalized.
    async fn process_hour(&self, hour: HourRef, tag: &str) -> (HourStatus, BackfillMetrics) {
        let policy = BackoffPolicy::hour(self.cfg.max_retries, self.cfg.retry_base);
        let mut attempt = 1u32;

        let (status, metrics) = loop {
            let (metrics, result) = self.run_hour_guarded(hour).await;
            match result {
                Ok(()) => break (HourStatus::Ok, metrics),
                Err(err) if err.code == ErrorCode::LeaseHeld => {
                    debug!(component = "backfill", hour = %hour, "lease held elsewhere, skipping");
                    break (HourStatus::Skipped, metrics);
                }
                Err(err)
                    if err.is_retryable()
                        && attempt < policy.max_attempts
                        && !self.cancel.is_cancelled() =>
                {
                    let delay = policy.jittered_delay(attempt);
                    warn!(
                        component = "backfill",
                        hour = %hour,
                        worker = tag,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "hour failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    let mut metrics = metrics;
                    metrics.err_text = Some(err.err_text(500));
                    break (HourStatus::Error, metrics);
                }
            }
        };

        match status {
            HourStatus::Ok => self.finalize(hour, BfStatus::Ok, &metrics).await,
            HourStatus::Error => self.finalize(hour, BfStatus::Error, &metrics).await,
            HourStatus::Skipped => {}
        }
        (status, metrics)
    }

    async fn finalize(&self, hour: HourRef, status: BfStatus, metrics: &BackfillMetrics) {
        if let Err(err) = self.coordinator.finish_hour(hour, status, metrics).await {
            // The lease will lapse and the hour will be reclaimed; nothing
            // more useful to do here than say so.
            error!(component = "backfill", hour = %hour, error = %err, "finish_hour failed");
        }
    }

    /// Run the hour body with a panic-to-error boundary.
    async fn run_hour_guarded(&self, hour: HourRef) -> (BackfillMetrics, CoreResult<()>) {
        let svc = self.clone();
        let body = async move {
            let mut metrics = BackfillMetrics::default();
            let result = svc.run_hour(hour, &mut metrics).await;
            (metrics, result)
        };
        match std::panic::AssertUnwindSafe(body).catch_unwind().await {
            Ok(pair) => pair,
            Err(panic) => {
                let text = panic_text(&panic);
                error!(component = "backfill", hour = %hour, panic = %text, "hour panicked");
                (
                    BackfillMetrics::default(),
                    Err(CoreError::new(ErrorCode::Internal, format!("panic: {text}"))),
                )
            }
        }
    }

    async fn run_hour(&self, hour: HourRef, metrics: &mut BackfillMetrics) -> CoreResult<()> {
        if let Err(err) = self.coordinator.start_hour(hour).await {
            warn!(component = "backfill", hour = %hour, error = %err, "start marker failed");
        }

        let started = Instant::now();
        let archive = self
            .scoped(self.cfg.fetch_timeout, "fetch", self.source.fetch(hour))
            .await?;
        metrics.fetch_ms = started.elapsed().as_millis() as u64;

        let started = Instant::now();
        let extracted = self
            .scoped(
                self.cfg.read_timeout,
                "read",
                self.source.extract(&archive, hour),
            )
            .await?;
        metrics.read_ms = started.elapsed().as_millis() as u64;
        metrics.events = extracted.events;
        metrics.bytes = extracted.bytes_uncompressed;
        metrics.utterances = extracted.utterances.len() as u64;

        let started = Instant::now();
        for chunk in extracted.utterances.chunks(self.cfg.insert_chunk.max(1)) {
            if self.cancel.is_cancelled() {
                return Err(cancelled());
            }
            let stats = self.insert_batch_robust(chunk).await?;
            metrics.inserted += stats.inserted;
            metrics.deduped += stats.deduped;
        }
        metrics.insert_ms = started.elapsed().as_millis() as u64;

        if let Some(writer) = &self.detect {
            let started = Instant::now();
            let inputs: Vec<WriteInput> = extracted.utterances.iter().map(to_write_input).collect();
            for chunk in inputs.chunks(DETECT_CHUNK) {
                if self.cancel.is_cancelled() {
                    return Err(cancelled());
                }
                metrics.hits += writer.write(chunk).await?;
            }
            metrics.detect_ms = started.elapsed().as_millis() as u64;
        }

        info!(
            component = "backfill",
            hour = %hour,
            events = metrics.events,
            utterances = metrics.utterances,
            inserted = metrics.inserted,
            deduped = metrics.deduped,
            hits = metrics.hits,
            fetch_ms = metrics.fetch_ms,
            read_ms = metrics.read_ms,
            insert_ms = metrics.insert_ms,
            "hour complete"
        );
        Ok(())
    }

    /// Pre-ensure principals, then insert with retry and bisection.
    async fn insert_batch_robust(&self, batch: &[Utterance]) -> CoreResult<InsertStats> {
        let (repos, actors) = principal_sets(batch);
        self.principals.ensure(&repos, &actors).await?;
        self.insert_with_bisect(batch).await
    }

    /// Retry the batch; on persistent failure split it and recurse, down to
    /// single rows, so one poison row cannot sink a whole chunk.
    async fn insert_with_bisect(&self, batch: &[Utterance]) -> CoreResult<InsertStats> {
        if batch.is_empty() {
            return Ok(InsertStats::default());
        }
        match retry_async(&BackoffPolicy::insert(), "insert_batch", |_| {
            self.sink.insert_batch(batch)
        })
        .await
        {
            Ok(stats) => Ok(stats),
            Err(err) if batch.len() > 1 && !err.is_cancelled() => {
                warn!(
                    component = "backfill",
                    batch = batch.len(),
                    error = %err,
                    "batch failed, bisecting"
                );
                let mid = batch.len() / 2;
                let left = Box::pin(self.insert_with_bisect(&batch[..mid])).await?;
                let right = Box::pin(self.insert_with_bisect(&batch[mid..])).await?;
                Ok(left + right)
            }
            Err(err) => Err(err),
        }
    }

    /// Race a stage against its timeout and the run's cancellation.
    async fn scoped<T>(
        &self,
        limit: Duration,
        what: &str,
        fut: impl std::future::Future<Output = CoreResult<T>>,
    ) -> CoreResult<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(cancelled()),
            out = tokio::time::timeout(limit, fut) => match out {
                Ok(result) => result,
                Err(_) => Err(CoreError::new(
                    ErrorCode::NetworkTransport,
                    format!("{what} timed out"),
                )
                .with_context("timeout_ms", limit.as_millis() as u64)),
            },
        }
    }
}

fn cancelled() -> CoreError {
    CoreError::new(ErrorCode::ContextCancelled, "context canceled")
}

fn panic_text(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn worker_base() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
    format!("{host}:{}", std::process::id())
}

/// HID → numeric-ID sets for a batch, skipping anonymous zero IDs.
fn principal_sets(batch: &[Utterance]) -> (BTreeMap<Hid, i64>, BTreeMap<Hid, i64>) {
    let mut repos = BTreeMap::new();
    let mut actors = BTreeMap::new();
    for u in batch {
        if u.repo_id != 0 {
            repos.insert(repo_hid32(u.repo_id), u.repo_id);
        }
        if u.actor_id != 0 {
            actors.insert(actor_hid32(u.actor_id), u.actor_id);
        }
    }
    (repos, actors)
}

fn to_write_input(u: &Utterance) -> WriteInput {
    WriteInput {
        utterance_id: u.utterance_id,
        created_at: u.created_at,
        source: u.source,
        repo_hid: repo_hid32(u.repo_id),
        actor_hid: actor_hid32(u.actor_id),
        lang_code: u.lang_code.clone(),
        text_normalized: u.text_normalized.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ArchiveRef, ExtractOutcome};
    use async_trait::async_trait;
    use sj_core::{utterance_uuid, SourceKind};
    use std::collections::{BTreeMap as Map, HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn hour(s: &str) -> HourRef {
        HourRef::parse(s).unwrap()
    }

    fn utterance(hour: HourRef, event: u32, ordinal: i32, text: &str) -> Utterance {
        let event_id = format!("ev{event}");
        Utterance {
            utterance_id: utterance_uuid(&event_id, SourceKind::Commit, ordinal),
            event_id,
            event_type: "PushEvent".into(),
            repo_id: 10 + i64::from(event),
            actor_id: 20 + i64::from(event),
            repo_name: "o/r".into(),
            actor_login: "u".into(),
            created_at: hour.at() + chrono::Duration::seconds(i64::from(event)),
            source: SourceKind::Commit,
            source_detail: "push:commit".into(),
            ordinal,
            text_raw: text.into(),
            text_normalized: text.to_lowercase(),
            lang_code: None,
            script: None,
        }
    }

    fn quick_cfg(workers: usize) -> BackfillConfig {
        BackfillConfig {
            workers,
            max_retries: 3,
            retry_base: Duration::from_millis(1),
            fetch_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            max_range_hours: 0,
            leases: true,
            lease_ttl: Duration::from_secs(60),
            detect: false,
            detect_version: 1,
            insert_chunk: 1000,
            delay_per_hour: Duration::ZERO,
        }
    }

    // -- Fakes -----------------------------------------------------------

    struct RowState {
        status: BfStatus,
        metrics: BackfillMetrics,
        leased: bool,
    }

    impl Default for RowState {
        fn default() -> Self {
            Self {
                status: BfStatus::Pending,
                metrics: BackfillMetrics::default(),
                leased: false,
            }
        }
    }

    struct FakeCoordinator {
        rows: Mutex<Map<HourRef, RowState>>,
    }

    impl FakeCoordinator {
        fn new() -> Self {
            Self {
                rows: Mutex::new(Map::new()),
            }
        }

        fn status_of(&self, hour: HourRef) -> BfStatus {
            self.rows.lock().unwrap()[&hour].status
        }

        fn metrics_of(&self, hour: HourRef) -> BackfillMetrics {
            self.rows.lock().unwrap()[&hour].metrics.clone()
        }

        fn reset_to_pending(&self) {
            for row in self.rows.lock().unwrap().values_mut() {
                row.status = BfStatus::Pending;
                row.leased = false;
            }
        }
    }

    #[async_trait]
    impl Coordinator for FakeCoordinator {
        async fn preseed(&self, start: HourRef, end: HourRef) -> CoreResult<u64> {
            let mut rows = self.rows.lock().unwrap();
            let mut seeded = 0;
            for h in HourRef::range_inclusive(start, end) {
                rows.entry(h).or_insert_with(|| {
                    seeded += 1;
                    RowState::default()
                });
            }
            Ok(seeded)
        }

        async fn claim_next(
            &self,
            window: Option<(HourRef, HourRef)>,
            _worker: &str,
            _ttl: Duration,
        ) -> CoreResult<Option<HourRef>> {
            let mut rows = self.rows.lock().unwrap();
            for (h, row) in rows.iter_mut() {
                if let Some((s, e)) = window {
                    if *h < s || *h > e {
                        continue;
                    }
                }
                if matches!(row.status, BfStatus::Pending | BfStatus::Error) && !row.leased {
                    row.status = BfStatus::Running;
                    row.leased = true;
                    return Ok(Some(*h));
                }
            }
            Ok(None)
        }

        async fn start_hour(&self, _hour: HourRef) -> CoreResult<()> {
            Ok(())
        }

        async fn finish_hour(
            &self,
            hour: HourRef,
            status: BfStatus,
            metrics: &BackfillMetrics,
        ) -> CoreResult<()> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.get_mut(&hour).expect("finished unseeded hour");
            row.status = status;
            row.metrics = metrics.clone();
            row.leased = false;
            Ok(())
        }
    }

    struct FakeSource {
        hours: HashMap<HourRef, Vec<Utterance>>,
        fetch_failures: AtomicU32,
        fetch_error: fn() -> CoreError,
        panic_on_extract: bool,
    }

    impl FakeSource {
        fn new(hours: HashMap<HourRef, Vec<Utterance>>) -> Self {
            Self {
                hours,
                fetch_failures: AtomicU32::new(0),
                fetch_error: || CoreError::new(ErrorCode::UpstreamUnavailable, "503"),
                panic_on_extract: false,
            }
        }

        fn failing_fetches(self, n: u32) -> Self {
            self.fetch_failures.store(n, Ordering::SeqCst);
            self
        }

        fn fatal_fetch(mut self) -> Self {
            self.fetch_failures.store(u32::MAX, Ordering::SeqCst);
            self.fetch_error = || CoreError::new(ErrorCode::HourArchiveMissing, "404");
            self
        }
    }

    #[async_trait]
    impl HourSource for FakeSource {
        async fn fetch(&self, hour: HourRef) -> CoreResult<ArchiveRef> {
            let left = self.fetch_failures.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    self.fetch_failures.store(left - 1, Ordering::SeqCst);
                }
                return Err((self.fetch_error)());
            }
            Ok(ArchiveRef {
                path: format!("/mem/{}", hour.cache_key()).into(),
                bytes: 128,
            })
        }

        async fn extract(&self, _archive: &ArchiveRef, hour: HourRef) -> CoreResult<ExtractOutcome> {
            if self.panic_on_extract {
                panic!("extractor exploded");
            }
            let utterances = self.hours.get(&hour).cloned().unwrap_or_default();
            Ok(ExtractOutcome {
                events: utterances.len() as u64,
                bytes_uncompressed: 4096,
                utterances,
            })
        }
    }

    /// Natural-key-deduping sink with an optional max batch size.
    struct FakeSink {
        seen: Mutex<HashSet<(String, String, i32)>>,
        max_batch: Option<usize>,
        batches: Mutex<Vec<usize>>,
    }

    impl FakeSink {
        fn new() -> Self {
            Self {
                seen: Mutex::new(HashSet::new()),
                max_batch: None,
                batches: Mutex::new(Vec::new()),
            }
        }

        fn with_max_batch(mut self, n: usize) -> Self {
            self.max_batch = Some(n);
            self
        }

        fn total_rows(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl UtteranceSink for FakeSink {
        async fn insert_batch(&self, batch: &[Utterance]) -> CoreResult<InsertStats> {
            if let Some(max) = self.max_batch {
                if batch.len() > max {
                    return Err(CoreError::new(ErrorCode::DbQuery, "batch too large"));
                }
            }
            self.batches.lock().unwrap().push(batch.len());
            let mut seen = self.seen.lock().unwrap();
            let mut stats = InsertStats::default();
            for u in batch {
                let key = (u.event_id.clone(), u.source.as_str().to_string(), u.ordinal);
                if seen.insert(key) {
                    stats.inserted += 1;
                } else {
                    stats.deduped += 1;
                }
            }
            Ok(stats)
        }
    }

    struct FakeEnsurer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl PrincipalEnsurer for FakeEnsurer {
        async fn ensure(&self, _repos: &Map<Hid, i64>, _actors: &Map<Hid, i64>) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingDetect {
        written: AtomicU32,
    }

    #[async_trait]
    impl DetectWriter for CountingDetect {
        async fn write(&self, inputs: &[WriteInput]) -> CoreResult<u64> {
            let hits = inputs
                .iter()
                .filter(|w| w.text_normalized.contains("shit"))
                .count() as u64;
            self.written.fetch_add(hits as u32, Ordering::SeqCst);
            Ok(hits)
        }
    }

    struct Harness {
        coordinator: Arc<FakeCoordinator>,
        sink: Arc<FakeSink>,
        service: BackfillService,
    }

    fn harness(
        hours: HashMap<HourRef, Vec<Utterance>>,
        cfg: BackfillConfig,
        source_tweak: impl FnOnce(FakeSource) -> FakeSource,
        sink: FakeSink,
        detect: Option<Arc<dyn DetectWriter>>,
    ) -> Harness {
        let coordinator = Arc::new(FakeCoordinator::new());
        let sink = Arc::new(sink);
        let service = BackfillService::new(
            coordinator.clone(),
            Arc::new(source_tweak(FakeSource::new(hours))),
            sink.clone(),
            Arc::new(FakeEnsurer {
                calls: AtomicU32::new(0),
            }),
            detect,
            cfg,
            CancelToken::new(),
        );
        Harness {
            coordinator,
            sink,
            service,
        }
    }

    fn fixture_hours() -> HashMap<HourRef, Vec<Utterance>> {
        let h0 = hour("2025-08-01T00");
        let h1 = hour("2025-08-01T01");
        HashMap::from([
            (
                h0,
                vec![
                    utterance(h0, 1, 0, "fix the build"),
                    utterance(h0, 2, 0, "this is shit"),
                ],
            ),
            (h1, vec![utterance(h1, 3, 0, "another commit")]),
        ])
    }

    // -- Happy path -------------------------------------------------------

    #[tokio::test]
    async fn processes_a_range_to_ok() {
        let h = harness(fixture_hours(), quick_cfg(2), |s| s, FakeSink::new(), None);
        let outcome = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(outcome.hours_ok, 2);
        assert_eq!(outcome.hours_error, 0);
        assert_eq!(outcome.inserted, 3);
        assert_eq!(outcome.deduped, 0);
        assert_eq!(h.coordinator.status_of(hour("2025-08-01T00")), BfStatus::Ok);
        assert_eq!(h.coordinator.status_of(hour("2025-08-01T01")), BfStatus::Ok);
        let m = h.coordinator.metrics_of(hour("2025-08-01T00"));
        assert!(m.balanced());
        assert_eq!(m.events, 2);
    }

    #[tokio::test]
    async fn plan_range_only_preseeds() {
        let h = harness(fixture_hours(), quick_cfg(1), |s| s, FakeSink::new(), None);
        let seeded = h
            .service
            .plan_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(seeded, 2);
        assert_eq!(h.sink.total_rows(), 0);
        assert_eq!(
            h.coordinator.status_of(hour("2025-08-01T00")),
            BfStatus::Pending
        );
    }

    // -- Replay / idempotence ---------------------------------------------

    #[tokio::test]
    async fn rerun_on_ok_range_is_a_no_op() {
        let h = harness(fixture_hours(), quick_cfg(1), |s| s, FakeSink::new(), None);
        let first = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(first.inserted, 3);

        let second = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(second.hours_ok, 0, "ok hours are not reclaimed");
        assert_eq!(second.inserted, 0);
    }

    #[tokio::test]
    async fn replay_after_reset_dedupes_everything() {
        let h = harness(fixture_hours(), quick_cfg(1), |s| s, FakeSink::new(), None);
        let first = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();

        // Coordinator state lost; raw rows survive. The replay must insert
        // nothing new and count every row as a dedup.
        h.coordinator.reset_to_pending();
        let second = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.deduped, first.inserted);
        assert_eq!(h.coordinator.status_of(hour("2025-08-01T00")), BfStatus::Ok);
        let m = h.coordinator.metrics_of(hour("2025-08-01T00"));
        assert!(m.balanced());
    }

    // -- Retry & failure semantics ----------------------------------------

    #[tokio::test]
    async fn transient_fetch_failures_retry_to_ok() {
        let h = harness(
            fixture_hours(),
            quick_cfg(1),
            |s| s.failing_fetches(2),
            FakeSink::new(),
            None,
        );
        let outcome = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        assert_eq!(outcome.hours_ok, 1);
    }

    #[tokio::test]
    async fn terminal_fetch_marks_hour_error_without_retry() {
        let h = harness(
            fixture_hours(),
            quick_cfg(1),
            FakeSource::fatal_fetch,
            FakeSink::new(),
            None,
        );
        let err = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(
            h.coordinator.status_of(hour("2025-08-01T00")),
            BfStatus::Error
        );
        let m = h.coordinator.metrics_of(hour("2025-08-01T00"));
        assert!(m.err_text.unwrap().contains("HOUR_ARCHIVE_MISSING"));
    }

    #[tokio::test]
    async fn panic_becomes_hour_error() {
        let mut source_hours = fixture_hours();
        source_hours.remove(&hour("2025-08-01T01"));
        let h = harness(
            source_hours,
            quick_cfg(1),
            |mut s| {
                s.panic_on_extract = true;
                s
            },
            FakeSink::new(),
            None,
        );
        let err = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
        let m = h.coordinator.metrics_of(hour("2025-08-01T00"));
        assert!(m.err_text.unwrap().contains("panic"));
    }

    #[tokio::test]
    async fn inverted_range_is_rejected() {
        let h = harness(HashMap::new(), quick_cfg(1), |s| s, FakeSink::new(), None);
        let err = h
            .service
            .run_range(hour("2025-08-01T05"), hour("2025-08-01T00"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeInvalid);
    }

    #[tokio::test]
    async fn oversized_range_is_rejected_when_capped() {
        let mut cfg = quick_cfg(1);
        cfg.max_range_hours = 2;
        let h = harness(HashMap::new(), cfg, |s| s, FakeSink::new(), None);
        let err = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T05"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RangeInvalid);
    }

    // -- Bisection ---------------------------------------------------------

    #[tokio::test]
    async fn oversized_batches_bisect_down_to_success() {
        let h0 = hour("2025-08-01T00");
        let utterances: Vec<Utterance> = (0..10).map(|n| utterance(h0, n, 0, "text")).collect();
        let hours = HashMap::from([(h0, utterances)]);
        // The sink rejects batches above 2 rows; bisection must land every
        // row anyway.
        let h = harness(
            hours,
            quick_cfg(1),
            |s| s,
            FakeSink::new().with_max_batch(2),
            None,
        );
        let outcome = h.service.run_range(h0, h0).await.unwrap();
        assert_eq!(outcome.inserted, 10);
        assert_eq!(h.sink.total_rows(), 10);
        let batches = h.sink.batches.lock().unwrap().clone();
        assert!(batches.iter().all(|n| *n <= 2));
    }

    // -- Contention & workers ----------------------------------------------

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_the_same_hour() {
        let coordinator = Arc::new(FakeCoordinator::new());
        coordinator
            .preseed(hour("2025-08-01T00"), hour("2025-08-01T00"))
            .await
            .unwrap();
        let a = coordinator
            .claim_next(None, "w0", Duration::from_secs(60))
            .await
            .unwrap();
        let b = coordinator
            .claim_next(None, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(a.is_some() ^ b.is_some(), "exactly one claimer wins");
    }

    #[tokio::test]
    async fn worker_pool_processes_each_hour_exactly_once() {
        let h0 = hour("2025-08-01T00");
        let mut hours = HashMap::new();
        for i in 0..6 {
            let h = HourRef::truncate(h0.at() + chrono::Duration::hours(i));
            hours.insert(h, vec![utterance(h, i as u32, 0, "text")]);
        }
        let h = harness(hours, quick_cfg(4), |s| s, FakeSink::new(), None);
        let outcome = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T05"))
            .await
            .unwrap();
        assert_eq!(outcome.hours_ok, 6);
        assert_eq!(outcome.inserted, 6);
        assert_eq!(h.sink.total_rows(), 6);
    }

    // -- Inline detect ------------------------------------------------------

    #[tokio::test]
    async fn inline_detect_counts_hits() {
        let detect = Arc::new(CountingDetect {
            written: AtomicU32::new(0),
        });
        let h = harness(
            fixture_hours(),
            quick_cfg(1),
            |s| s,
            FakeSink::new(),
            Some(detect.clone()),
        );
        let outcome = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(outcome.hits, 1, "one fixture utterance contains profanity");
        assert_eq!(detect.written.load(Ordering::SeqCst), 1);
        let m = h.coordinator.metrics_of(hour("2025-08-01T00"));
        assert_eq!(m.hits, 1);
    }

    // -- Cancellation --------------------------------------------------------

    #[tokio::test]
    async fn cancelled_run_claims_nothing_further() {
        let h = harness(fixture_hours(), quick_cfg(1), |s| s, FakeSink::new(), None);
        h.service.cancel.cancel();
        let outcome = h
            .service
            .run_range(hour("2025-08-01T00"), hour("2025-08-01T01"))
            .await
            .unwrap();
        assert_eq!(outcome.hours_ok, 0);
        assert_eq!(h.sink.total_rows(), 0);
    }
}
