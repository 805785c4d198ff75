// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ports the orchestrator is wired with.
//!
//! Plain constructor injection: the CLI hands the service concrete store and
//! ingest adapters; tests hand it in-memory fakes. The optional detect path
//! arrives as the narrow `DetectWriter` capability from `sj-detect`, which
//! is what keeps backfill and detect free of a crate cycle.

use async_trait::async_trait;
use sj_core::{BackfillMetrics, BfStatus, HourRef, Utterance};
use sj_error::CoreResult;
use sj_identity::Hid;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator surface the orchestrator needs.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Idempotently seed `pending` rows for `[start, end]`.
    async fn preseed(&self, start: HourRef, end: HourRef) -> CoreResult<u64>;

    /// Claim the lowest claimable hour; `None` drains the worker.
    async fn claim_next(
        &self,
        window: Option<(HourRef, HourRef)>,
        worker: &str,
        ttl: Duration,
    ) -> CoreResult<Option<HourRef>>;

    /// Best-effort start marker.
    async fn start_hour(&self, hour: HourRef) -> CoreResult<()>;

    /// Terminal write: status + metrics, lease cleared.
    async fn finish_hour(
        &self,
        hour: HourRef,
        status: BfStatus,
        metrics: &BackfillMetrics,
    ) -> CoreResult<()>;
}

/// A fetched archive, ready to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRef {
    /// Local path of the gzip archive.
    pub path: PathBuf,
    /// Compressed size.
    pub bytes: u64,
}

/// What extraction produced for one hour.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractOutcome {
    /// Utterances in extraction order.
    pub utterances: Vec<Utterance>,
    /// Events decoded.
    pub events: u64,
    /// Uncompressed bytes read.
    pub bytes_uncompressed: u64,
}

/// Fetch + read/extract surface.
#[async_trait]
pub trait HourSource: Send + Sync {
    /// Retrieve the hour's archive (cache-aware).
    async fn fetch(&self, hour: HourRef) -> CoreResult<ArchiveRef>;

    /// Decode the archive and project utterances.
    async fn extract(&self, archive: &ArchiveRef, hour: HourRef) -> CoreResult<ExtractOutcome>;
}

/// One insert attempt's accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    /// Rows newly inserted.
    pub inserted: u64,
    /// Rows deduplicated by the natural key.
    pub deduped: u64,
}

impl std::ops::Add for InsertStats {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self {
            inserted: self.inserted + rhs.inserted,
            deduped: self.deduped + rhs.deduped,
        }
    }
}

/// Raw utterance write surface. One call is one transaction; the
/// orchestrator owns retries and bisection above it.
#[async_trait]
pub trait UtteranceSink: Send + Sync {
    /// Insert a batch; unique-key collisions count as dedups, not errors.
    async fn insert_batch(&self, batch: &[Utterance]) -> CoreResult<InsertStats>;
}

/// Principal upsert surface, called before each batch insert.
#[async_trait]
pub trait PrincipalEnsurer: Send + Sync {
    /// Ensure principal + mapping rows for the given HID → numeric-ID sets.
    async fn ensure(
        &self,
        repos: &BTreeMap<Hid, i64>,
        actors: &BTreeMap<Hid, i64>,
    ) -> CoreResult<()>;
}
