// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ports the nightshift service is wired with.

use async_trait::async_trait;
use sj_columnar::ArchiveRow;
use sj_core::{HitRecord, HourRef, NightshiftMetrics, NsStatus};
use sj_error::CoreResult;
use sj_identity::Hid;
use std::time::Duration;
use uuid::Uuid;

/// Coordinator surface for the `ns_*` sub-state.
#[async_trait]
pub trait NsCoordinator: Send + Sync {
    /// Claim the lowest hour with `bf_status='ok'` and claimable `ns_status`.
    async fn claim_next(&self, worker: &str, ttl: Duration) -> CoreResult<Option<HourRef>>;

    /// Direct single-hour transition `pending|error → running`; zero rows
    /// updated surfaces as `LEASE_HELD`.
    async fn start(&self, hour: HourRef, worker: &str, ttl: Duration) -> CoreResult<()>;

    /// Terminal write: status + metrics, lease cleared.
    async fn finish(
        &self,
        hour: HourRef,
        status: NsStatus,
        metrics: &NightshiftMetrics,
    ) -> CoreResult<()>;
}

/// Raw hits read/delete surface (columnar store).
#[async_trait]
pub trait HitArchiveSource: Send + Sync {
    /// Hits recorded for the hour at the detector version.
    async fn count_for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<u64>;

    /// Read the hour's hits for archive composition.
    async fn for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<Vec<HitRecord>>;

    /// Delete the hour's raw hits (retention). Returns rows removed.
    async fn delete_hour(&self, hour: HourRef) -> CoreResult<u64>;
}

/// `commit_crimes` write surface.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Synchronously delete the `(hour, detver)` slice. Returns rows removed.
    async fn delete_slice(&self, hour: HourRef, detver: i32) -> CoreResult<u64>;

    /// Insert archive rows. Returns rows accepted.
    async fn insert(&self, rows: &[ArchiveRow]) -> CoreResult<u64>;
}

/// Denormalized utterance features copied into archive rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtteranceFeature {
    /// Normalized text length in bytes.
    pub text_len: i32,
    /// Detected language, if any.
    pub lang_code: Option<String>,
    /// Detected script, if any.
    pub script: Option<String>,
    /// Repository slug, revealed only with an opt-in receipt.
    pub repo_name: String,
}

/// Utterance feature lookups and raw-utterance retention (relational store).
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Features for the given utterance IDs; absent IDs are simply missing.
    async fn features_by_ids(
        &self,
        ids: &[Uuid],
    ) -> CoreResult<std::collections::HashMap<Uuid, UtteranceFeature>>;

    /// Delete the hour's raw utterances (retention). Returns rows removed.
    async fn delete_hour(&self, hour: HourRef) -> CoreResult<u64>;
}

/// Opt-in consent lookup consulted at archive time.
#[async_trait]
pub trait ConsentGate: Send + Sync {
    /// The subset of `hids` holding an active opt-in receipt.
    async fn optin_repos(&self, hids: &[Hid]) -> CoreResult<Vec<Hid>>;
}
