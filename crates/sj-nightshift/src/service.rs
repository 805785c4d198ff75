// SPDX-License-Identifier: MIT OR Apache-2.0
//! Nightshift service: claim loop, archive write, retention.

use crate::ports::{ArchiveSink, ConsentGate, FeatureSource, HitArchiveSource, NsCoordinator};
use chrono::Utc;
use futures::FutureExt;
use sj_columnar::{archive_hit_id, ArchiveRow};
use sj_config::NightshiftConfig;
use sj_core::{HitRecord, HourRef, NightshiftMetrics, NsStatus};
use sj_error::{CoreError, CoreResult, ErrorCode};
use sj_identity::Hid;
use sj_retry::CancelToken;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Rows per archive insert.
const ARCHIVE_CHUNK: usize = 1000;

/// Aggregated result of a nightshift run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NightshiftOutcome {
    /// Hours reaching `retention_applied`.
    pub hours_ok: u64,
    /// Hours finishing `error`.
    pub hours_error: u64,
    /// Archive rows written.
    pub archived: u64,
    /// Raw hit rows pruned.
    pub pruned_hits: u64,
    /// Raw utterance rows pruned.
    pub pruned_utterances: u64,
}

enum HourStatus {
    Ok,
    Error,
}

/// The archival + retention worker pool.
#[derive(Clone)]
pub struct NightshiftService {
    coordinator: Arc<dyn NsCoordinator>,
    hits: Arc<dyn HitArchiveSource>,
    archive: Arc<dyn ArchiveSink>,
    features: Arc<dyn FeatureSource>,
    consent: Arc<dyn ConsentGate>,
    cfg: NightshiftConfig,
    cancel: CancelToken,
}

impl NightshiftService {
    /// Wire a service from its ports.
    pub fn new(
        coordinator: Arc<dyn NsCoordinator>,
        hits: Arc<dyn HitArchiveSource>,
        archive: Arc<dyn ArchiveSink>,
        features: Arc<dyn FeatureSource>,
        consent: Arc<dyn ConsentGate>,
        cfg: NightshiftConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            coordinator,
            hits,
            archive,
            features,
            consent,
            cfg,
            cancel,
        }
    }

    /// Drain everything nightshift-ready, with `cfg.workers` workers.
    pub async fn run(&self) -> CoreResult<NightshiftOutcome> {
        let mut handles = Vec::with_capacity(self.cfg.workers);
        for idx in 0..self.cfg.workers {
            let svc = self.clone();
            let tag = format!("ns:{}:w{idx}", std::process::id());
            handles.push(tokio::spawn(async move { svc.worker_loop(tag).await }));
        }

        let mut outcome = NightshiftOutcome::default();
        for handle in handles {
            match handle.await {
                Ok(worker) => {
                    outcome.hours_ok += worker.hours_ok;
                    outcome.hours_error += worker.hours_error;
                    outcome.archived += worker.archived;
                    outcome.pruned_hits += worker.pruned_hits;
                    outcome.pruned_utterances += worker.pruned_utterances;
                }
                Err(join_err) => {
                    error!(component = "nightshift", error = %join_err, "worker task died");
                    outcome.hours_error += 1;
                }
            }
        }

        info!(
            component = "nightshift",
            hours_ok = outcome.hours_ok,
            hours_error = outcome.hours_error,
            archived = outcome.archived,
            pruned_hits = outcome.pruned_hits,
            pruned_utterances = outcome.pruned_utterances,
            retention = %self.cfg.retention,
            "nightshift complete"
        );

        if outcome.hours_error > 0 {
            return Err(CoreError::new(ErrorCode::Internal, "hours ended in error")
                .with_context("hours_error", outcome.hours_error));
        }
        Ok(outcome)
    }

    /// Archive + prune a single hour directly (operator invocation).
    pub async fn run_hour(&self, hour: HourRef, worker: &str) -> CoreResult<NightshiftMetrics> {
        self.coordinator.start(hour, worker, self.cfg.lease_ttl).await?;
        let (status, metrics) = self.process_claimed(hour).await;
        match status {
            HourStatus::Ok => Ok(metrics),
            HourStatus::Error => Err(CoreError::new(ErrorCode::Internal, "hour ended in error")
                .with_context("hour", hour.to_string())
                .with_context("err_text", metrics.err_text.unwrap_or_default())),
        }
    }

    async fn worker_loop(&self, tag: String) -> NightshiftOutcome {
        let mut outcome = NightshiftOutcome::default();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let claimed = match self
                .coordinator
                .claim_next(&tag, self.cfg.lease_ttl)
                .await
            {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(component = "nightshift", worker = %tag, error = %err, "claim failed");
                    outcome.hours_error += 1;
                    break;
                }
            };
            let Some(hour) = claimed else {
                debug!(component = "nightshift", worker = %tag, "nothing claimable");
                break;
            };

            let (status, metrics) = self.process_claimed(hour).await;
            match status {
                HourStatus::Ok => {
                    outcome.hours_ok += 1;
                    outcome.archived += metrics.archived;
                    outcome.pruned_hits += metrics.pruned_hits;
                    outcome.pruned_utterances += metrics.pruned_utterances;
                }
                HourStatus::Error => outcome.hours_error += 1,
            }
        }
        outcome
    }

    /// Process an already-claimed hour, always finalizing its row.
    async fn process_claimed(&self, hour: HourRef) -> (HourStatus, NightshiftMetrics) {
        let started = Instant::now();
        let svc = self.clone();
        let body = async move {
            let mut metrics = NightshiftMetrics::default();
            let result = svc.archive_and_prune(hour, &mut metrics).await;
            (metrics, result)
        };
        let (mut metrics, result) = match std::panic::AssertUnwindSafe(body).catch_unwind().await {
            Ok(pair) => pair,
            Err(panic) => {
                let text = panic_text(&panic);
                (
                    NightshiftMetrics::default(),
                    Err(CoreError::new(ErrorCode::Internal, format!("panic: {text}"))),
                )
            }
        };
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;

        let status = match result {
            Ok(()) => {
                self.finalize(hour, NsStatus::RetentionApplied, &metrics).await;
                HourStatus::Ok
            }
            Err(err) => {
                metrics.err_text = Some(err.err_text(500));
                self.finalize(hour, NsStatus::Error, &metrics).await;
                HourStatus::Error
            }
        };
        (status, metrics)
    }

    async fn finalize(&self, hour: HourRef, status: NsStatus, metrics: &NightshiftMetrics) {
        if let Err(err) = self.coordinator.finish(hour, status, metrics).await {
            error!(component = "nightshift", hour = %hour, error = %err, "finish failed");
        }
    }

    async fn archive_and_prune(
        &self,
        hour: HourRef,
        metrics: &mut NightshiftMetrics,
    ) -> CoreResult<()> {
        let detver = self.cfg.detect_version;

        let hit_count = self.hits.count_for_hour(hour, detver).await?;
        if hit_count > 0 {
            // Idempotent slice rewrite: delete, recompose, insert.
            self.archive.delete_slice(hour, detver).await?;
            let rows = self.compose_rows(hour, detver).await?;
            for chunk in rows.chunks(ARCHIVE_CHUNK) {
                if self.cancel.is_cancelled() {
                    return Err(CoreError::new(ErrorCode::ContextCancelled, "context canceled"));
                }
                metrics.archived += self.archive.insert(chunk).await?;
            }
        } else {
            debug!(component = "nightshift", hour = %hour, "no hits, nothing to archive");
        }

        if self.cfg.retention.should_prune(hour.next().at(), Utc::now()) {
            metrics.pruned_hits = self.hits.delete_hour(hour).await?;
            metrics.pruned_utterances = self.features.delete_hour(hour).await?;
            info!(
                component = "nightshift",
                hour = %hour,
                pruned_hits = metrics.pruned_hits,
                pruned_utterances = metrics.pruned_utterances,
                "raw data pruned"
            );
        }

        Ok(())
    }

    /// Join the hour's hits with utterance features and the opt-in set.
    async fn compose_rows(&self, hour: HourRef, detver: i32) -> CoreResult<Vec<ArchiveRow>> {
        let hits = self.hits.for_hour(hour, detver).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<uuid::Uuid> = hits.iter().map(|h| h.utterance_id).collect();
        ids.sort();
        ids.dedup();
        let features = self.features.features_by_ids(&ids).await?;

        let mut repo_hids: Vec<Hid> = hits.iter().map(|h| h.repo_hid).collect();
        repo_hids.sort();
        repo_hids.dedup();
        let optin: HashSet<Hid> = self
            .consent
            .optin_repos(&repo_hids)
            .await?
            .into_iter()
            .collect();

        let rows = hits
            .iter()
            .map(|hit| self.compose_row(hour, detver, hit, &features, &optin))
            .collect();
        Ok(rows)
    }

    fn compose_row(
        &self,
        hour: HourRef,
        detver: i32,
        hit: &HitRecord,
        features: &std::collections::HashMap<uuid::Uuid, crate::ports::UtteranceFeature>,
        optin: &HashSet<Hid>,
    ) -> ArchiveRow {
        let feature = features.get(&hit.utterance_id);
        let revealed = optin.contains(&hit.repo_hid);
        if feature.is_none() {
            warn!(
                component = "nightshift",
                utterance = %hit.utterance_id,
                "archiving hit without utterance features"
            );
        }

        ArchiveRow {
            bucket_hour: hour.at(),
            detver,
            hit_id: archive_hit_id(
                hit.utterance_id,
                &hit.term,
                hit.span_start,
                hit.span_end,
                detver,
            ),
            utterance_id: hit.utterance_id,
            created_at: hit.created_at,
            source: hit.source.as_str().to_string(),
            repo_hid: hit.repo_hid,
            actor_hid: hit.actor_hid,
            repo_name: feature.and_then(|f| {
                (revealed && !f.repo_name.is_empty()).then(|| f.repo_name.clone())
            }),
            lang_code: feature.and_then(|f| f.lang_code.clone()).or_else(|| hit.lang_code.clone()),
            script: feature.and_then(|f| f.script.clone()),
            text_len: feature.map(|f| f.text_len).unwrap_or_default(),
            term: hit.term.clone(),
            category: hit.category.clone(),
            severity: hit.severity,
            severity_label: hit.severity_label.clone(),
            span_start: hit.span_start,
            span_end: hit.span_end,
            detector_source: hit.detector_source.as_str().to_string(),
            target_type: hit.target_type.as_str().to_string(),
            target_name: hit.target_name.clone(),
        }
    }
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
