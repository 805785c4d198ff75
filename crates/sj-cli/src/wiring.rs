// SPDX-License-Identifier: MIT OR Apache-2.0
//! Constructor injection: build each service from env config and concrete
//! store/ingest adapters. Everything is explicit (no registries, no global
//! lookup), so a test harness can assemble the same services from fakes.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sj_backfill::{
    ArchiveRef, BackfillService, Coordinator, ExtractOutcome, HourSource, InsertStats,
    PrincipalEnsurer, UtteranceSink,
};
use sj_columnar::{ArchiveRow, ArchiveStore, ClickhouseClient, HitStore};
use sj_config::{
    BackfillConfig, ClickhouseConfig, DetectConfig, IngestConfig, NightshiftConfig, PgConfig,
    ProcessEnv,
};
use sj_core::{BackfillMetrics, BfStatus, HitRecord, HourRef, NightshiftMetrics, NsStatus, Utterance};
use sj_detect::{DetectOptions, DetectService, DetectWriter, Detector};
use sj_error::CoreResult;
use sj_identity::Hid;
use sj_ingest::{extract_utterances, read_events, Fetcher, ReadPolicy};
use sj_nightshift::{
    ArchiveSink, ConsentGate, FeatureSource, HitArchiveSource, NightshiftService, NsCoordinator,
    UtteranceFeature,
};
use sj_retry::CancelToken;
use sj_rulepack::{CompiledPack, Rulepack};
use sj_store::consent::ConsentStore;
use sj_store::hours::HourCoordinator;
use sj_store::identity::IdentityStore;
use sj_store::utterances::UtteranceStore;
use sj_store::PgStore;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Backfill adapters
// ---------------------------------------------------------------------------

struct BfCoordinator(HourCoordinator);

#[async_trait]
impl Coordinator for BfCoordinator {
    async fn preseed(&self, start: HourRef, end: HourRef) -> CoreResult<u64> {
        self.0.preseed(start, end).await
    }

    async fn claim_next(
        &self,
        window: Option<(HourRef, HourRef)>,
        worker: &str,
        ttl: Duration,
    ) -> CoreResult<Option<HourRef>> {
        self.0.claim_next_bf(window, worker, ttl).await
    }

    async fn start_hour(&self, hour: HourRef) -> CoreResult<()> {
        self.0.start_bf(hour).await
    }

    async fn finish_hour(
        &self,
        hour: HourRef,
        status: BfStatus,
        metrics: &BackfillMetrics,
    ) -> CoreResult<()> {
        self.0.finish_bf(hour, status, metrics).await
    }
}

/// Fetch + blocking read/extract over the ingest adapters.
struct IngestSource {
    fetcher: Fetcher,
    policy: ReadPolicy,
}

#[async_trait]
impl HourSource for IngestSource {
    async fn fetch(&self, hour: HourRef) -> CoreResult<ArchiveRef> {
        let cached = self.fetcher.fetch(hour).await?;
        Ok(ArchiveRef {
            path: cached.path,
            bytes: cached.bytes,
        })
    }

    async fn extract(&self, archive: &ArchiveRef, _hour: HourRef) -> CoreResult<ExtractOutcome> {
        let path = archive.path.clone();
        let policy = self.policy;
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path).map_err(|e| {
                sj_error::CoreError::new(sj_error::ErrorCode::Internal, "cache file vanished")
                    .with_context("path", path.display().to_string())
                    .with_source(e)
            })?;
            let mut utterances = Vec::new();
            let stats = read_events(file, policy, |envelope| {
                utterances.extend(extract_utterances(&envelope));
                Ok(())
            })?;
            Ok(ExtractOutcome {
                utterances,
                events: stats.events,
                bytes_uncompressed: stats.bytes_uncompressed,
            })
        })
        .await
        .map_err(|e| {
            sj_error::CoreError::new(sj_error::ErrorCode::Internal, "extract task failed")
                .with_context("detail", e.to_string())
        })?
    }
}

struct SinkAdapter(UtteranceStore);

#[async_trait]
impl UtteranceSink for SinkAdapter {
    async fn insert_batch(&self, batch: &[Utterance]) -> CoreResult<InsertStats> {
        let outcome = self.0.insert_batch(batch).await?;
        Ok(InsertStats {
            inserted: outcome.inserted,
            deduped: outcome.deduped,
        })
    }
}

struct EnsurerAdapter(IdentityStore);

#[async_trait]
impl PrincipalEnsurer for EnsurerAdapter {
    async fn ensure(
        &self,
        repos: &BTreeMap<Hid, i64>,
        actors: &BTreeMap<Hid, i64>,
    ) -> CoreResult<()> {
        self.0.ensure_principals_and_maps(repos, actors).await
    }
}

// ---------------------------------------------------------------------------
// Nightshift adapters
// ---------------------------------------------------------------------------

struct NsCoordinatorAdapter(HourCoordinator);

#[async_trait]
impl NsCoordinator for NsCoordinatorAdapter {
    async fn claim_next(&self, worker: &str, ttl: Duration) -> CoreResult<Option<HourRef>> {
        self.0.claim_next_ns(worker, ttl).await
    }

    async fn start(&self, hour: HourRef, worker: &str, ttl: Duration) -> CoreResult<()> {
        self.0.start_ns(hour, worker, ttl).await
    }

    async fn finish(
        &self,
        hour: HourRef,
        status: NsStatus,
        metrics: &NightshiftMetrics,
    ) -> CoreResult<()> {
        self.0.finish_ns(hour, status, metrics).await
    }
}

struct HitsAdapter(HitStore);

#[async_trait]
impl HitArchiveSource for HitsAdapter {
    async fn count_for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<u64> {
        self.0.count_for_hour(hour, detver).await
    }

    async fn for_hour(&self, hour: HourRef, detver: i32) -> CoreResult<Vec<HitRecord>> {
        self.0.for_hour(hour, detver).await
    }

    async fn delete_hour(&self, hour: HourRef) -> CoreResult<u64> {
        self.0.delete_hour(hour).await
    }
}

struct ArchiveAdapter(ArchiveStore);

#[async_trait]
impl ArchiveSink for ArchiveAdapter {
    async fn delete_slice(&self, hour: HourRef, detver: i32) -> CoreResult<u64> {
        self.0.delete_slice(hour, detver).await
    }

    async fn insert(&self, rows: &[ArchiveRow]) -> CoreResult<u64> {
        self.0.insert(rows).await
    }
}

struct FeaturesAdapter(UtteranceStore);

#[async_trait]
impl FeatureSource for FeaturesAdapter {
    async fn features_by_ids(&self, ids: &[Uuid]) -> CoreResult<HashMap<Uuid, UtteranceFeature>> {
        let rows = self.0.features_by_ids(ids).await?;
        Ok(rows
            .into_iter()
            .map(|f| {
                (
                    f.utterance_id,
                    UtteranceFeature {
                        text_len: f.text_len,
                        lang_code: f.lang_code,
                        script: f.script,
                        repo_name: f.repo_name,
                    },
                )
            })
            .collect())
    }

    async fn delete_hour(&self, hour: HourRef) -> CoreResult<u64> {
        self.0.delete_hour(hour).await
    }
}

struct ConsentAdapter(ConsentStore);

#[async_trait]
impl ConsentGate for ConsentAdapter {
    async fn optin_repos(&self, hids: &[Hid]) -> CoreResult<Vec<Hid>> {
        self.0.optin_repos(hids).await
    }
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

async fn pg_store() -> Result<PgStore> {
    let cfg = PgConfig::load(&ProcessEnv).context("loading SERVICE_PGSQL_* config")?;
    PgStore::connect(&cfg)
        .await
        .context("connecting to the relational store")
}

fn clickhouse_client() -> Result<ClickhouseClient> {
    let cfg = ClickhouseConfig::load(&ProcessEnv).context("loading SERVICE_CLICKHOUSE_* config")?;
    ClickhouseClient::new(&cfg).context("building the columnar client")
}

fn load_detector(rules: Option<&PathBuf>, version: i32) -> Result<Detector> {
    let pack = match rules {
        Some(path) => Rulepack::from_path(path)
            .with_context(|| format!("loading rule pack {}", path.display()))?
            .compile()
            .context("compiling rule pack")?,
        None => CompiledPack::bundled().context("compiling the bundled rule pack")?,
    };
    Ok(Detector::new(Arc::new(pack), version))
}

/// Build the backfill service from the environment.
pub async fn backfill_service(
    workers: Option<usize>,
    rules: Option<PathBuf>,
    cancel: CancelToken,
) -> Result<BackfillService> {
    let mut cfg = BackfillConfig::load(&ProcessEnv).context("loading CORE_BACKFILL_* config")?;
    if let Some(workers) = workers {
        cfg.workers = workers.max(1);
    }
    let ingest_cfg = IngestConfig::load(&ProcessEnv).context("loading CORE_INGEST_* config")?;

    let pg = pg_store().await?;
    let coordinator = Arc::new(BfCoordinator(HourCoordinator::new(pg.clone())));
    let source = Arc::new(IngestSource {
        fetcher: Fetcher::new(&ingest_cfg).context("building the fetcher")?,
        policy: ReadPolicy {
            strict: ingest_cfg.strict,
            fail_on_first_error: ingest_cfg.fail_on_first_error,
        },
    });
    let sink = Arc::new(SinkAdapter(UtteranceStore::new(pg.clone())));
    let ensurer = Arc::new(EnsurerAdapter(IdentityStore::new(pg.clone())));

    let detect: Option<Arc<dyn DetectWriter>> = if cfg.detect {
        let detect_cfg = DetectConfig::load(&ProcessEnv).context("loading CORE_DETECT_* config")?;
        let detector = load_detector(rules.as_ref(), cfg.detect_version)?;
        let service = DetectService::new(
            detector,
            Arc::new(UtteranceStore::new(pg.clone())),
            Arc::new(HitStore::new(clickhouse_client()?)),
            DetectOptions {
                workers: detect_cfg.workers,
                page_size: detect_cfg.page_size,
                write_chunk: 1000,
                dry_run: detect_cfg.dry_run,
            },
        );
        Some(Arc::new(service))
    } else {
        None
    };

    Ok(BackfillService::new(
        coordinator,
        source,
        sink,
        ensurer,
        detect,
        cfg,
        cancel,
    ))
}

/// Build the detect service from the environment, with flag overrides.
pub async fn detect_service(
    workers: Option<usize>,
    page: Option<u32>,
    ver: Option<i32>,
    dry_run: bool,
    rules: Option<PathBuf>,
) -> Result<DetectService> {
    let mut cfg = DetectConfig::load(&ProcessEnv).context("loading CORE_DETECT_* config")?;
    if let Some(workers) = workers {
        cfg.workers = workers.max(1);
    }
    if let Some(page) = page {
        cfg.page_size = page.max(1);
    }
    if let Some(ver) = ver {
        cfg.version = ver;
    }
    cfg.dry_run = cfg.dry_run || dry_run;

    let pg = pg_store().await?;
    let detector = load_detector(rules.as_ref(), cfg.version)?;
    Ok(DetectService::new(
        detector,
        Arc::new(UtteranceStore::new(pg)),
        Arc::new(HitStore::new(clickhouse_client()?)),
        DetectOptions {
            workers: cfg.workers,
            page_size: cfg.page_size,
            write_chunk: 1000,
            dry_run: cfg.dry_run,
        },
    ))
}

/// Build the nightshift service from the environment.
pub async fn nightshift_service(
    workers: Option<usize>,
    cancel: CancelToken,
) -> Result<NightshiftService> {
    let mut cfg = NightshiftConfig::load(&ProcessEnv).context("loading CORE_NIGHTSHIFT_* config")?;
    if let Some(workers) = workers {
        cfg.workers = workers.max(1);
    }

    let pg = pg_store().await?;
    let ch = clickhouse_client()?;
    Ok(NightshiftService::new(
        Arc::new(NsCoordinatorAdapter(HourCoordinator::new(pg.clone()))),
        Arc::new(HitsAdapter(HitStore::new(ch.clone()))),
        Arc::new(ArchiveAdapter(ArchiveStore::new(ch))),
        Arc::new(FeaturesAdapter(UtteranceStore::new(pg.clone()))),
        Arc::new(ConsentAdapter(ConsentStore::new(pg))),
        cfg,
        cancel,
    ))
}
