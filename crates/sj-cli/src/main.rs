// SPDX-License-Identifier: MIT OR Apache-2.0
//! Swearjar pipeline driver.
//!
//! One binary, three services: `backfill` (run/plan/resume), `detect`, and
//! `nightshift`. Store and service settings come from the environment
//! (`SERVICE_PGSQL_*`, `SERVICE_CLICKHOUSE_*`, `CORE_*`); the flags here
//! override the per-run knobs only.

#![deny(unsafe_code)]

mod wiring;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sj_core::HourRef;
use sj_retry::CancelToken;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for runtime errors.
const EXIT_RUNTIME_ERROR: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "swearjar", version, about = "Swearjar pipeline driver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Backfill hourly archives into raw utterances.
    Backfill {
        #[command(subcommand)]
        action: BackfillAction,
    },

    /// Scan stored utterances and write hits.
    Detect {
        /// Window start, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        start: String,

        /// Window end, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        end: String,

        /// Concurrent scans (overrides CORE_DETECT_WORKERS).
        #[arg(long)]
        workers: Option<usize>,

        /// Rows per storage page (overrides CORE_DETECT_PAGE_SIZE).
        #[arg(long)]
        page: Option<u32>,

        /// Detector version to stamp (overrides CORE_DETECT_VERSION).
        #[arg(long)]
        ver: Option<i32>,

        /// Scan without writing.
        #[arg(long)]
        dry_run: bool,

        /// Rule pack JSON path (defaults to the bundled pack).
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Archive finished hours and apply retention.
    Nightshift {
        /// Workers (overrides CORE_NIGHTSHIFT_WORKERS).
        #[arg(long)]
        workers: Option<usize>,

        /// Process one specific hour instead of draining the queue.
        #[arg(long)]
        hour: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BackfillAction {
    /// Preseed and process a whole range.
    Run {
        /// Range start, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        start: String,

        /// Range end, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        end: String,

        /// Worker count (overrides CORE_BACKFILL_WORKERS).
        #[arg(long)]
        workers: Option<usize>,

        /// Rule pack JSON path for the inline detect path.
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Preseed only; hours become claimable for later runs.
    Plan {
        /// Range start, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        start: String,

        /// Range end, inclusive (`YYYY-MM-DDTHH`, UTC).
        #[arg(long)]
        end: String,
    },

    /// Process whatever is claimable, unbounded.
    Resume {
        /// Worker count (overrides CORE_BACKFILL_WORKERS).
        #[arg(long)]
        workers: Option<usize>,

        /// Rule pack JSON path for the inline detect path.
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn parse_hour(label: &str, value: &str) -> Result<HourRef> {
    HourRef::parse(value).with_context(|| format!("invalid --{label} value '{value}'"))
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Cancel the token on ctrl-c; in-flight hours finalize as `error`.
fn watch_for_shutdown(cancel: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(component = "cli", "shutdown requested, cancelling workers");
            cancel.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancelToken::new();
    watch_for_shutdown(cancel.clone());

    match cli.command {
        Commands::Backfill { action } => match action {
            BackfillAction::Run {
                start,
                end,
                workers,
                rules,
            } => {
                let start = parse_hour("start", &start)?;
                let end = parse_hour("end", &end)?;
                let service = wiring::backfill_service(workers, rules, cancel).await?;
                let outcome = service.run_range(start, end).await?;
                info!(
                    component = "cli",
                    hours_ok = outcome.hours_ok,
                    inserted = outcome.inserted,
                    deduped = outcome.deduped,
                    hits = outcome.hits,
                    "backfill run finished"
                );
            }
            BackfillAction::Plan { start, end } => {
                let start = parse_hour("start", &start)?;
                let end = parse_hour("end", &end)?;
                let service = wiring::backfill_service(None, None, cancel).await?;
                let seeded = service.plan_range(start, end).await?;
                info!(component = "cli", seeded, "backfill plan finished");
            }
            BackfillAction::Resume { workers, rules } => {
                let service = wiring::backfill_service(workers, rules, cancel).await?;
                let outcome = service.run_resume().await?;
                info!(
                    component = "cli",
                    hours_ok = outcome.hours_ok,
                    inserted = outcome.inserted,
                    "backfill resume finished"
                );
            }
        },

        Commands::Detect {
            start,
            end,
            workers,
            page,
            ver,
            dry_run,
            rules,
        } => {
            let start = parse_hour("start", &start)?;
            let end = parse_hour("end", &end)?;
            let service = wiring::detect_service(workers, page, ver, dry_run, rules).await?;
            let outcome = service.run_range(start, end).await?;
            info!(
                component = "cli",
                scanned = outcome.scanned,
                hits = outcome.hits,
                written = outcome.written,
                "detect finished"
            );
        }

        Commands::Nightshift { workers, hour } => {
            let service = wiring::nightshift_service(workers, cancel).await?;
            match hour {
                Some(raw) => {
                    let hour = parse_hour("hour", &raw)?;
                    let metrics = service.run_hour(hour, "cli").await?;
                    info!(
                        component = "cli",
                        hour = %hour,
                        archived = metrics.archived,
                        pruned_hits = metrics.pruned_hits,
                        "nightshift hour finished"
                    );
                }
                None => {
                    let outcome = service.run().await?;
                    info!(
                        component = "cli",
                        hours_ok = outcome.hours_ok,
                        archived = outcome.archived,
                        "nightshift finished"
                    );
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(EXIT_RUNTIME_ERROR);
    }
}
