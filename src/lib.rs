// SPDX-License-Identifier: MIT OR Apache-2.0
//! Swearjar — profanity analytics over the public GitHub event firehose.
//!
//! This facade re-exports the pipeline crates under stable names; the
//! individual `sj-*` crates remain the real API surface. See each crate's
//! docs for the component contracts:
//!
//! - [`ingest`]: archive fetching, event reading, utterance extraction
//! - [`normalize`]: the deterministic text pipeline and script detection
//! - [`rulepack`] / [`detect`]: rule compilation and span-anchored scanning
//! - [`store`] / [`columnar`]: relational coordination and columnar facts
//! - [`backfill`] / [`nightshift`]: the hour-leased services

pub use sj_backfill as backfill;
pub use sj_columnar as columnar;
pub use sj_config as config;
pub use sj_core as model;
pub use sj_detect as detect;
pub use sj_error as error;
pub use sj_identity as identity;
pub use sj_ingest as ingest;
pub use sj_nightshift as nightshift;
pub use sj_normalize as normalize;
pub use sj_retry as retry;
pub use sj_rulepack as rulepack;
pub use sj_store as store;
