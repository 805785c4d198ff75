// SPDX-License-Identifier: MIT OR Apache-2.0
//! The nightshift pass: archive, then prune.
//!
//! After backfill and detect finish an hour, nightshift materializes the
//! denormalized `commit_crimes` slice for `(hour, detector_version)`: a
//! synchronous slice delete followed by an insert of rows with deterministic
//! IDs, so re-runs rewrite the slice to identical contents. It then applies
//! the configured raw-data retention.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ports;
mod service;

pub use ports::{
    ArchiveSink, ConsentGate, FeatureSource, HitArchiveSource, NsCoordinator, UtteranceFeature,
};
pub use service::{NightshiftOutcome, NightshiftService};
pub use sj_retry::CancelToken;
