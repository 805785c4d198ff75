// SPDX-License-Identifier: MIT OR Apache-2.0
//! The backfill orchestrator.
//!
//! Workers loop on the coordinator's atomic claim, process each hour
//! (fetch → read/extract/normalize → insert → optional inline detect), and
//! always finalize the hour's row, whether it ends in success, error, panic,
//! or cancellation. Hour processing retries with jittered backoff on
//! retryable failures; inserts retry at batch granularity and bisect down
//! to single rows before giving up.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ports;
mod service;

pub use ports::{
    ArchiveRef, Coordinator, ExtractOutcome, HourSource, InsertStats, PrincipalEnsurer,
    UtteranceSink,
};
pub use service::{BackfillService, RangeOutcome};
pub use sj_retry::CancelToken;
