// SPDX-License-Identifier: MIT OR Apache-2.0
//! Span-anchored profanity detection.
//!
//! The [`Detector`] scans normalized text in two passes (slot-expanded
//! template regexes first, then word-boundary lemma matches) and merges
//! identical findings by appending spans. Context zones (code, quotes)
//! downgrade severity; slot aliases near a hit tag its target. The
//! [`service`] module pages utterances out of storage, runs the detector
//! under a bounded worker pool, and writes best-hit rows to the columnar
//! store.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod detector;
mod zones;
pub mod service;

pub use detector::{compose_records, Detector};
pub use service::{
    DetectOptions, DetectOutcome, DetectService, DetectWriter, HitSink, PageKey, UtterancePage,
};
pub use zones::{extract_zones, Zone, ZoneKind};
