// SPDX-License-Identifier: MIT OR Apache-2.0
//! Contract types for the Swearjar pipeline.
//!
//! Everything the pipeline crates exchange lives here: UTC hour references
//! and coordinator statuses, GitHub event envelopes, extracted utterances,
//! detector hits in both in-process and write form, and per-hour metrics.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod event;
pub mod hit;
pub mod hour;
pub mod metrics;
pub mod retention;
pub mod utterance;

pub use event::{EventActor, EventEnvelope, EventRepo};
pub use hit::{
    persisted_category, severity_label, CtxAction, Detection, DetectorSource, HitRecord, Span,
    TargetType, WriteInput,
};
pub use hour::{BfStatus, HourParseError, HourRef, NsStatus};
pub use metrics::{BackfillMetrics, NightshiftMetrics};
pub use retention::{RetentionMode, RetentionParseError};
pub use utterance::{utterance_uuid, SourceKind, Utterance};
