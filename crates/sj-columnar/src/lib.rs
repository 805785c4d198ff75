// SPDX-License-Identifier: MIT OR Apache-2.0
//! Columnar store access over the ClickHouse HTTP interface.
//!
//! Hits and the `commit_crimes` archive live in ClickHouse. Inserts go in as
//! `JSONEachRow` bodies; hour-slice deletes are synchronous mutations
//! (`ALTER … DELETE … SETTINGS mutations_sync = 2`) so a nightshift rewrite
//! never races its own insert. No dedicated ClickHouse driver is used; the
//! HTTP interface plus the existing reqwest stack covers everything the
//! pipeline needs.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod archive;
mod client;
mod hits;

pub use archive::{archive_hit_id, ArchiveRow, ArchiveStore};
pub use client::ClickhouseClient;
pub use hits::HitStore;
