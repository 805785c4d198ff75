// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ingest adapters: archive fetching, event reading, utterance extraction.
//!
//! The fetcher retrieves an hour's gzip JSONL archive through a local
//! content-addressed cache; the reader decodes envelopes line by line and
//! repairs missing IDs; the extractor projects each event into its
//! text-bearing utterances, normalized inline.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod extract;
pub mod fetch;
pub mod reader;

pub use extract::extract_utterances;
pub use fetch::{CacheFile, Fetcher};
pub use reader::{read_events, ReadPolicy, ReadStats};
