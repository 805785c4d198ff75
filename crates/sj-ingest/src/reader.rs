// SPDX-License-Identifier: MIT OR Apache-2.0
//! Streaming reader for gzip JSONL event archives.
//!
//! Feeds each decoded [`EventEnvelope`] to a caller-supplied closure so the
//! whole hour never has to be resident. Decode errors are counted; policy
//! decides whether they abort the stream.

use flate2::read::MultiGzDecoder;
use sj_core::EventEnvelope;
use sj_error::{CoreError, CoreResult, ErrorCode};
use std::io::{BufRead, BufReader, Read};

/// How the reader treats malformed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPolicy {
    /// A malformed first record aborts the stream (corrupt archive).
    pub strict: bool,
    /// Any malformed record aborts the stream.
    pub fail_on_first_error: bool,
}

impl Default for ReadPolicy {
    fn default() -> Self {
        Self {
            strict: true,
            fail_on_first_error: false,
        }
    }
}

/// Counters reported after a read pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Envelopes decoded and delivered.
    pub events: u64,
    /// Uncompressed bytes consumed (including line terminators).
    pub bytes_uncompressed: u64,
    /// Lines that failed to decode and were skipped.
    pub decode_errors: u64,
}

/// Decode a gzip JSONL stream, repairing missing IDs, and feed each envelope
/// to `on_event`. Returns the stats; the closure may abort the stream by
/// returning an error.
pub fn read_events<R, F>(input: R, policy: ReadPolicy, mut on_event: F) -> CoreResult<ReadStats>
where
    R: Read,
    F: FnMut(EventEnvelope) -> CoreResult<()>,
{
    let reader = BufReader::new(MultiGzDecoder::new(input));
    let mut stats = ReadStats::default();
    let mut first_record = true;

    for line in reader.split(b'\n') {
        let raw = line.map_err(|e| {
            CoreError::new(ErrorCode::StreamCorrupt, "archive stream read failed").with_source(e)
        })?;
        stats.bytes_uncompressed += raw.len() as u64 + 1;
        if raw.is_empty() {
            continue;
        }

        // Historical archives occasionally carry invalid UTF-8; repair
        // rather than reject, since the normalizer strips the replacement
        // characters' neighbours anyway.
        let text = String::from_utf8_lossy(&raw);

        match serde_json::from_str::<EventEnvelope>(&text) {
            Ok(mut envelope) => {
                envelope.fill_synthetic_ids();
                stats.events += 1;
                first_record = false;
                on_event(envelope)?;
            }
            Err(err) => {
                if first_record && policy.strict {
                    return Err(CoreError::new(
                        ErrorCode::StreamCorrupt,
                        "first record is not a valid event envelope",
                    )
                    .with_source(err));
                }
                stats.decode_errors += 1;
                first_record = false;
                if policy.fail_on_first_error {
                    return Err(CoreError::new(ErrorCode::InvalidItem, "malformed event record")
                        .with_context("decode_errors", stats.decode_errors)
                        .with_source(err));
                }
            }
        }
    }

    Ok(stats)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
