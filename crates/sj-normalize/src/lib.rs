// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic text normalization.
//!
//! Every utterance passes through the same ordered pipeline before detection:
//!
//! 1. sanitize (strip controls)
//! 2. Unicode NFKC
//! 3. case fold
//! 4. combining-mark and format-char strip
//! 5. width fold
//! 6. leet fold
//! 7. whitespace collapse
//!
//! The pipeline is a pure function: idempotent, allocation-light, and safe to
//! call from any number of workers concurrently. Laws
//! (`normalize(normalize(s)) == normalize(s)`, sanitize fixed point) are
//! enforced by property tests.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod script;

pub use script::{detect_script_lang, ScriptLang};

use std::borrow::Cow;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

// ---------------------------------------------------------------------------
// Sanitize
// ---------------------------------------------------------------------------

fn is_stripped_control(c: char) -> bool {
    match c {
        '\n' | '\r' | '\t' => false,
        '\u{0000}'..='\u{001F}' => true,
        '\u{007F}' => true,
        // C1 control block.
        '\u{0080}'..='\u{009F}' => true,
        _ => false,
    }
}

/// Drop NUL, ASCII controls (except `\n\r\t`), DEL, and C1 controls.
///
/// Returns the input unchanged (borrowed) when nothing needs stripping,
/// which is the overwhelmingly common case on firehose text.
pub fn sanitize(input: &str) -> Cow<'_, str> {
    if !input.chars().any(is_stripped_control) {
        return Cow::Borrowed(input);
    }
    Cow::Owned(input.chars().filter(|c| !is_stripped_control(*c)).collect())
}

// ---------------------------------------------------------------------------
// Fold stages
// ---------------------------------------------------------------------------

/// Format characters stripped alongside combining marks: zero-width joiners,
/// directional/invisible separators, soft hyphen, BOM.
fn is_stripped_format(c: char) -> bool {
    matches!(
        c,
        '\u{00AD}' | '\u{200B}'..='\u{200F}' | '\u{2060}' | '\u{FEFF}'
    )
}

fn width_fold(c: char) -> char {
    match c {
        // Fullwidth ASCII block → ASCII.
        '\u{FF01}'..='\u{FF5E}' => {
            let folded = (c as u32) - 0xFEE0;
            char::from_u32(folded).unwrap_or(c)
        }
        '\u{3000}' => ' ',
        _ => c,
    }
}

fn leet_fold(c: char) -> char {
    match c {
        '4' | '@' => 'a',
        '0' => 'o',
        '1' | '!' => 'i',
        '3' => 'e',
        '5' | '$' => 's',
        '7' => 't',
        _ => c,
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the full normalization pipeline.
pub fn normalize(input: &str) -> String {
    let sanitized = sanitize(input);

    // NFKC folds compatibility forms (fullwidth, ligatures, circled digits),
    // then per-char folds run over the decomposed-and-recomposed stream.
    // Mark stripping decomposes again so precomposed accents drop too.
    let folded: String = sanitized
        .nfkc()
        .flat_map(char::to_lowercase)
        .nfd()
        .filter(|c| !is_combining_mark(*c) && !is_stripped_format(*c))
        .map(width_fold)
        .map(leet_fold)
        .collect();

    collapse_whitespace(&folded)
}

/// Collapse whitespace runs: any run becomes a single space, runs containing
/// a line break become a single `\n`, and edges are trimmed.
fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut run_has_newline = false;
    let mut in_run = false;

    for c in input.chars() {
        if c.is_whitespace() {
            in_run = true;
            if c == '\n' || c == '\r' {
                run_has_newline = true;
            }
            continue;
        }
        if in_run {
            if !out.is_empty() {
                out.push(if run_has_newline { '\n' } else { ' ' });
            }
            in_run = false;
            run_has_newline = false;
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
