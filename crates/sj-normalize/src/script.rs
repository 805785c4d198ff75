// SPDX-License-Identifier: MIT OR Apache-2.0
//! Unicode script counting and unambiguous-script language detection.
//!
//! Detection is deliberately coarse: count letters per script and, when the
//! text is long enough to be meaningful, report the dominant script. Only
//! scripts that imply a single language map to a `lang_code`; Han, Cyrillic,
//! Devanagari, and Latin stay language-less.

use std::fmt;

/// Minimum number of letters before detection reports anything.
const MIN_LETTERS: usize = 20;

/// Scripts the counter distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Script {
    Latin,
    Han,
    Hiragana,
    Katakana,
    Hangul,
    Arabic,
    Hebrew,
    Thai,
    Greek,
    Cyrillic,
    Devanagari,
}

impl Script {
    fn name(self) -> &'static str {
        match self {
            Self::Latin => "Latin",
            Self::Han => "Han",
            Self::Hiragana => "Hiragana",
            Self::Katakana => "Katakana",
            Self::Hangul => "Hangul",
            Self::Arabic => "Arabic",
            Self::Hebrew => "Hebrew",
            Self::Thai => "Thai",
            Self::Greek => "Greek",
            Self::Cyrillic => "Cyrillic",
            Self::Devanagari => "Devanagari",
        }
    }

    /// Language implied by the script, for scripts that imply exactly one.
    fn unambiguous_lang(self) -> Option<&'static str> {
        match self {
            Self::Hiragana | Self::Katakana => Some("ja"),
            Self::Hangul => Some("ko"),
            Self::Arabic => Some("ar"),
            Self::Hebrew => Some("he"),
            Self::Thai => Some("th"),
            Self::Greek => Some("el"),
            Self::Latin | Self::Han | Self::Cyrillic | Self::Devanagari => None,
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn script_of(c: char) -> Option<Script> {
    let cp = c as u32;
    let s = match cp {
        0x0041..=0x005A | 0x0061..=0x007A => Script::Latin,
        0x00C0..=0x024F => Script::Latin, // Latin-1 supplement + Extended-A/B
        0x0370..=0x03FF | 0x1F00..=0x1FFF => Script::Greek,
        0x0400..=0x04FF | 0x0500..=0x052F => Script::Cyrillic,
        0x0590..=0x05FF => Script::Hebrew,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF => Script::Arabic,
        0x0900..=0x097F => Script::Devanagari,
        0x0E00..=0x0E7F => Script::Thai,
        0x3040..=0x309F => Script::Hiragana,
        0x30A0..=0x30FF | 0x31F0..=0x31FF => Script::Katakana,
        0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xF900..=0xFAFF => Script::Han,
        0x1100..=0x11FF | 0xA960..=0xA97F | 0xAC00..=0xD7AF => Script::Hangul,
        _ => return None,
    };
    // Only letters count; digits and punctuation never vote.
    if c.is_alphabetic() {
        Some(s)
    } else {
        None
    }
}

/// Detection result: dominant script and, when unambiguous, a language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptLang {
    /// Dominant Unicode script name, when enough letters were seen.
    pub script: Option<String>,
    /// ISO-639-1 code, only for scripts that imply one language.
    pub lang_code: Option<String>,
}

/// Count letters per script over normalized text and report the dominant one.
///
/// Returns an empty result when fewer than 20 letters are present.
pub fn detect_script_lang(text: &str) -> ScriptLang {
    const N: usize = 11;
    let all = [
        Script::Latin,
        Script::Han,
        Script::Hiragana,
        Script::Katakana,
        Script::Hangul,
        Script::Arabic,
        Script::Hebrew,
        Script::Thai,
        Script::Greek,
        Script::Cyrillic,
        Script::Devanagari,
    ];
    let mut counts = [0usize; N];
    let mut total = 0usize;

    for c in text.chars() {
        if let Some(s) = script_of(c) {
            let idx = all.iter().position(|x| *x == s).unwrap_or(0);
            counts[idx] += 1;
            total += 1;
        }
    }

    if total < MIN_LETTERS {
        return ScriptLang::default();
    }

    let mut best = 0usize;
    for i in 1..N {
        if counts[i] > counts[best] {
            best = i;
        }
    }
    let dominant = all[best];

    ScriptLang {
        script: Some(dominant.name().to_string()),
        lang_code: dominant.unambiguous_lang().map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
