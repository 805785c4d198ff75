// SPDX-License-Identifier: MIT OR Apache-2.0
//! Context zones over normalized text.
//!
//! Zones gate severity: profanity inside a code fence or a quoted line is
//! usually about code, not at anyone. Zone extraction runs on *normalized*
//! text, where whitespace runs have already collapsed and line breaks are
//! single `\n` characters.

use std::fmt;

/// Kind of context zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    /// Inside a fenced code block (``` … ```).
    CodeFence,
    /// Inside inline code (`` ` … ` ``).
    CodeInline,
    /// On a `>`-quoted line.
    Quote,
}

impl ZoneKind {
    /// Persisted zone name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeFence => "code_fence",
            Self::CodeInline => "code_inline",
            Self::Quote => "quote",
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A byte range of the text covered by a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Zone {
    /// Zone kind.
    pub kind: ZoneKind,
    /// Inclusive start byte.
    pub start: usize,
    /// Exclusive end byte.
    pub end: usize,
}

impl Zone {
    /// Whether the zone fully contains `[start, end)`.
    pub fn covers(&self, start: usize, end: usize) -> bool {
        self.start <= start && end <= self.end
    }
}

/// Extract code-fence, inline-code, and quote zones.
pub fn extract_zones(text: &str) -> Vec<Zone> {
    let mut zones = Vec::new();
    let mut fence_open: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split('\n') {
        let line_start = offset;
        let line_end = offset + line.len();
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") {
            match fence_open.take() {
                // Closing fence: the zone covers the fenced body and both
                // marker lines.
                Some(open_start) => zones.push(Zone {
                    kind: ZoneKind::CodeFence,
                    start: open_start,
                    end: line_end,
                }),
                None => fence_open = Some(line_start),
            }
        } else if fence_open.is_none() {
            if trimmed.starts_with('>') {
                zones.push(Zone {
                    kind: ZoneKind::Quote,
                    start: line_start,
                    end: line_end,
                });
            } else {
                inline_code_zones(line, line_start, &mut zones);
            }
        }

        offset = line_end + 1; // account for the '\n'
    }

    // An unclosed fence runs to the end of the text.
    if let Some(open_start) = fence_open {
        zones.push(Zone {
            kind: ZoneKind::CodeFence,
            start: open_start,
            end: text.len(),
        });
    }

    zones
}

/// Pair up backticks within one line; odd trailing backticks are ignored.
fn inline_code_zones(line: &str, line_start: usize, zones: &mut Vec<Zone>) {
    let mut open: Option<usize> = None;
    for (i, b) in line.bytes().enumerate() {
        if b != b'`' {
            continue;
        }
        match open.take() {
            Some(open_at) => zones.push(Zone {
                kind: ZoneKind::CodeInline,
                start: line_start + open_at,
                end: line_start + i + 1,
            }),
            None => open = Some(i),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_zones_in_plain_text() {
        assert!(extract_zones("just a plain sentence").is_empty());
    }

    #[test]
    fn fenced_block_is_one_zone() {
        let text = "before\n```\nrm -rf /\n```\nafter";
        let zones = extract_zones(text);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].kind, ZoneKind::CodeFence);
        let body_at = text.find("rm -rf").unwrap();
        assert!(zones[0].covers(body_at, body_at + 6));
    }

    #[test]
    fn unclosed_fence_runs_to_end() {
        let text = "a\n```\ndangling";
        let zones = extract_zones(text);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].end, text.len());
    }

    #[test]
    fn quoted_lines_are_zones() {
        let text = "mine\n> theirs is shit\nmine again";
        let zones = extract_zones(text);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].kind, ZoneKind::Quote);
        let quoted_at = text.find("> theirs").unwrap();
        assert!(zones[0].covers(quoted_at, quoted_at + 5));
    }

    #[test]
    fn inline_code_pairs_backticks() {
        let text = "use `git push --force` carefully";
        let zones = extract_zones(text);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].kind, ZoneKind::CodeInline);
        let tick_at = text.find('`').unwrap();
        assert_eq!(zones[0].start, tick_at);
    }

    #[test]
    fn odd_backtick_is_ignored() {
        assert!(extract_zones("one ` lonely backtick").is_empty());
    }

    #[test]
    fn quote_inside_fence_stays_fence() {
        let text = "```\n> not a quote\n```";
        let zones = extract_zones(text);
        assert_eq!(zones.len(), 1);
        assert_eq!(zones[0].kind, ZoneKind::CodeFence);
    }

    #[test]
    fn multiple_inline_zones_one_line() {
        let zones = extract_zones("`a` and `b`");
        assert_eq!(zones.len(), 2);
        assert!(zones.iter().all(|z| z.kind == ZoneKind::CodeInline));
    }
}
