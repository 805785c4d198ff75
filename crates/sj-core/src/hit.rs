// SPDX-License-Identifier: MIT OR Apache-2.0
//! Detector hits: in-process detections and columnar write rows.

use crate::utterance::SourceKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sj_identity::Hid;
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which matcher produced a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorSource {
    /// Slot-expanded template regex.
    Template,
    /// Word-boundary lemma match.
    Lemma,
}

impl DetectorSource {
    /// Column value (`template`, `lemma`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::Lemma => "lemma",
        }
    }
}

impl fmt::Display for DetectorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context-zone adjustment applied to a hit's severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CtxAction {
    /// Severity unchanged.
    #[default]
    None,
    /// Severity raised by context.
    Upgraded,
    /// Severity lowered by context (quotes, code).
    Downgraded,
}

impl CtxAction {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Upgraded => "upgraded",
            Self::Downgraded => "downgraded",
        }
    }
}

/// What a rage hit is aimed at, when a slot alias sits nearby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// No target in range.
    #[default]
    None,
    /// A bot account (dependabot, renovate, …).
    Bot,
    /// A development tool.
    Tool,
    /// A programming language.
    Lang,
    /// A framework.
    Framework,
}

impl TargetType {
    /// Column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bot => "bot",
            Self::Tool => "tool",
            Self::Lang => "lang",
            Self::Framework => "framework",
        }
    }
}

// ---------------------------------------------------------------------------
// In-process detection
// ---------------------------------------------------------------------------

/// A byte-offset span into the normalized text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    /// Inclusive start offset.
    pub start: u32,
    /// Exclusive end offset.
    pub end: u32,
}

impl Span {
    /// Construct from usize offsets (detector-internal).
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
        }
    }
}

/// A detector finding before write-form flattening.
///
/// Identical findings merge on `(term, category, severity, source)` by
/// appending spans, so "shit shit shit" is one detection with three spans.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Matched term (lemma or matched template substring), lowercased.
    pub term: String,
    /// Rule category (e.g. `tooling_rage`).
    pub category: String,
    /// Numeric severity from the rulepack.
    pub severity: u8,
    /// Which matcher found it.
    pub source: DetectorSource,
    /// All spans where this finding occurred, sorted by start.
    pub spans: Vec<Span>,
    /// Context-zone names covering the first span.
    pub zones: Vec<String>,
    /// Applied severity adjustment.
    pub ctx_action: CtxAction,
    /// Target classification, when a slot alias is near.
    pub target_type: TargetType,
    /// Slot alias that provided the target.
    pub target_name: Option<String>,
    /// Span of the target alias.
    pub target_span: Option<Span>,
    /// Distance in bytes between the hit and its target.
    pub target_distance: Option<u32>,
}

// ---------------------------------------------------------------------------
// Write form
// ---------------------------------------------------------------------------

/// Input to the detect writer: one utterance's identity plus its normalized
/// text. Backfill builds these inline; the detect service pages them out of
/// the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteInput {
    /// Utterance identity.
    pub utterance_id: Uuid,
    /// Event creation time (hit rows are hour-partitioned by this).
    pub created_at: DateTime<Utc>,
    /// Coarse source.
    pub source: SourceKind,
    /// Repository HID.
    pub repo_hid: Hid,
    /// Actor HID.
    pub actor_hid: Hid,
    /// Detected language, if any.
    pub lang_code: Option<String>,
    /// Normalized text to scan.
    pub text_normalized: String,
}

/// One flattened hit row for the columnar store.
///
/// Unique on `(utterance_id, term, span_start, span_end, detector_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitRecord {
    /// Owning utterance.
    pub utterance_id: Uuid,
    /// Event creation time.
    pub created_at: DateTime<Utc>,
    /// Coarse source.
    pub source: SourceKind,
    /// Repository HID.
    pub repo_hid: Hid,
    /// Actor HID.
    pub actor_hid: Hid,
    /// Detected language, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang_code: Option<String>,
    /// Matched term.
    pub term: String,
    /// Persisted category (whitelisted; unknown folds to `generic`).
    pub category: String,
    /// Numeric severity after context adjustment.
    pub severity: u8,
    /// Persisted severity label (`mild` / `strong`).
    pub severity_label: String,
    /// Inclusive start offset in `text_normalized`.
    pub span_start: u32,
    /// Exclusive end offset in `text_normalized`.
    pub span_end: u32,
    /// Detector generation that produced this row.
    pub detector_version: i32,
    /// Which matcher found it.
    pub detector_source: DetectorSource,
    /// Up to 32 chars of text before the span.
    pub pre_context: String,
    /// Up to 32 chars of text after the span.
    pub post_context: String,
    /// Context-zone names covering the span.
    pub zones: Vec<String>,
    /// Applied severity adjustment.
    pub ctx_action: CtxAction,
    /// Target classification.
    pub target_type: TargetType,
    /// Target alias slot entry ID, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Target alias text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    /// Target alias span start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_span_start: Option<u32>,
    /// Target alias span end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_span_end: Option<u32>,
    /// Byte distance between hit and target.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_distance: Option<u32>,
}

// ---------------------------------------------------------------------------
// Persisted-enum mapping
// ---------------------------------------------------------------------------

/// Map numeric severity to the persisted label: `<= 1` is `mild`, anything
/// stronger is `strong`.
pub fn severity_label(severity: u8) -> &'static str {
    if severity <= 1 {
        "mild"
    } else {
        "strong"
    }
}

/// Categories persisted verbatim; anything else folds to `generic`.
const CATEGORY_WHITELIST: &[&str] = &["bot_rage", "tooling_rage", "self_own", "generic"];

/// Map a rulepack category to its persisted value.
pub fn persisted_category(category: &str) -> &'static str {
    for known in CATEGORY_WHITELIST {
        if *known == category {
            return known;
        }
    }
    "generic"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_mapping_threshold() {
        assert_eq!(severity_label(0), "mild");
        assert_eq!(severity_label(1), "mild");
        assert_eq!(severity_label(2), "strong");
        assert_eq!(severity_label(5), "strong");
    }

    #[test]
    fn category_whitelist_passthrough() {
        assert_eq!(persisted_category("bot_rage"), "bot_rage");
        assert_eq!(persisted_category("tooling_rage"), "tooling_rage");
        assert_eq!(persisted_category("self_own"), "self_own");
        assert_eq!(persisted_category("generic"), "generic");
    }

    #[test]
    fn unknown_category_folds_to_generic() {
        assert_eq!(persisted_category("lang_rage"), "generic");
        assert_eq!(persisted_category(""), "generic");
        assert_eq!(persisted_category("new_fancy_category"), "generic");
    }

    #[test]
    fn span_orders_by_start_then_end() {
        let a = Span::new(1, 4);
        let b = Span::new(1, 6);
        let c = Span::new(2, 3);
        assert!(a < b && b < c);
    }

    #[test]
    fn enum_column_values() {
        assert_eq!(DetectorSource::Template.as_str(), "template");
        assert_eq!(DetectorSource::Lemma.as_str(), "lemma");
        assert_eq!(CtxAction::Downgraded.as_str(), "downgraded");
        assert_eq!(TargetType::Bot.as_str(), "bot");
        assert_eq!(TargetType::Framework.as_str(), "framework");
    }

    #[test]
    fn hit_record_serializes_flat_json() {
        let rec = HitRecord {
            utterance_id: Uuid::nil(),
            created_at: chrono::Utc::now(),
            source: SourceKind::Comment,
            repo_hid: sj_identity::repo_hid32(1),
            actor_hid: sj_identity::actor_hid32(1),
            lang_code: None,
            term: "fuck".into(),
            category: "generic".into(),
            severity: 2,
            severity_label: severity_label(2).into(),
            span_start: 0,
            span_end: 4,
            detector_version: 3,
            detector_source: DetectorSource::Lemma,
            pre_context: String::new(),
            post_context: " you".into(),
            zones: vec![],
            ctx_action: CtxAction::None,
            target_type: TargetType::None,
            target_id: None,
            target_name: None,
            target_span_start: None,
            target_span_end: None,
            target_distance: None,
        };
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["detector_source"], "lemma");
        assert_eq!(json["severity_label"], "strong");
        assert!(json.get("lang_code").is_none(), "None fields are omitted");
        assert_eq!(json["repo_hid"].as_str().unwrap().len(), 64);
    }
}
