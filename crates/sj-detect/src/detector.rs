// SPDX-License-Identifier: MIT OR Apache-2.0
//! The two-pass scanner: templates first, lemmas second.

use crate::zones::{extract_zones, Zone};
use sj_core::{
    persisted_category, severity_label, CtxAction, Detection, DetectorSource, HitRecord, Span,
    TargetType, WriteInput,
};
use sj_rulepack::CompiledPack;
use std::collections::HashMap;
use std::sync::Arc;
use unicode_normalization::char::is_combining_mark;

/// How far (in bytes) a slot alias may sit from a hit and still be its target.
const TARGET_WINDOW: u32 = 48;

/// Context window captured around each hit span, in characters.
const CONTEXT_CHARS: usize = 32;

// ---------------------------------------------------------------------------
// Word boundaries
// ---------------------------------------------------------------------------

/// A word character for boundary purposes: Letter, Number, combining mark,
/// or connector punctuation.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric()
        || is_combining_mark(c)
        || matches!(
            c,
            '_' | '\u{203F}' | '\u{2040}' | '\u{2054}' | '\u{FE33}' | '\u{FE34}' | '\u{FF3F}'
        )
}

fn boundary_ok(text: &str, start: usize, end: usize) -> bool {
    let before_ok = text[..start].chars().next_back().map_or(true, |c| !is_word_char(c));
    let after_ok = text[end..].chars().next().map_or(true, |c| !is_word_char(c));
    before_ok && after_ok
}

/// Expand `[start, end)` outward over word characters to the containing token.
fn containing_token(text: &str, start: usize, end: usize) -> &str {
    let mut a = start;
    for c in text[..start].chars().rev() {
        if is_word_char(c) {
            a -= c.len_utf8();
        } else {
            break;
        }
    }
    let mut b = end;
    for c in text[end..].chars() {
        if is_word_char(c) {
            b += c.len_utf8();
        } else {
            break;
        }
    }
    &text[a..b]
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Immutable scanner over one compiled rule pack generation.
///
/// Cheap to clone; freely shared across workers.
#[derive(Clone)]
pub struct Detector {
    pack: Arc<CompiledPack>,
    version: i32,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("version", &self.version)
            .field("pack", &self.pack)
            .finish()
    }
}

impl Detector {
    /// Build a detector over a compiled pack at the given generation.
    pub fn new(pack: Arc<CompiledPack>, version: i32) -> Self {
        Self { pack, version }
    }

    /// The detector generation stamped on every hit.
    pub fn version(&self) -> i32 {
        self.version
    }

    /// Scan normalized text and return merged detections.
    ///
    /// Detections are sorted by `(first span start, term)`; spans within a
    /// detection are sorted and deduplicated.
    pub fn scan(&self, text: &str) -> Vec<Detection> {
        if text.is_empty() {
            return Vec::new();
        }
        let zones = extract_zones(text);
        let mut merged: HashMap<(String, String, u8, DetectorSource), Vec<Span>> = HashMap::new();

        // Pass 1: templates over the whole text.
        for tpl in &self.pack.templates {
            for m in tpl.regex.find_iter(text) {
                merged
                    .entry((
                        m.as_str().to_string(),
                        tpl.category.clone(),
                        tpl.severity,
                        DetectorSource::Template,
                    ))
                    .or_default()
                    .push(Span::new(m.start(), m.end()));
            }
        }

        // Pass 2: lemmas, boundary-checked and stoplist-suppressed.
        for m in self.pack.lemma_ac.find_overlapping_iter(text) {
            if !boundary_ok(text, m.start(), m.end()) {
                continue;
            }
            let token = containing_token(text, m.start(), m.end());
            if self.pack.stopset.contains(token) {
                continue;
            }
            let meta = &self.pack.lemma_meta[m.pattern().as_usize()];
            merged
                .entry((
                    meta.term.clone(),
                    meta.category.clone(),
                    meta.severity,
                    DetectorSource::Lemma,
                ))
                .or_default()
                .push(Span::new(m.start(), m.end()));
        }

        let mut detections: Vec<Detection> = merged
            .into_iter()
            .map(|((term, category, severity, source), mut spans)| {
                spans.sort();
                spans.dedup();
                let mut det = Detection {
                    term,
                    category,
                    severity,
                    source,
                    spans,
                    zones: Vec::new(),
                    ctx_action: CtxAction::None,
                    target_type: TargetType::None,
                    target_name: None,
                    target_span: None,
                    target_distance: None,
                };
                self.apply_zones(&zones, &mut det);
                det
            })
            .collect();

        self.apply_targets(text, &mut detections);
        detections.sort_by(|a, b| {
            let ka = (a.spans.first().copied().unwrap_or(Span::new(0, 0)), a.term.clone());
            let kb = (b.spans.first().copied().unwrap_or(Span::new(0, 0)), b.term.clone());
            ka.cmp(&kb)
        });
        detections
    }

    /// Record zones covering the first span and downgrade severity inside
    /// code or quoted context (floor 1).
    fn apply_zones(&self, zones: &[Zone], det: &mut Detection) {
        let Some(first) = det.spans.first().copied() else {
            return;
        };
        for zone in zones {
            if zone.covers(first.start as usize, first.end as usize) {
                det.zones.push(zone.kind.as_str().to_string());
            }
        }
        if !det.zones.is_empty() {
            let downgraded = det.severity.saturating_sub(1).max(1);
            if downgraded < det.severity {
                det.severity = downgraded;
                det.ctx_action = CtxAction::Downgraded;
            }
        }
    }

    /// Tag each detection with the nearest in-window slot alias, if any.
    fn apply_targets(&self, text: &str, detections: &mut [Detection]) {
        if detections.is_empty() || self.pack.slot_aliases.is_empty() {
            return;
        }

        // Alias occurrences, boundary-checked like lemmas.
        let mut aliases: Vec<(usize, Span)> = Vec::new();
        for m in self.pack.slot_ac.find_overlapping_iter(text) {
            if boundary_ok(text, m.start(), m.end()) {
                aliases.push((m.pattern().as_usize(), Span::new(m.start(), m.end())));
            }
        }
        if aliases.is_empty() {
            return;
        }

        for det in detections.iter_mut() {
            let Some(first) = det.spans.first().copied() else {
                continue;
            };
            let mut best: Option<(u32, usize, Span)> = None;
            for (pattern, span) in &aliases {
                let distance = if span.end <= first.start {
                    first.start - span.end
                } else if span.start >= first.end {
                    span.start - first.end
                } else {
                    0
                };
                if distance > TARGET_WINDOW {
                    continue;
                }
                if best.map_or(true, |(d, _, _)| distance < d) {
                    best = Some((distance, *pattern, *span));
                }
            }
            if let Some((distance, pattern, span)) = best {
                let alias = &self.pack.slot_aliases[pattern];
                det.target_type = match CompiledPack::slot_target_kind(&alias.slot) {
                    Some("bot") => TargetType::Bot,
                    Some("tool") => TargetType::Tool,
                    Some("lang") => TargetType::Lang,
                    Some("framework") => TargetType::Framework,
                    _ => TargetType::None,
                };
                if det.target_type != TargetType::None {
                    det.target_name = Some(alias.alias.clone());
                    det.target_span = Some(span);
                    det.target_distance = Some(distance);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Write-form composition
// ---------------------------------------------------------------------------

fn source_priority(source: DetectorSource) -> u32 {
    match source {
        DetectorSource::Template => 2,
        DetectorSource::Lemma => 1,
    }
}

fn category_priority(category: &str) -> u32 {
    match category {
        "bot_rage" => 500,
        "tooling_rage" => 400,
        "lang_rage" => 300,
        "self_own" => 200,
        _ => 100,
    }
}

fn score(det: &Detection) -> u32 {
    source_priority(det.source) * 10_000 + category_priority(&det.category) * 100 + u32::from(det.severity)
}

fn context_before(text: &str, start: usize) -> String {
    let head = &text[..start];
    let skip = head.chars().count().saturating_sub(CONTEXT_CHARS);
    head.chars().skip(skip).collect()
}

fn context_after(text: &str, end: usize) -> String {
    text[end..].chars().take(CONTEXT_CHARS).collect()
}

/// Flatten detections for one utterance into best-hit rows.
///
/// For each `(span, term)` the winning detection is chosen by
/// `source_priority * 10000 + category_priority * 100 + severity`; rows come
/// out sorted by `(span_start, term)`.
pub fn compose_records(detector: &Detector, input: &WriteInput) -> Vec<HitRecord> {
    let detections = detector.scan(&input.text_normalized);
    if detections.is_empty() {
        return Vec::new();
    }

    // Best detection per (span, term).
    let mut best: HashMap<(u32, u32, String), &Detection> = HashMap::new();
    for det in &detections {
        for span in &det.spans {
            let key = (span.start, span.end, det.term.clone());
            match best.get(&key) {
                Some(current) if score(current) >= score(det) => {}
                _ => {
                    best.insert(key, det);
                }
            }
        }
    }

    let mut rows: Vec<HitRecord> = best
        .into_iter()
        .map(|((start, end, term), det)| HitRecord {
            utterance_id: input.utterance_id,
            created_at: input.created_at,
            source: input.source,
            repo_hid: input.repo_hid,
            actor_hid: input.actor_hid,
            lang_code: input.lang_code.clone(),
            term,
            category: persisted_category(&det.category).to_string(),
            severity: det.severity,
            severity_label: severity_label(det.severity).to_string(),
            span_start: start,
            span_end: end,
            detector_version: detector.version(),
            detector_source: det.source,
            pre_context: context_before(&input.text_normalized, start as usize),
            post_context: context_after(&input.text_normalized, end as usize),
            zones: det.zones.clone(),
            ctx_action: det.ctx_action,
            target_type: det.target_type,
            target_id: det
                .target_name
                .as_ref()
                .map(|name| format!("{}:{}", det.target_type.as_str(), name)),
            target_name: det.target_name.clone(),
            target_span_start: det.target_span.map(|s| s.start),
            target_span_end: det.target_span.map(|s| s.end),
            target_distance: det.target_distance,
        })
        .collect();

    rows.sort_by(|a, b| (a.span_start, &a.term).cmp(&(b.span_start, &b.term)));
    rows
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sj_normalize::normalize;
    use uuid::Uuid;

    fn detector() -> Detector {
        Detector::new(Arc::new(CompiledPack::bundled().unwrap()), 3)
    }

    fn scan(text: &str) -> Vec<Detection> {
        detector().scan(&normalize(text))
    }

    fn input(text: &str) -> WriteInput {
        WriteInput {
            utterance_id: Uuid::nil(),
            created_at: Utc::now(),
            source: sj_core::SourceKind::Comment,
            repo_hid: sj_identity::repo_hid32(1),
            actor_hid: sj_identity::actor_hid32(1),
            lang_code: None,
            text_normalized: normalize(text),
        }
    }

    // -- 1. Boundary stoplist ---------------------------------------------

    #[test]
    fn scunthorpe_problem_yields_nothing() {
        let hits = scan("The Scunthorpe problem is notorious.");
        assert!(hits.is_empty(), "got: {hits:?}");
    }

    // -- 2. Word boundary -------------------------------------------------

    #[test]
    fn assess_is_not_ass() {
        let hits = scan("We will assess the situation.");
        assert!(hits.is_empty(), "got: {hits:?}");
    }

    #[test]
    fn standalone_ass_matches() {
        let hits = scan("what an ass");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].term, "ass");
        assert_eq!(hits[0].source, DetectorSource::Lemma);
    }

    // -- 3. Template + lemma ----------------------------------------------

    #[test]
    fn bot_rage_template_and_lemma() {
        let hits = scan("fuck you dependabot - thanks for nothing");
        let template = hits
            .iter()
            .find(|h| h.source == DetectorSource::Template)
            .expect("template hit");
        assert!(template.term.contains("dependabot"));
        assert_eq!(template.category, "bot_rage");
        let lemma = hits
            .iter()
            .find(|h| h.source == DetectorSource::Lemma && h.term == "fuck")
            .expect("lemma hit");
        assert_eq!(lemma.spans.len(), 1);
    }

    // -- 4. Span merge ----------------------------------------------------

    #[test]
    fn repeated_term_merges_spans() {
        let hits = scan("shit shit and more shit");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].term, "shit");
        assert!(hits[0].spans.len() >= 3, "spans: {:?}", hits[0].spans);
        // Spans sorted, non-overlapping.
        for pair in hits[0].spans.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
    }

    #[test]
    fn detector_version_is_stamped() {
        let rows = compose_records(&detector(), &input("shit happens"));
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|r| r.detector_version == 3));
    }

    // -- Variants & normalization interplay -------------------------------

    #[test]
    fn variant_maps_to_canonical_term() {
        let hits = scan("this is fucking broken");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].term, "fuck");
    }

    #[test]
    fn leetspeak_is_caught_after_normalization() {
        let hits = scan("what the 5h1t");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].term, "shit");
    }

    // -- Zones ------------------------------------------------------------

    #[test]
    fn code_fence_downgrades_severity() {
        let hits = scan("```\nthis shit is an example\n```");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].zones, vec!["code_fence"]);
        assert_eq!(hits[0].ctx_action, CtxAction::Downgraded);
        assert_eq!(hits[0].severity, 1); // lemma severity 2, downgraded
    }

    #[test]
    fn quote_line_records_zone() {
        let hits = scan("> they said: total shit\nmy reply is measured");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].zones, vec!["quote"]);
    }

    #[test]
    fn severity_floor_is_one() {
        // "damn" is severity 1; a zone cannot push it to 0.
        let hits = scan("> damn");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, 1);
        assert_eq!(hits[0].ctx_action, CtxAction::None);
    }

    // -- Targets ----------------------------------------------------------

    #[test]
    fn nearby_bot_alias_tags_target() {
        let hits = scan("fuck you dependabot - thanks for nothing");
        let lemma = hits
            .iter()
            .find(|h| h.source == DetectorSource::Lemma)
            .expect("lemma hit");
        assert_eq!(lemma.target_type, TargetType::Bot);
        assert_eq!(lemma.target_name.as_deref(), Some("dependabot"));
        assert!(lemma.target_distance.unwrap() <= 48);
    }

    #[test]
    fn distant_alias_is_not_a_target() {
        let filler = "x".repeat(60);
        let hits = scan(&format!("shit. {filler} dependabot"));
        let lemma = hits.iter().find(|h| h.term == "shit").expect("lemma");
        assert_eq!(lemma.target_type, TargetType::None);
    }

    #[test]
    fn tool_alias_tags_tool_target() {
        let hits = scan("fucking webpack again");
        let template = hits
            .iter()
            .find(|h| h.source == DetectorSource::Template)
            .expect("template");
        assert_eq!(template.category, "tooling_rage");
        assert_eq!(template.target_type, TargetType::Tool);
        assert_eq!(template.target_name.as_deref(), Some("webpack"));
    }

    // -- Best-hit selection ------------------------------------------------

    #[test]
    fn template_beats_lemma_on_identical_span_and_term() {
        // "goddamn cargo" produces the tooling-rage template over the whole
        // phrase and the "damn" variant lemma inside it; distinct spans, both
        // survive. Identical (span, term) dedupe is exercised via scoring.
        let rows = compose_records(&detector(), &input("goddamn cargo build"));
        assert!(!rows.is_empty());
        let template_rows: Vec<_> = rows
            .iter()
            .filter(|r| r.detector_source == DetectorSource::Template)
            .collect();
        assert!(!template_rows.is_empty());
        assert!(template_rows.iter().all(|r| r.category == "tooling_rage"));
    }

    #[test]
    fn rows_are_sorted_and_unique_per_span_term() {
        let rows = compose_records(&detector(), &input("shit shit and more shit"));
        assert_eq!(rows.len(), 3);
        let mut keys: Vec<_> = rows.iter().map(|r| (r.span_start, r.span_end, r.term.clone())).collect();
        let sorted = keys.clone();
        keys.dedup();
        assert_eq!(keys.len(), 3, "no duplicate (span, term) rows");
        assert_eq!(keys, sorted, "rows sorted by span");
    }

    #[test]
    fn contexts_surround_the_span() {
        let rows = compose_records(&detector(), &input("well shit happens"));
        let row = &rows[0];
        assert_eq!(row.pre_context, "well ");
        assert_eq!(row.post_context, " happens");
    }

    #[test]
    fn empty_text_is_a_no_op() {
        assert!(detector().scan("").is_empty());
    }

    // -- Persisted mapping -------------------------------------------------

    #[test]
    fn lang_rage_persists_as_generic() {
        let rows = compose_records(&detector(), &input("fucking javascript is at it again"));
        let template_row = rows
            .iter()
            .find(|r| r.detector_source == DetectorSource::Template)
            .expect("template row");
        assert_eq!(template_row.category, "generic");
        assert_eq!(template_row.target_type, TargetType::Lang);
    }

    #[test]
    fn severity_labels_follow_threshold() {
        let rows = compose_records(&detector(), &input("damn it, this is shit"));
        for row in rows {
            if row.severity <= 1 {
                assert_eq!(row.severity_label, "mild");
            } else {
                assert_eq!(row.severity_label, "strong");
            }
        }
    }
}
