// SPDX-License-Identifier: MIT OR Apache-2.0
//! Versioned rule pack loading and compilation.
//!
//! A rule pack is a JSON bundle of **templates** (regexes with `{SLOT}`
//! placeholders), **lemmas** (single-word patterns), **slots** (named alias
//! lists), and an **allowlist**. [`Rulepack::compile`] turns the bundle into
//! an immutable [`CompiledPack`]: templates become anchored [`regex::Regex`]
//! values after slot expansion, lemmas and slot aliases become Aho-Corasick
//! automatons, and the allowlist flattens into a stopset of tokens.
//!
//! Compiled packs are immutable and freely shared across workers; a version
//! change produces a whole new detector generation.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// The only schema version this loader accepts.
pub const SCHEMA_VERSION: u32 = 2;

/// Default pack bundled with the binary, used when no path is configured.
pub const DEFAULT_PACK_JSON: &str = include_str!("../fixtures/rules.json");

// ---------------------------------------------------------------------------
// Document model
// ---------------------------------------------------------------------------

/// A single-word pattern with Unicode word-boundary semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lemma {
    /// Canonical matched term (persisted on hits).
    pub term: String,
    /// Rule category.
    pub category: String,
    /// Numeric severity.
    pub severity: u8,
    /// Additional surface forms that match as this lemma.
    #[serde(default)]
    pub variants: Vec<String>,
}

/// A regex template; `{NAME}` placeholders expand from the slot tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Stable template ID.
    pub id: String,
    /// Pattern source, pre-expansion.
    pub pattern: String,
    /// Rule category.
    pub category: String,
    /// Numeric severity.
    pub severity: u8,
    /// Free-form variant notes carried through from authoring.
    #[serde(default)]
    pub variants: Vec<String>,
    /// Optional context-signal names (advisory).
    #[serde(default)]
    pub context_signals: Vec<String>,
}

/// Tokens that suppress lemma matches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allowlist {
    /// Tokens suppressed everywhere.
    #[serde(default)]
    pub global: Vec<String>,
    /// Zone-specific tokens; flattened into the same stopset at compile time.
    #[serde(default)]
    pub by_zone: BTreeMap<String, Vec<String>>,
}

/// The on-disk rule pack document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rulepack {
    /// Schema version; must equal [`SCHEMA_VERSION`].
    pub version: u32,
    /// Known categories (advisory; unknown categories persist as `generic`).
    #[serde(default)]
    pub categories: Vec<String>,
    /// Slot name → alias list.
    #[serde(default)]
    pub slots: BTreeMap<String, Vec<String>>,
    /// Lemma table.
    #[serde(default)]
    pub lemmas: Vec<Lemma>,
    /// Template table.
    #[serde(default)]
    pub templates: Vec<Template>,
    /// Allowlist feeding the stopset.
    #[serde(default)]
    pub allowlist: Allowlist,
    /// Engine tuning hints; opaque to the loader.
    #[serde(default)]
    pub engine_hints: BTreeMap<String, serde_json::Value>,
}

/// Errors loading or compiling a rule pack.
#[derive(Debug, thiserror::Error)]
pub enum RulepackError {
    /// File could not be read.
    #[error("failed to read rulepack {path}: {source}")]
    Io {
        /// Path as given.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// JSON failed to parse.
    #[error("failed to parse rulepack: {0}")]
    Parse(#[from] serde_json::Error),

    /// Unsupported schema version.
    #[error("unsupported rulepack version {found} (expected {SCHEMA_VERSION})")]
    BadVersion {
        /// Version found in the document.
        found: u32,
    },

    /// A template failed to compile after slot expansion.
    #[error("template '{id}' failed to compile: {source}")]
    BadTemplate {
        /// Template ID.
        id: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },

    /// The automaton over lemmas/aliases failed to build.
    #[error("failed to build matcher: {0}")]
    Automaton(#[from] aho_corasick::BuildError),
}

impl Rulepack {
    /// Parse a rule pack from JSON, enforcing the schema version.
    pub fn from_json(json: &str) -> Result<Self, RulepackError> {
        let doc: Rulepack = serde_json::from_str(json)?;
        if doc.version != SCHEMA_VERSION {
            return Err(RulepackError::BadVersion { found: doc.version });
        }
        Ok(doc)
    }

    /// Read and parse a rule pack file.
    pub fn from_path(path: &Path) -> Result<Self, RulepackError> {
        let json = std::fs::read_to_string(path).map_err(|source| RulepackError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }
}

// ---------------------------------------------------------------------------
// Slot expansion
// ---------------------------------------------------------------------------

/// Expand `{NAME}` placeholders into non-capturing alternations of
/// regex-quoted, lowercased aliases. Unknown slot names stay literal so
/// authoring mistakes surface as compile or match failures instead of
/// silently matching nothing.
pub fn expand_slots(pattern: &str, slots: &BTreeMap<String, Vec<String>>) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        match tail.find('}') {
            Some(close) => {
                let name = &tail[1..close];
                match slots.get(name) {
                    Some(aliases) if !aliases.is_empty() => {
                        out.push_str(&alternation(aliases));
                    }
                    _ => out.push_str(&tail[..=close]),
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn alternation(aliases: &[String]) -> String {
    let mut seen = HashSet::new();
    let mut parts = Vec::new();
    for alias in aliases {
        let lowered = alias.trim().to_lowercase();
        if !lowered.is_empty() && seen.insert(lowered.clone()) {
            parts.push(regex::escape(&lowered));
        }
    }
    format!("(?:{})", parts.join("|"))
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// A compiled template ready to scan.
#[derive(Debug)]
pub struct CompiledTemplate {
    /// Stable template ID.
    pub id: String,
    /// Compiled regex (after slot expansion).
    pub regex: Regex,
    /// Rule category.
    pub category: String,
    /// Numeric severity.
    pub severity: u8,
}

/// One lemma pattern's metadata, indexed by automaton pattern ID.
#[derive(Debug, Clone)]
pub struct LemmaMeta {
    /// Canonical term persisted on hits.
    pub term: String,
    /// Rule category.
    pub category: String,
    /// Numeric severity.
    pub severity: u8,
}

/// One slot alias's metadata, indexed by automaton pattern ID.
#[derive(Debug, Clone)]
pub struct SlotAlias {
    /// Owning slot name (e.g. `TARGET_BOT`).
    pub slot: String,
    /// Alias text, lowercased.
    pub alias: String,
}

/// The immutable compiled pack shared by all detector workers.
pub struct CompiledPack {
    /// Compiled templates, in document order.
    pub templates: Vec<CompiledTemplate>,
    /// Lemma automaton; pattern `i` maps to `lemma_meta[i]`.
    pub lemma_ac: AhoCorasick,
    /// Metadata parallel to the lemma automaton's patterns.
    pub lemma_meta: Vec<LemmaMeta>,
    /// Slot-alias automaton; pattern `i` maps to `slot_aliases[i]`.
    pub slot_ac: AhoCorasick,
    /// Metadata parallel to the slot automaton's patterns.
    pub slot_aliases: Vec<SlotAlias>,
    /// Lowercased tokens that suppress lemma matches.
    pub stopset: HashSet<String>,
}

impl std::fmt::Debug for CompiledPack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPack")
            .field("templates", &self.templates.len())
            .field("lemmas", &self.lemma_meta.len())
            .field("slot_aliases", &self.slot_aliases.len())
            .field("stopset", &self.stopset.len())
            .finish()
    }
}

impl Rulepack {
    /// Compile the document into matchers. Inputs are lowercased at scan
    /// time, so every pattern is lowercased here.
    pub fn compile(&self) -> Result<CompiledPack, RulepackError> {
        // Templates: expand slots, then compile. Patterns are authored
        // lowercase; scan input is normalized (case-folded) text.
        let mut templates = Vec::with_capacity(self.templates.len());
        for tpl in &self.templates {
            let expanded = expand_slots(&tpl.pattern, &self.slots);
            let regex = Regex::new(&expanded).map_err(|source| RulepackError::BadTemplate {
                id: tpl.id.clone(),
                source,
            })?;
            templates.push(CompiledTemplate {
                id: tpl.id.clone(),
                regex,
                category: tpl.category.clone(),
                severity: tpl.severity,
            });
        }

        // Lemmas: canonical terms plus variants, deduped, one automaton.
        let mut lemma_patterns = Vec::new();
        let mut lemma_meta = Vec::new();
        let mut seen = HashSet::new();
        for lemma in &self.lemmas {
            let meta = LemmaMeta {
                term: lemma.term.trim().to_lowercase(),
                category: lemma.category.clone(),
                severity: lemma.severity,
            };
            for surface in std::iter::once(&lemma.term).chain(lemma.variants.iter()) {
                let lowered = surface.trim().to_lowercase();
                if !lowered.is_empty() && seen.insert(lowered.clone()) {
                    lemma_patterns.push(lowered);
                    lemma_meta.push(meta.clone());
                }
            }
        }
        let lemma_ac = AhoCorasick::builder()
            .match_kind(MatchKind::Standard)
            .build(&lemma_patterns)?;

        // Slot aliases: one automaton for target tagging.
        let mut alias_patterns = Vec::new();
        let mut slot_aliases = Vec::new();
        let mut seen_alias = HashSet::new();
        for (slot, aliases) in &self.slots {
            for alias in aliases {
                let lowered = alias.trim().to_lowercase();
                if !lowered.is_empty() && seen_alias.insert((slot.clone(), lowered.clone())) {
                    alias_patterns.push(lowered.clone());
                    slot_aliases.push(SlotAlias {
                        slot: slot.clone(),
                        alias: lowered,
                    });
                }
            }
        }
        let slot_ac = AhoCorasick::builder()
            .match_kind(MatchKind::Standard)
            .build(&alias_patterns)?;

        // Allowlist: global plus every zone, flattened.
        let mut stopset: HashSet<String> = HashSet::new();
        for token in &self.allowlist.global {
            let lowered = token.trim().to_lowercase();
            if !lowered.is_empty() {
                stopset.insert(lowered);
            }
        }
        for tokens in self.allowlist.by_zone.values() {
            for token in tokens {
                let lowered = token.trim().to_lowercase();
                if !lowered.is_empty() {
                    stopset.insert(lowered);
                }
            }
        }

        Ok(CompiledPack {
            templates,
            lemma_ac,
            lemma_meta,
            slot_ac,
            slot_aliases,
            stopset,
        })
    }
}

impl CompiledPack {
    /// Compile the bundled default pack.
    ///
    /// The fixture ships inside the crate, so failure here is a build defect;
    /// it still surfaces as an error rather than a panic.
    pub fn bundled() -> Result<Self, RulepackError> {
        Rulepack::from_json(DEFAULT_PACK_JSON)?.compile()
    }

    /// [`TargetType`]-style tag for a slot name; used by target tagging.
    pub fn slot_target_kind(slot: &str) -> Option<&'static str> {
        match slot {
            "TARGET_BOT" => Some("bot"),
            "TARGET_TOOL" => Some("tool"),
            "TARGET_LANG" => Some("lang"),
            "TARGET_FRAMEWORK" => Some("framework"),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn slots_of(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    // -- Slot expansion ---------------------------------------------------

    #[test]
    fn expands_known_slot() {
        let slots = slots_of(&[("TARGET_BOT", &["dependabot", "renovate"])]);
        let out = expand_slots("fuck you {TARGET_BOT}", &slots);
        assert_eq!(out, "fuck you (?:dependabot|renovate)");
    }

    #[test]
    fn unknown_slot_stays_literal() {
        let slots = slots_of(&[]);
        let out = expand_slots("hi {NO_SUCH_SLOT}", &slots);
        assert_eq!(out, "hi {NO_SUCH_SLOT}");
    }

    #[test]
    fn aliases_are_escaped_lowercased_and_deduped() {
        let slots = slots_of(&[("S", &["C++", "c++", "Not.A.Regex"])]);
        let out = expand_slots("{S}", &slots);
        assert_eq!(out, r"(?:c\+\+|not\.a\.regex)");
    }

    #[test]
    fn multiple_slots_in_one_pattern() {
        let slots = slots_of(&[("A", &["x"]), ("B", &["y"])]);
        assert_eq!(expand_slots("{A} then {B}", &slots), "(?:x) then (?:y)");
    }

    #[test]
    fn unclosed_brace_passes_through() {
        let slots = slots_of(&[("A", &["x"])]);
        assert_eq!(expand_slots("oops {A", &slots), "oops {A");
    }

    // -- Load & validate --------------------------------------------------

    #[test]
    fn rejects_wrong_version() {
        let err = Rulepack::from_json(r#"{"version": 1}"#).unwrap_err();
        assert!(matches!(err, RulepackError::BadVersion { found: 1 }));
    }

    #[test]
    fn minimal_pack_parses() {
        let pack = Rulepack::from_json(r#"{"version": 2}"#).unwrap();
        assert!(pack.lemmas.is_empty());
        assert!(pack.templates.is_empty());
        let compiled = pack.compile().unwrap();
        assert!(compiled.templates.is_empty());
    }

    #[test]
    fn bad_template_reports_its_id() {
        let json = r#"{
            "version": 2,
            "templates": [{"id": "broken", "pattern": "(unclosed", "category": "generic", "severity": 1}]
        }"#;
        let err = Rulepack::from_json(json).unwrap().compile().unwrap_err();
        assert!(matches!(err, RulepackError::BadTemplate { ref id, .. } if id == "broken"));
    }

    // -- Compilation ------------------------------------------------------

    #[test]
    fn lemma_variants_share_canonical_term() {
        let json = r#"{
            "version": 2,
            "lemmas": [{"term": "fuck", "category": "generic", "severity": 2, "variants": ["fucking", "fucked"]}]
        }"#;
        let compiled = Rulepack::from_json(json).unwrap().compile().unwrap();
        assert_eq!(compiled.lemma_meta.len(), 3);
        assert!(compiled.lemma_meta.iter().all(|m| m.term == "fuck"));
    }

    #[test]
    fn duplicate_lemma_surfaces_collapse() {
        let json = r#"{
            "version": 2,
            "lemmas": [
                {"term": "shit", "category": "generic", "severity": 2},
                {"term": "SHIT", "category": "generic", "severity": 2}
            ]
        }"#;
        let compiled = Rulepack::from_json(json).unwrap().compile().unwrap();
        assert_eq!(compiled.lemma_meta.len(), 1);
    }

    #[test]
    fn stopset_flattens_global_and_zones() {
        let json = r#"{
            "version": 2,
            "allowlist": {
                "global": ["Scunthorpe", "assess"],
                "by_zone": {"code": ["kill"], "quote": ["damnation"]}
            }
        }"#;
        let compiled = Rulepack::from_json(json).unwrap().compile().unwrap();
        assert!(compiled.stopset.contains("scunthorpe"));
        assert!(compiled.stopset.contains("assess"));
        assert!(compiled.stopset.contains("kill"));
        assert!(compiled.stopset.contains("damnation"));
        assert_eq!(compiled.stopset.len(), 4);
    }

    #[test]
    fn template_slots_expand_before_compile() {
        let json = r#"{
            "version": 2,
            "slots": {"TARGET_BOT": ["dependabot"]},
            "templates": [{"id": "t1", "pattern": "(?:fuck|screw) you,? {TARGET_BOT}", "category": "bot_rage", "severity": 3}]
        }"#;
        let compiled = Rulepack::from_json(json).unwrap().compile().unwrap();
        assert!(compiled.templates[0].regex.is_match("fuck you dependabot"));
        assert!(compiled.templates[0].regex.is_match("screw you, dependabot"));
        assert!(!compiled.templates[0].regex.is_match("fuck you somebody"));
    }

    // -- Bundled fixture --------------------------------------------------

    #[test]
    fn bundled_pack_compiles() {
        let compiled = CompiledPack::bundled().unwrap();
        assert!(!compiled.templates.is_empty());
        assert!(!compiled.lemma_meta.is_empty());
        assert!(compiled.stopset.contains("scunthorpe"));
    }

    #[test]
    fn slot_target_mapping() {
        assert_eq!(CompiledPack::slot_target_kind("TARGET_BOT"), Some("bot"));
        assert_eq!(CompiledPack::slot_target_kind("TARGET_LANG"), Some("lang"));
        assert_eq!(CompiledPack::slot_target_kind("OTHER"), None);
    }
}
