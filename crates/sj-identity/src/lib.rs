// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic hashed principal identifiers.
//!
//! A **HID** is a 32-byte, domain-separated SHA-256 digest that identifies a
//! repository or actor without exposing its numeric GitHub ID. HIDs are pure
//! functions of `(kind_tag, numeric_id)` and therefore stable across
//! processes, hosts, and releases.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Domain-separation prefix mixed into every HID digest.
const HID_DOMAIN: &[u8] = b"swearjar:hid:v1";

/// Kind tag for repository principals.
const KIND_REPO: &str = "repo";
/// Kind tag for actor principals.
const KIND_ACTOR: &str = "actor";

// ---------------------------------------------------------------------------
// Hid
// ---------------------------------------------------------------------------

/// A 32-byte hashed principal identifier.
///
/// Serialises as a 64-character lowercase hex string so the same value reads
/// identically in Postgres, ClickHouse, and logs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hid([u8; 32]);

impl Hid {
    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw 32 digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering (64 chars).
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            use fmt::Write as _;
            let _ = write!(out, "{b:02x}");
        }
        out
    }

    /// Parse a 64-character hex string back into a HID.
    pub fn from_hex(s: &str) -> Result<Self, HidParseError> {
        if s.len() != 64 {
            return Err(HidParseError::BadLength(s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_val(chunk[0]).ok_or(HidParseError::BadDigit)?;
            let lo = hex_val(chunk[1]).ok_or(HidParseError::BadDigit)?;
            bytes[i] = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Errors parsing a hex-encoded HID.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HidParseError {
    /// Input was not exactly 64 hex characters.
    #[error("hid hex must be 64 chars, got {0}")]
    BadLength(usize),
    /// Input contained a non-hex character.
    #[error("hid hex contains a non-hex digit")]
    BadDigit,
}

impl fmt::Debug for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hid({})", self.to_hex())
    }
}

impl fmt::Display for Hid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Hid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hid::from_hex(&s).map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

fn hid32(kind_tag: &str, id: i64) -> Hid {
    let mut hasher = Sha256::new();
    hasher.update(HID_DOMAIN);
    hasher.update([0u8]);
    hasher.update(kind_tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(id.to_string().as_bytes());
    Hid(hasher.finalize().into())
}

/// HID for a repository's numeric ID.
pub fn repo_hid32(id: i64) -> Hid {
    hid32(KIND_REPO, id)
}

/// HID for an actor's numeric ID.
pub fn actor_hid32(id: i64) -> Hid {
    hid32(KIND_ACTOR, id)
}

/// Deterministic positive numeric ID for principals whose feed row carried a
/// zero ID. Derived from the natural key so retries converge on one value.
pub fn synthetic_numeric_id(kind_tag: &str, natural: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(b"swearjar:synth:v1");
    hasher.update([0u8]);
    hasher.update(kind_tag.as_bytes());
    hasher.update([0u8]);
    hasher.update(natural.as_bytes());
    let digest = hasher.finalize();
    let mut eight = [0u8; 8];
    eight.copy_from_slice(&digest[..8]);
    // Clear the sign bit: synthetic IDs stay in the positive i64 range.
    (i64::from_be_bytes(eight) & i64::MAX).max(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Determinism ----------------------------------------------------

    #[test]
    fn repo_hid_is_pure() {
        assert_eq!(repo_hid32(42), repo_hid32(42));
        assert_eq!(repo_hid32(42).to_hex(), repo_hid32(42).to_hex());
    }

    #[test]
    fn actor_hid_is_pure() {
        assert_eq!(actor_hid32(7), actor_hid32(7));
    }

    #[test]
    fn digest_is_32_bytes() {
        assert_eq!(repo_hid32(1).as_bytes().len(), 32);
        assert_eq!(repo_hid32(1).to_hex().len(), 64);
    }

    // -- Domain separation ----------------------------------------------

    #[test]
    fn repo_and_actor_domains_differ() {
        assert_ne!(repo_hid32(42), actor_hid32(42));
    }

    #[test]
    fn distinct_ids_distinct_hids() {
        assert_ne!(repo_hid32(1), repo_hid32(2));
        assert_ne!(actor_hid32(0), actor_hid32(i64::MAX));
    }

    // -- Hex round trip -------------------------------------------------

    #[test]
    fn hex_round_trip() {
        let hid = repo_hid32(123_456_789);
        let back = Hid::from_hex(&hid.to_hex()).unwrap();
        assert_eq!(hid, back);
    }

    #[test]
    fn from_hex_rejects_bad_length() {
        assert_eq!(Hid::from_hex("abc"), Err(HidParseError::BadLength(3)));
    }

    #[test]
    fn from_hex_rejects_bad_digit() {
        let s = "zz".repeat(32);
        assert_eq!(Hid::from_hex(&s), Err(HidParseError::BadDigit));
    }

    #[test]
    fn from_hex_accepts_uppercase() {
        let hid = actor_hid32(99);
        let upper = hid.to_hex().to_uppercase();
        assert_eq!(Hid::from_hex(&upper).unwrap(), hid);
    }

    // -- Serde ----------------------------------------------------------

    #[test]
    fn serde_round_trip_as_hex_string() {
        let hid = repo_hid32(5);
        let json = serde_json::to_string(&hid).unwrap();
        assert_eq!(json, format!("\"{}\"", hid.to_hex()));
        let back: Hid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hid);
    }

    // -- Synthetic IDs --------------------------------------------------

    #[test]
    fn synthetic_id_is_deterministic_and_positive() {
        let a = synthetic_numeric_id("actor", "octocat");
        let b = synthetic_numeric_id("actor", "octocat");
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn synthetic_id_varies_by_kind_and_natural() {
        assert_ne!(
            synthetic_numeric_id("actor", "octocat"),
            synthetic_numeric_id("repo", "octocat")
        );
        assert_ne!(
            synthetic_numeric_id("repo", "a/b"),
            synthetic_numeric_id("repo", "a/c")
        );
    }
}
