// SPDX-License-Identifier: MIT OR Apache-2.0
//! Raw-data retention policy applied by the nightshift pass.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What happens to raw utterances and hits once an hour is archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionMode {
    /// Keep everything.
    Full,
    /// Delete raw hits and utterances as soon as the hour is archived.
    Aggressive,
    /// Delete raw data once the hour is older than the given number of days.
    Timebox(
        /// Age threshold in days.
        u32,
    ),
}

impl RetentionMode {
    /// Whether raw data for `hour_end` (the hour's exclusive upper bound)
    /// should be deleted at `now`.
    pub fn should_prune(&self, hour_end: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Self::Full => false,
            Self::Aggressive => true,
            Self::Timebox(days) => hour_end < now - Duration::days(i64::from(*days)),
        }
    }
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Aggressive => f.write_str("aggressive"),
            Self::Timebox(days) => write!(f, "timebox:{days}d"),
        }
    }
}

/// Errors parsing a retention mode from configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid retention mode '{0}' (expected full, aggressive, or timebox:<N>d)")]
pub struct RetentionParseError(pub String);

impl FromStr for RetentionMode {
    type Err = RetentionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => return Ok(Self::Full),
            "aggressive" => return Ok(Self::Aggressive),
            _ => {}
        }
        if let Some(rest) = s.strip_prefix("timebox:") {
            if let Some(days) = rest.strip_suffix('d') {
                if let Ok(n) = days.parse::<u32>() {
                    if n > 0 {
                        return Ok(Self::Timebox(n));
                    }
                }
            }
        }
        Err(RetentionParseError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parse_all_modes() {
        assert_eq!("full".parse::<RetentionMode>().unwrap(), RetentionMode::Full);
        assert_eq!(
            "aggressive".parse::<RetentionMode>().unwrap(),
            RetentionMode::Aggressive
        );
        assert_eq!(
            "timebox:30d".parse::<RetentionMode>().unwrap(),
            RetentionMode::Timebox(30)
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("timebox:30".parse::<RetentionMode>().is_err());
        assert!("timebox:0d".parse::<RetentionMode>().is_err());
        assert!("timebox:-1d".parse::<RetentionMode>().is_err());
        assert!("keep".parse::<RetentionMode>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for mode in [
            RetentionMode::Full,
            RetentionMode::Aggressive,
            RetentionMode::Timebox(7),
        ] {
            assert_eq!(mode.to_string().parse::<RetentionMode>().unwrap(), mode);
        }
    }

    #[test]
    fn full_never_prunes() {
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        assert!(!RetentionMode::Full.should_prune(now - Duration::days(365), now));
    }

    #[test]
    fn aggressive_always_prunes() {
        let now = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        assert!(RetentionMode::Aggressive.should_prune(now, now));
    }

    #[test]
    fn timebox_prunes_only_past_threshold() {
        let now = Utc.with_ymd_and_hms(2025, 8, 31, 0, 0, 0).unwrap();
        let mode = RetentionMode::Timebox(7);
        assert!(mode.should_prune(now - Duration::days(8), now));
        assert!(!mode.should_prune(now - Duration::days(6), now));
        // Exactly at the boundary: not yet older than the threshold.
        assert!(!mode.should_prune(now - Duration::days(7), now));
    }
}
