// ABOUTME: Conflict resolver - pure decision between a diverged source and destination
// ABOUTME: Strategy in, winner and whether to write out; no I/O

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::ConflictStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Source,
    Destination,
}

/// The part of a row version the resolver looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionStamp {
    pub timestamp: DateTime<Utc>,
}

impl VersionStamp {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    /// `None` when the decision is left to an operator.
    pub winner: Option<Winner>,
    /// Whether the source image should be written.
    pub apply: bool,
}

impl Resolution {
    fn source() -> Self {
        Self {
            winner: Some(Winner::Source),
            apply: true,
        }
    }

    fn destination() -> Self {
        Self {
            winner: Some(Winner::Destination),
            apply: false,
        }
    }
}

pub fn resolve(
    strategy: ConflictStrategy,
    source: &VersionStamp,
    destination: &VersionStamp,
) -> Resolution {
    match strategy {
        ConflictStrategy::SourceWins => Resolution::source(),
        ConflictStrategy::DestinationWins => Resolution::destination(),
        // Exact ties go to the source.
        ConflictStrategy::TimestampWins if destination.timestamp > source.timestamp => {
            Resolution::destination()
        }
        ConflictStrategy::TimestampWins => Resolution::source(),
        ConflictStrategy::Manual => Resolution {
            winner: None,
            apply: false,
        },
    }
}

/// Apply an operator's choice for a MANUAL conflict.
pub fn manual(winner: Winner) -> Resolution {
    match winner {
        Winner::Source => Resolution::source(),
        Winner::Destination => Resolution::destination(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn stamps(dest_offset_ms: i64) -> (VersionStamp, VersionStamp) {
        let source: DateTime<Utc> = "2024-05-01T10:00:00Z".parse().unwrap();
        (
            VersionStamp::at(source),
            VersionStamp::at(source + Duration::milliseconds(dest_offset_ms)),
        )
    }

    #[test]
    fn test_source_wins_applies_even_when_destination_is_newer() {
        let (src, dst) = stamps(5_000);
        let r = resolve(ConflictStrategy::SourceWins, &src, &dst);
        assert_eq!(r.winner, Some(Winner::Source));
        assert!(r.apply);
    }

    #[test]
    fn test_destination_wins_skips_write() {
        let (src, dst) = stamps(5_000);
        let r = resolve(ConflictStrategy::DestinationWins, &src, &dst);
        assert_eq!(r.winner, Some(Winner::Destination));
        assert!(!r.apply);
    }

    #[test]
    fn test_timestamp_wins_picks_later_and_ties_to_source() {
        let (src, dst) = stamps(1);
        assert_eq!(
            resolve(ConflictStrategy::TimestampWins, &src, &dst).winner,
            Some(Winner::Destination)
        );
        let (src, dst) = stamps(-1);
        assert_eq!(
            resolve(ConflictStrategy::TimestampWins, &src, &dst).winner,
            Some(Winner::Source)
        );
        let (src, dst) = stamps(0);
        let tie = resolve(ConflictStrategy::TimestampWins, &src, &dst);
        assert_eq!(tie.winner, Some(Winner::Source));
        assert!(tie.apply);
    }

    #[test]
    fn test_manual_defers() {
        let (src, dst) = stamps(5_000);
        let r = resolve(ConflictStrategy::Manual, &src, &dst);
        assert_eq!(r.winner, None);
        assert!(!r.apply);
        assert!(manual(Winner::Source).apply);
        assert!(!manual(Winner::Destination).apply);
    }
}
