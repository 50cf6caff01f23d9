//! Wall-clock abstraction and time-zone resolution.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Abstracts reading the current instant so the scheduler loop and tests can
/// substitute a fixed or stepped clock instead of the system clock.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that always returns a fixed instant. Used in tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Outcome of resolving a textual zone identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneResolution {
    pub zone: Tz,
    /// True if the requested id could not be resolved and UTC was substituted.
    pub fell_back_to_utc: bool,
}

/// Resolves textual zone identifiers (IANA names such as `America/New_York`)
/// to [`chrono_tz::Tz`] rule sets, with a UTC fallback policy.
///
/// Deterministic for a given input. Empty or whitespace-only input resolves
/// to UTC with no fallback diagnostic, since it represents "use the default"
/// rather than a malformed identifier.
pub fn resolve_zone(zone_id: &str) -> ZoneResolution {
    let trimmed = zone_id.trim();
    if trimmed.is_empty() {
        return ZoneResolution {
            zone: Tz::UTC,
            fell_back_to_utc: false,
        };
    }

    match Tz::from_str(trimmed) {
        Ok(zone) => ZoneResolution {
            zone,
            fell_back_to_utc: false,
        },
        Err(_) => ZoneResolution {
            zone: Tz::UTC,
            fell_back_to_utc: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_iana_zone() {
        let r = resolve_zone("America/New_York");
        assert!(!r.fell_back_to_utc);
        assert_eq!(r.zone, Tz::America__New_York);
    }

    #[test]
    fn empty_input_is_utc_without_diagnostic() {
        let r = resolve_zone("   ");
        assert_eq!(r.zone, Tz::UTC);
        assert!(!r.fell_back_to_utc);
    }

    #[test]
    fn unknown_zone_falls_back_to_utc_with_diagnostic() {
        let r = resolve_zone("Not/AZone");
        assert_eq!(r.zone, Tz::UTC);
        assert!(r.fell_back_to_utc);
    }

    #[test]
    fn resolution_is_deterministic() {
        let a = resolve_zone("Asia/Tokyo");
        let b = resolve_zone("Asia/Tokyo");
        assert_eq!(a, b);
    }
}
