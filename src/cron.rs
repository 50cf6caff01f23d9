//! A standard 5-field cron parser and DST-safe next-occurrence evaluator.
//!
//! Deliberately hand-written rather than built on a third-party cron crate:
//! the field grammar here is the traditional `minute hour dom month dow`
//! 5-field form, and the DST handling below is explicit and tested rather
//! than inherited from a library's unstated behavior.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

/// How many years forward to search before giving up on finding a match.
/// Bounds evaluation time for crons with no future occurrence (e.g. Feb 30).
const MAX_SEARCH_YEARS: i32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronParseError(pub String);

impl fmt::Display for CronParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cron expression: {}", self.0)
    }
}

impl std::error::Error for CronParseError {}

/// A parsed 5-field cron expression, ready for repeated evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: BTreeSet<u32>,
    hour: BTreeSet<u32>,
    dom: BTreeSet<u32>,
    month: BTreeSet<u32>,
    dow: BTreeSet<u32>,
    /// Whether both day-of-month and day-of-week were restricted (not `*`),
    /// in which case standard cron semantics treat a day as a match when
    /// *either* field matches, not both.
    dom_and_dow_restricted: bool,
    source: String,
}

impl CronSchedule {
    /// Parse a 5-field cron expression (`minute hour dom month dow`).
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError(format!(
                "expected 5 fields (minute hour dom month dow), got {}: '{}'",
                fields.len(),
                expr
            )));
        }

        let minute = parse_field(fields[0], 0, 59)?;
        let hour = parse_field(fields[1], 0, 23)?;
        let dom = parse_field(fields[2], 1, 31)?;
        let month = parse_field(fields[3], 1, 12)?;
        let mut dow = parse_field(fields[4], 0, 7)?;
        // 7 is an accepted alias for Sunday (0) in standard cron.
        if dow.remove(&7) {
            dow.insert(0);
        }

        let dom_and_dow_restricted = fields[2].trim() != "*" && fields[4].trim() != "*";

        Ok(CronSchedule {
            minute,
            hour,
            dom,
            month,
            dow,
            dom_and_dow_restricted,
            source: expr.to_string(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        if !self.month.contains(&date.month()) {
            return false;
        }
        let dom_ok = self.dom.contains(&date.day());
        // chrono: Sunday = 0 in our representation; NaiveDate::weekday() uses Mon=0..Sun=6
        let dow_num = date.weekday().num_days_from_sunday();
        let dow_ok = self.dow.contains(&dow_num);

        if self.dom_and_dow_restricted {
            dom_ok || dow_ok
        } else {
            dom_ok && dow_ok
        }
    }

    /// Find the smallest UTC instant strictly after `after` whose projection
    /// into `tz` matches this schedule. Returns `None` if no match exists
    /// within the search horizon (e.g. Feb 30th).
    pub fn next_after(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let after_local = after.with_timezone(&tz);
        let start_date = after_local.date_naive();
        let horizon_days = MAX_SEARCH_YEARS as i64 * 366;

        for day_offset in 0..horizon_days {
            let date = start_date + ChronoDuration::days(day_offset);
            if !self.date_matches(date) {
                continue;
            }

            for hour in self.hour.iter().copied() {
                for minute in self.minute.iter().copied() {
                    let time = match NaiveTime::from_hms_opt(hour, minute, 0) {
                        Some(t) => t,
                        None => continue,
                    };

                    if day_offset == 0 && time <= after_local.time() {
                        continue;
                    }

                    let naive = date.and_time(time);
                    match tz.from_local_datetime(&naive) {
                        chrono::LocalResult::Single(dt) => {
                            return Some(dt.with_timezone(&Utc));
                        }
                        chrono::LocalResult::Ambiguous(earliest, _latest) => {
                            // Fall-back DST transition: pick the earlier
                            // (standard-time) occurrence so the job fires once.
                            return Some(earliest.with_timezone(&Utc));
                        }
                        chrono::LocalResult::None => {
                            // Spring-forward gap: this local time doesn't
                            // exist. Resolve by advancing to the first
                            // existing local instant after the gap.
                            return Some(skip_forward_over_gap(tz, naive));
                        }
                    }
                }
            }
        }

        None
    }
}

/// Given a local naive datetime that falls inside a DST "spring forward"
/// gap, returns the first real UTC instant whose local projection is at or
/// past that naive time.
fn skip_forward_over_gap(tz: Tz, naive: chrono::NaiveDateTime) -> DateTime<Utc> {
    let anchor_naive = naive - ChronoDuration::hours(3);
    let anchor = match tz.from_local_datetime(&anchor_naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => anchor_naive.and_utc(),
    };

    let mut utc = anchor;
    loop {
        utc += ChronoDuration::minutes(1);
        let local = utc.with_timezone(&tz);
        if local.naive_local() >= naive {
            return utc;
        }
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, CronParseError> {
    let mut out = BTreeSet::new();
    for part in raw.split(',') {
        out.extend(parse_field_item(part, min, max)?);
    }
    if out.is_empty() {
        return Err(CronParseError(format!("empty field: '{raw}'")));
    }
    Ok(out)
}

fn parse_field_item(item: &str, min: u32, max: u32) -> Result<Vec<u32>, CronParseError> {
    let (range_part, step) = match item.split_once('/') {
        Some((r, s)) => {
            let step: u32 = s
                .parse()
                .map_err(|_| CronParseError(format!("invalid step in '{item}'")))?;
            if step == 0 {
                return Err(CronParseError(format!("step cannot be zero in '{item}'")));
            }
            (r, step)
        }
        None => (item, 1),
    };

    let (lo, hi) = if range_part == "*" {
        (min, max)
    } else if let Some((a, b)) = range_part.split_once('-') {
        let lo: u32 = a
            .parse()
            .map_err(|_| CronParseError(format!("invalid range start in '{item}'")))?;
        let hi: u32 = b
            .parse()
            .map_err(|_| CronParseError(format!("invalid range end in '{item}'")))?;
        if lo > hi {
            return Err(CronParseError(format!("range start after end in '{item}'")));
        }
        (lo, hi)
    } else {
        let v: u32 = range_part
            .parse()
            .map_err(|_| CronParseError(format!("invalid value '{item}'")))?;
        (v, v)
    };

    if lo < min || hi > max {
        return Err(CronParseError(format!(
            "value out of range [{min},{max}] in '{item}'"
        )));
    }

    Ok((lo..=hi).step_by(step as usize).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use chrono_tz::America::New_York;
    use chrono_tz::Tz as TzEnum;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(CronSchedule::parse("* * *").is_err());
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(CronSchedule::parse("60 * * * *").is_err());
    }

    #[test]
    fn parses_and_matches_every_minute() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let next = s.next_after(utc(2024, 1, 1, 0, 0, 0), TzEnum::UTC).unwrap();
        assert_eq!(next, utc(2024, 1, 1, 0, 1, 0));
    }

    #[test]
    fn next_run_strictly_after_input() {
        let s = CronSchedule::parse("30 2 * * *").unwrap();
        let after = utc(2024, 6, 1, 2, 30, 0);
        let next = s.next_after(after, TzEnum::UTC).unwrap();
        assert!(next > after);
    }

    #[test]
    fn exotic_pattern_with_no_match_returns_none() {
        let s = CronSchedule::parse("0 0 30 2 *").unwrap();
        assert_eq!(s.next_after(utc(2024, 1, 1, 0, 0, 0), TzEnum::UTC), None);
    }

    #[test]
    fn dst_spring_forward_skips_nonexistent_time() {
        // S1: America/New_York, cron 30 2 * * *, wall clock 2024-03-10 01:00 local (06:00Z).
        // 02:30 local doesn't exist that day (clocks jump 2:00 -> 3:00); the
        // evaluator advances to the first existing local instant, 03:00 EDT,
        // which is 07:00Z.
        let s = CronSchedule::parse("30 2 * * *").unwrap();
        let after = utc(2024, 3, 10, 6, 0, 0);
        let next = s.next_after(after, New_York).unwrap();
        assert_eq!(next, utc(2024, 3, 10, 7, 0, 0));
        assert_eq!(next.with_timezone(&New_York).hour(), 3);
    }

    #[test]
    fn dst_fall_back_fires_once_at_earlier_occurrence() {
        // S2: America/New_York, cron 30 1 * * *, 2024-11-03 has two local 01:30 instants.
        let s = CronSchedule::parse("30 1 * * *").unwrap();
        let after = utc(2024, 11, 3, 0, 0, 0);
        let next = s.next_after(after, New_York).unwrap();
        assert_eq!(next, utc(2024, 11, 3, 5, 30, 0));
    }

    #[test]
    fn dom_or_dow_when_both_restricted() {
        // 0 0 1 * MON: fires on the 1st of the month OR any Monday.
        let s = CronSchedule::parse("0 0 1 * 1").unwrap();
        assert!(s.date_matches(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(s.date_matches(NaiveDate::from_ymd_opt(2024, 1, 8).unwrap())); // a Monday
        assert!(!s.date_matches(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()));
    }
}
