//! Cron and interval schedule utilities.
//!
//! Accepts standard 5-field Unix cron expressions (minute, hour,
//! day-of-month, month, day-of-week) and 6-field expressions with seconds.
//! 5-field expressions fire at second 0.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use flowrun_core::{Error, Result};
use std::str::FromStr;

fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        cron_expr.trim().to_string()
    }
}

pub fn parse_cron(cron_expr: &str) -> Result<Schedule> {
    let normalized = normalize_cron_expr(cron_expr);
    Schedule::from_str(&normalized).map_err(|e| {
        Error::validation(format!("Invalid cron expression '{}': {}", cron_expr, e))
    })
}

/// First occurrence strictly after `after`
pub fn next_cron_after(schedule: &Schedule, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| Error::validation("cron expression has no upcoming occurrence"))
}

/// `at + secs`, rejecting values the calendar cannot represent
pub fn add_secs(at: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| Error::validation(format!("{}s from {} is out of range", secs, at)))
}

/// First tick of a fixed interval strictly after `now`, keeping the phase of
/// `last`. Missed ticks are skipped.
pub fn next_interval_after(
    last: DateTime<Utc>,
    interval_secs: u64,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let interval_secs = interval_secs.max(1);
    let next = add_secs(last, interval_secs)?;
    if next > now {
        return Ok(next);
    }
    let behind = (now - next).num_seconds() as u64 / interval_secs + 1;
    let skip = behind
        .checked_mul(interval_secs)
        .ok_or_else(|| Error::validation("interval resync is out of range"))?;
    add_secs(next, skip)
}

pub fn validate_cron(cron_expr: &str) -> Result<()> {
    parse_cron(cron_expr).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalize_cron_expr() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("*/5  * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn test_cron_validation() {
        assert!(validate_cron("0 * * * *").is_ok());
        assert!(validate_cron("*/10 * * * * *").is_ok());
        assert!(validate_cron("invalid").is_err());
        assert!(validate_cron("").is_err());
    }

    #[test]
    fn test_next_cron_after_is_minute_aligned() {
        let schedule = parse_cron("*/15 * * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2030, 1, 1, 10, 7, 30).unwrap();
        let next = next_cron_after(&schedule, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2030, 1, 1, 10, 15, 0).unwrap());
    }

    #[test]
    fn test_interval_resyncs_after_downtime() {
        let last = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let now = last + Duration::seconds(95);
        let next = next_interval_after(last, 30, now).unwrap();
        assert_eq!(next, last + Duration::seconds(120));

        let on_time = next_interval_after(last, 30, last).unwrap();
        assert_eq!(on_time, last + Duration::seconds(30));
    }

    #[test]
    fn test_out_of_range_offsets_are_errors() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        assert!(add_secs(now, u64::MAX).is_err());
        assert!(add_secs(now, 100_000_000_000_000_000).is_err());
        assert!(next_interval_after(now, u64::MAX, now).is_err());
        assert_eq!(add_secs(now, 60).unwrap(), now + Duration::seconds(60));
    }
}
