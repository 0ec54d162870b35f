//! Schedule Evaluator: turns a task's `schedule` + `timezone` into its next fire instant.
//!
//! Grounded in the `cron` crate's `Schedule::after` walker, the same primitive this codebase's
//! cron subsystem uses to compute next-run times.

use crate::error::{Result, SchedulerError};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Result of evaluating a schedule against a reference instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextFire {
    /// The schedule will fire again at this instant.
    At(DateTime<Utc>),
    /// The schedule has exhausted itself (a one-shot that has already fired).
    Never,
}

const ONE_SHOT_AT_PREFIX: &str = "@at ";
const ONE_SHOT_ONCE: &str = "@once";

/// True if `schedule` is a one-shot form (`@at <RFC3339>` or `@once`). Matching is
/// case-sensitive on both forms, matching how existing stored schedules are written.
pub fn is_one_shot(schedule: &str) -> bool {
    schedule.starts_with(ONE_SHOT_AT_PREFIX) || schedule == ONE_SHOT_ONCE
}

/// Expands descriptor keywords and normalises 5-field cron to the 6-field (with seconds)
/// form the `cron` crate requires. Returns the input unchanged if it already has 6 fields
/// or isn't a recognised descriptor.
fn normalize_cron(expr: &str) -> String {
    let trimmed = expr.trim();
    let expanded = match trimmed {
        "@hourly" => "0 0 * * * *",
        "@daily" | "@midnight" => "0 0 0 * * *",
        "@weekly" => "0 0 0 * * SUN",
        "@monthly" => "0 0 0 1 * *",
        "@annually" | "@yearly" => "0 0 0 1 1 *",
        other => other,
    };
    if expanded.split_whitespace().count() == 5 {
        format!("0 {expanded}")
    } else {
        expanded.to_string()
    }
}

fn parse_cron(expr: &str) -> Result<CronSchedule> {
    let normalized = normalize_cron(expr);
    CronSchedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidSchedule {
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

fn parse_timezone(tz: &str) -> chrono_tz::Tz {
    if tz.trim().is_empty() {
        return chrono_tz::UTC;
    }
    match tz.parse::<chrono_tz::Tz>() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(timezone = tz, "unparseable timezone, falling back to UTC");
            chrono_tz::UTC
        }
    }
}

/// Computes the next fire instant strictly after `after`, given a task's `schedule` and
/// `timezone`. One-shot schedules always return [`NextFire::Never`] here — their single fire
/// is the caller-provided `next_run_at` at creation time, not something this function derives.
pub fn next_fire(schedule: &str, timezone: &str, after: DateTime<Utc>) -> Result<NextFire> {
    if is_one_shot(schedule) {
        return Ok(NextFire::Never);
    }

    let cron_schedule = parse_cron(schedule)?;
    let tz = parse_timezone(timezone);
    let reference = after.with_timezone(&tz);

    match cron_schedule.after(&reference).next() {
        Some(dt) => Ok(NextFire::At(dt.with_timezone(&Utc))),
        None => Ok(NextFire::Never),
    }
}

/// Parses the `@at <RFC3339>` one-shot form, returning the fire instant it names.
pub fn parse_one_shot_at(schedule: &str) -> Result<DateTime<Utc>> {
    let rest = schedule
        .strip_prefix(ONE_SHOT_AT_PREFIX)
        .ok_or_else(|| SchedulerError::InvalidSchedule {
            expression: schedule.to_string(),
            reason: format!("expected {ONE_SHOT_AT_PREFIX:?} prefix"),
        })?;
    DateTime::parse_from_rfc3339(rest.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::InvalidSchedule {
            expression: schedule.to_string(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn hourly_fires_on_the_hour() {
        let after = at(2024, 1, 15, 10, 0, 1);
        let result = next_fire("0 * * * *", "", after).unwrap();
        assert_eq!(result, NextFire::At(at(2024, 1, 15, 11, 0, 0)));
    }

    #[test]
    fn descriptor_keyword_daily_expands() {
        let after = at(2024, 1, 15, 10, 0, 1);
        let result = next_fire("@daily", "", after).unwrap();
        assert_eq!(result, NextFire::At(at(2024, 1, 16, 0, 0, 0)));
    }

    #[test]
    fn six_field_cron_with_seconds_is_respected() {
        let after = at(2024, 1, 15, 10, 0, 0);
        let result = next_fire("*/30 * * * * *", "", after).unwrap();
        assert_eq!(result, NextFire::At(at(2024, 1, 15, 10, 0, 30)));
    }

    #[test]
    fn invalid_cron_is_an_error() {
        let err = next_fire("not a cron expr", "", Utc::now()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule { .. }));
    }

    #[test]
    fn one_shot_at_form_never_recurs() {
        let result = next_fire("@at 2024-06-01T12:00:00Z", "", Utc::now()).unwrap();
        assert_eq!(result, NextFire::Never);
    }

    #[test]
    fn once_keyword_never_recurs() {
        let result = next_fire("@once", "", Utc::now()).unwrap();
        assert_eq!(result, NextFire::Never);
    }

    #[test]
    fn one_shot_matching_is_case_sensitive() {
        assert!(!is_one_shot("@ONCE"));
        assert!(!is_one_shot("@At 2024-06-01T12:00:00Z"));
        assert!(is_one_shot("@once"));
    }

    #[test]
    fn parse_one_shot_at_extracts_instant() {
        let instant = parse_one_shot_at("@at 2024-06-01T12:00:00Z").unwrap();
        assert_eq!(instant, at(2024, 6, 1, 12, 0, 0));
    }

    #[test]
    fn invalid_timezone_falls_back_to_utc_rather_than_erroring() {
        let after = at(2024, 1, 15, 10, 0, 1);
        let result = next_fire("0 * * * *", "Not/AZone", after).unwrap();
        assert_eq!(result, NextFire::At(at(2024, 1, 15, 11, 0, 0)));
    }

    #[test]
    fn timezone_shifts_the_reference_before_walking() {
        // 9am in New York on 2024-01-15 is 14:00 UTC; "0 9 * * *" (9am local) next from
        // 10:00 UTC (=05:00 local) should land the same day at 14:00 UTC.
        let after = at(2024, 1, 15, 10, 0, 0);
        let result = next_fire("0 9 * * *", "America/New_York", after).unwrap();
        assert_eq!(result, NextFire::At(at(2024, 1, 15, 14, 0, 0)));
    }
}
