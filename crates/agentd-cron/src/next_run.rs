//! Next-run computation for every schedule type.
//!
//! | type        | schedule                             | next run                               |
//! |-------------|--------------------------------------|----------------------------------------|
//! | `once`      | ISO-8601 datetime                    | that instant, if still in the future   |
//! | `interval`  | minutes                              | `base + N min`, base carried forward   |
//! | `heartbeat` | minutes                              | `now + N min`                          |
//! | `runloop`   | seconds                              | `base + N s`, base carried forward     |
//! | `recurring` | `daily@HH:MM` / `weekdays@HH:MM`     | next matching wall-clock slot after now|
//!
//! "Carried forward" means the base is the stored next run if that is still
//! ahead of now, otherwise now. A result of `0` means there is nothing to arm.

use chrono::{
    DateTime, Datelike, Days, Local, NaiveDateTime, NaiveTime, TimeZone, Weekday,
};
use tracing::warn;

use agentd_types::ScheduleType;

use crate::{Result, SchedulerError};

/// Naive datetime layouts accepted for `once`, read in the scheduler's zone.
const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// A parsed `schedule` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Absolute instant in unix millis.
    Instant(i64),
    /// Wall-clock datetime without an offset.
    LocalDateTime(NaiveDateTime),
    Every { period_ms: i64, carry_forward: bool },
    Daily { at: NaiveTime, weekdays_only: bool },
}

impl Schedule {
    pub fn parse(task_type: ScheduleType, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match task_type {
            ScheduleType::Once => parse_once(raw),
            ScheduleType::Interval => every(task_type, raw, 60_000, true),
            ScheduleType::Heartbeat => every(task_type, raw, 60_000, false),
            ScheduleType::Runloop => every(task_type, raw, 1_000, true),
            ScheduleType::Recurring => parse_recurring(raw),
        }
    }

    /// Next firing strictly after `now`, or `0` if there is none.
    pub fn next_after<Tz: TimeZone>(&self, tz: &Tz, stored_next_run: i64, now: i64) -> i64 {
        match *self {
            Schedule::Instant(at) => future_or_zero(at, now),
            Schedule::LocalDateTime(naive) => tz
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| future_or_zero(dt.timestamp_millis(), now))
                .unwrap_or(0),
            Schedule::Every {
                period_ms,
                carry_forward,
            } => {
                let base = if carry_forward && stored_next_run > now {
                    stored_next_run
                } else {
                    now
                };
                base.saturating_add(period_ms)
            }
            Schedule::Daily { at, weekdays_only } => next_daily(tz, at, weekdays_only, now),
        }
    }
}

/// Next run in the process's local time zone. Invalid schedules yield `0`.
pub fn next_run_time(
    task_type: ScheduleType,
    schedule: &str,
    stored_next_run: i64,
    now: i64,
) -> i64 {
    next_run_time_in(&Local, task_type, schedule, stored_next_run, now)
}

pub fn next_run_time_in<Tz: TimeZone>(
    tz: &Tz,
    task_type: ScheduleType,
    schedule: &str,
    stored_next_run: i64,
    now: i64,
) -> i64 {
    match Schedule::parse(task_type, schedule) {
        Ok(parsed) => parsed.next_after(tz, stored_next_run, now),
        Err(e) => {
            warn!(%task_type, schedule, "Cannot compute next run: {e}");
            0
        }
    }
}

fn future_or_zero(at: i64, now: i64) -> i64 {
    if at > now { at } else { 0 }
}

fn parse_once(raw: &str) -> Result<Schedule> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Schedule::Instant(dt.timestamp_millis()));
    }
    LOCAL_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(Schedule::LocalDateTime)
        .ok_or_else(|| SchedulerError::Validation(format!("not an ISO-8601 datetime: {raw:?}")))
}

fn every(task_type: ScheduleType, raw: &str, unit_ms: i64, carry_forward: bool) -> Result<Schedule> {
    let period_ms = raw
        .parse::<i64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(unit_ms))
        .ok_or_else(|| {
            SchedulerError::Validation(format!(
                "{task_type} schedule must be a positive integer, got {raw:?}"
            ))
        })?;
    Ok(Schedule::Every {
        period_ms,
        carry_forward,
    })
}

fn parse_recurring(raw: &str) -> Result<Schedule> {
    let invalid = || {
        SchedulerError::Validation(format!(
            "recurring schedule must be daily@HH:MM or weekdays@HH:MM, got {raw:?}"
        ))
    };
    let (kind, time) = raw.split_once('@').ok_or_else(invalid)?;
    let weekdays_only = match kind {
        "daily" => false,
        "weekdays" => true,
        _ => return Err(invalid()),
    };
    let at = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| invalid())?;
    Ok(Schedule::Daily { at, weekdays_only })
}

fn next_daily<Tz: TimeZone>(tz: &Tz, at: NaiveTime, weekdays_only: bool, now: i64) -> i64 {
    let Some(now_dt) = tz.timestamp_millis_opt(now).single() else {
        return 0;
    };
    let today = now_dt.date_naive();

    // A week ahead always contains a weekday slot.
    for offset in 0..=7 {
        let Some(date) = today.checked_add_days(Days::new(offset)) else {
            break;
        };
        if weekdays_only && matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            continue;
        }
        // Skipped when the slot falls in a DST gap
        let Some(slot) = tz.from_local_datetime(&date.and_time(at)).earliest() else {
            continue;
        };
        let slot = slot.timestamp_millis();
        if slot > now {
            return slot;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    fn next(task_type: ScheduleType, schedule: &str, stored: i64, now: i64) -> i64 {
        next_run_time_in(&Utc, task_type, schedule, stored, now)
    }

    #[test]
    fn test_interval_minutes() {
        let now = at("2024-06-05T12:00:00Z");
        assert_eq!(next(ScheduleType::Interval, "5", 0, now), now + 300_000);
        assert_eq!(next(ScheduleType::Interval, " 5 ", 0, now), now + 300_000);
    }

    #[test]
    fn test_interval_carries_future_base_forward() {
        let now = at("2024-06-05T12:00:00Z");
        let stored = now + 60_000;
        assert_eq!(next(ScheduleType::Interval, "5", stored, now), stored + 300_000);
        // A base already in the past is replaced by now
        assert_eq!(next(ScheduleType::Interval, "5", now - 1, now), now + 300_000);
    }

    #[test]
    fn test_heartbeat_always_counts_from_now() {
        let now = at("2024-06-05T12:00:00Z");
        assert_eq!(
            next(ScheduleType::Heartbeat, "2", now + 60_000, now),
            now + 120_000
        );
    }

    #[test]
    fn test_runloop_seconds() {
        let now = at("2024-06-05T12:00:00Z");
        assert_eq!(next(ScheduleType::Runloop, "30", 0, now), now + 30_000);
        assert_eq!(
            next(ScheduleType::Runloop, "30", now + 10_000, now),
            now + 40_000
        );
    }

    #[test]
    fn test_invalid_periods_yield_zero() {
        let now = at("2024-06-05T12:00:00Z");
        for bad in ["", "abc", "0", "-3", "1.5"] {
            assert_eq!(next(ScheduleType::Interval, bad, 0, now), 0, "{bad:?}");
            assert_eq!(next(ScheduleType::Runloop, bad, 0, now), 0, "{bad:?}");
        }
        assert!(matches!(
            Schedule::parse(ScheduleType::Heartbeat, "x"),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_once_future_and_past() {
        let now = at("2024-06-05T12:00:00Z");
        assert_eq!(
            next(ScheduleType::Once, "2024-06-05T13:30:00Z", 0, now),
            at("2024-06-05T13:30:00Z")
        );
        assert_eq!(next(ScheduleType::Once, "2024-06-05T11:00:00Z", 0, now), 0);
        assert_eq!(next(ScheduleType::Once, "2024-06-05T12:00:00Z", 0, now), 0);
    }

    #[test]
    fn test_once_without_offset_uses_zone() {
        let now = at("2024-06-05T12:00:00Z");
        assert_eq!(
            next(ScheduleType::Once, "2024-06-05T18:00", 0, now),
            at("2024-06-05T18:00:00Z")
        );
        assert_eq!(
            next(ScheduleType::Once, "2024-06-05 18:00:00", 0, now),
            at("2024-06-05T18:00:00Z")
        );
        assert!(Schedule::parse(ScheduleType::Once, "tomorrow").is_err());
    }

    #[test]
    fn test_daily_same_day_and_rollover() {
        let morning = at("2024-06-05T08:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "daily@09:00", 0, morning),
            at("2024-06-05T09:00:00Z")
        );

        let late = at("2024-06-05T10:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "daily@09:00", 0, late),
            at("2024-06-06T09:00:00Z")
        );

        // Exactly on the slot rolls to tomorrow
        let on_slot = at("2024-06-05T09:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "daily@09:00", 0, on_slot),
            at("2024-06-06T09:00:00Z")
        );
    }

    #[test]
    fn test_weekdays_skip_weekend() {
        // 2024-06-01 is a Saturday
        let saturday = at("2024-06-01T08:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "weekdays@09:00", 0, saturday),
            at("2024-06-03T09:00:00Z")
        );

        let friday_evening = at("2024-06-07T18:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "weekdays@09:00", 0, friday_evening),
            at("2024-06-10T09:00:00Z")
        );

        let wednesday = at("2024-06-05T08:00:00Z");
        assert_eq!(
            next(ScheduleType::Recurring, "weekdays@09:00", 0, wednesday),
            at("2024-06-05T09:00:00Z")
        );
    }

    #[test]
    fn test_unsupported_recurring_formats() {
        let now = at("2024-06-05T08:00:00Z");
        for bad in ["hourly@09:00", "daily", "daily@25:00", "weekdays@9am"] {
            assert_eq!(next(ScheduleType::Recurring, bad, 0, now), 0, "{bad:?}");
        }
    }
}
