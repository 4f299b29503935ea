// File: ./src/schedule.rs
//! Wall-clock trigger computation for recurring weekday schedules.
//!
//! All functions are pure: they take the current instant and return candidate
//! instants, never touching timers or state. Computation is generic over the
//! time zone so tests can pin a zone with known DST rules.

use chrono::{DateTime, Datelike, Days, LocalResult, NaiveDate, NaiveTime, TimeZone};

use crate::model::{Alarm, parse_alarm_time};

/// How far past a nonexistent local time (DST spring-forward) we probe for
/// the first valid wall-clock minute on the same date.
const DST_GAP_PROBE_MINUTES: u32 = 180;

/// Resolve a naive date+time to an instant in `tz`.
///
/// A time skipped by a DST transition resolves to the first valid local time
/// at or after it on the same date; an ambiguous time resolves to the earlier
/// of the two instants.
fn resolve_local_occurrence<Tz>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    for minute in 0..=DST_GAP_PROBE_MINUTES {
        let probe = time.overflowing_add_signed(chrono::Duration::minutes(minute as i64)).0;
        if minute > 0 && probe < time {
            // Wrapped past midnight; the gap reached the end of the day.
            return None;
        }
        match tz.from_local_datetime(&date.and_time(probe)) {
            LocalResult::Single(dt) => return Some(dt),
            LocalResult::Ambiguous(first, _second) => return Some(first),
            LocalResult::None => continue,
        }
    }
    None
}

/// Compute the next occurrence of `alarm` strictly after `now`, ignoring the
/// `skip_next` flag. Returns `None` when `days` is empty or the time string
/// is malformed.
pub fn next_occurrence_in_tz<Tz>(
    alarm: &Alarm,
    now: &DateTime<Tz>,
    tz: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let time = match parse_alarm_time(&alarm.time) {
        Ok(t) => t,
        Err(err) => {
            log::error!("Alarm {} has invalid time: {}", alarm.id, err);
            return None;
        }
    };
    if alarm.days.is_empty() {
        return None;
    }

    for day_offset in 0_u64..8 {
        let date = now.date_naive().checked_add_days(Days::new(day_offset))?;
        if !alarm.days.iter().any(|d| d.to_chrono() == date.weekday()) {
            continue;
        }
        let Some(candidate) = resolve_local_occurrence(tz, date, time) else {
            continue;
        };
        if candidate > *now {
            return Some(candidate);
        }
    }

    None
}

/// Compute the next trigger instant, honoring `skip_next`: when set, the
/// first matching occurrence is consumed and the one after it is returned.
/// The flag itself is cleared by the caller when the trigger fires, not here.
pub fn next_trigger_in_tz<Tz>(alarm: &Alarm, now: &DateTime<Tz>, tz: &Tz) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let first = next_occurrence_in_tz(alarm, now, tz)?;
    if alarm.skip_next {
        let probe = first.clone() + chrono::Duration::minutes(1);
        next_occurrence_in_tz(alarm, &probe, tz)
    } else {
        Some(first)
    }
}

/// Compute the most recent occurrence of `alarm` at or before `now`, used by
/// missed-alarm detection on startup. Scans back one full week.
pub fn previous_occurrence_in_tz<Tz>(
    alarm: &Alarm,
    now: &DateTime<Tz>,
    tz: &Tz,
) -> Option<DateTime<Tz>>
where
    Tz: TimeZone,
    Tz::Offset: Copy,
{
    let time = parse_alarm_time(&alarm.time).ok()?;
    if alarm.days.is_empty() {
        return None;
    }

    for day_offset in 0_u64..8 {
        let date = now.date_naive().checked_sub_days(Days::new(day_offset))?;
        if !alarm.days.iter().any(|d| d.to_chrono() == date.weekday()) {
            continue;
        }
        let Some(candidate) = resolve_local_occurrence(tz, date, time) else {
            continue;
        };
        if candidate <= *now {
            return Some(candidate);
        }
    }

    None
}
