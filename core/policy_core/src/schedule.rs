//! Weekly time-window evaluation.

use crate::model::Schedule;
use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike};

/// Parses "HH:MM" (one or two digit hour) into a time of day.
pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    let (hh, mm) = s.trim().split_once(':')?;
    let hh: u32 = hh.trim().parse().ok()?;
    let mm: u32 = mm.trim().parse().ok()?;
    NaiveTime::from_hms_opt(hh, mm, 0)
}

/// Whether `schedule` is active at `now`.
///
/// A missing schedule, or one missing `days`/`start`/`end`, is always active.
/// Both window edges are inclusive.
pub fn is_active<Tz: TimeZone>(now: &DateTime<Tz>, schedule: Option<&Schedule>) -> bool {
    let Some(schedule) = schedule else {
        return true;
    };
    let (Some(days), Some(start), Some(end)) = (
        schedule.days.as_ref(),
        schedule.start.as_deref().and_then(parse_hhmm),
        schedule.end.as_deref().and_then(parse_hhmm),
    ) else {
        return true;
    };

    let weekday = now.weekday().num_days_from_sunday() as u8;
    if !days.contains(&weekday) {
        return false;
    }

    let t = now.time();
    if start == end {
        return true;
    }
    if end < start {
        // Overnight window, e.g. 22:00-06:00.
        t >= start || t <= end
    } else {
        t >= start && t <= end
    }
}

/// First whole minute strictly after `now`.
pub fn next_minute_boundary<Tz: TimeZone>(now: &DateTime<Tz>) -> DateTime<Tz> {
    let truncated = now
        .with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or_else(|| now.clone());
    truncated + Duration::minutes(1)
}
