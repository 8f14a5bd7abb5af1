//! Display-timezone helpers. Storage is always UTC; everything a human reads
//! (day boundaries, hourly buckets, relative timestamps) goes through here.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;

pub fn to_local(at: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    at.with_timezone(&tz)
}

pub fn same_local_day(a: DateTime<Utc>, b: DateTime<Utc>, tz: Tz) -> bool {
    to_local(a, tz).date_naive() == to_local(b, tz).date_naive()
}

/// Start of the local hour containing `at`, expressed in UTC.
pub fn local_hour_start(at: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = to_local(at, tz);
    let trimmed = at - Duration::minutes(local.minute() as i64) - Duration::seconds(local.second() as i64);
    trimmed.with_nanosecond(0).unwrap_or(trimmed)
}

/// Parse a filter bound. Accepts RFC 3339 or a bare `YYYY-MM-DD`, which is
/// taken as the start (or end, when `end_of_day`) of that local day.
pub fn parse_date_bound(raw: &str, tz: Tz, end_of_day: bool) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)?
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)?
    };
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Relative, human-friendly rendering of `at` as seen from `now`.
pub fn humanize(at: DateTime<Utc>, now: DateTime<Utc>, tz: Tz) -> String {
    let local = to_local(at, tz);
    let elapsed = now - at;
    let minutes = elapsed.num_minutes();
    let hours = elapsed.num_hours();

    if minutes < 1 {
        return "just now".to_string();
    }
    if minutes < 60 {
        return format!("{minutes} min ago");
    }
    if hours < 24 {
        return format!("{hours}h ago");
    }

    let local_now = to_local(now, tz);
    let days = (local_now.date_naive() - local.date_naive()).num_days();
    if days <= 1 {
        return format!("yesterday at {}", local.format("%H:%M"));
    }
    if days < 7 {
        return format!("{} at {}", weekday_name(local.weekday()), local.format("%H:%M"));
    }
    local.format("%d/%m/%Y %H:%M").to_string()
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
