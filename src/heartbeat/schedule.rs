//! Next-run computation for scheduled tasks.

use chrono::{
    DateTime, Duration, Local, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, TimeZone, Utc,
};
use croner::Cron;
use tracing::warn;

/// Next time a task with `schedule` should run, as an ISO 8601 string.
///
/// Cron expressions yield their next occurrence strictly after `now`, in the
/// local time zone. Absolute timestamps are returned unchanged. Anything else
/// falls back to a day from now so a bad schedule cannot spin.
pub fn calculate_next_run(schedule: &str, now: DateTime<Utc>) -> String {
    let schedule = schedule.trim();
    let now = now.trunc_subsecs(0);

    if let Some(next) = next_cron_occurrence(schedule, now) {
        return format_timestamp(next);
    }
    if parse_timestamp(schedule).is_some() {
        return schedule.to_string();
    }

    warn!(schedule, "Unrecognized schedule, retrying in 24h");
    format_timestamp(now + Duration::hours(24))
}

fn next_cron_occurrence(schedule: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let cron = schedule.parse::<Cron>().ok()?;
    match cron.find_next_occurrence(&now.with_timezone(&Local), false) {
        Ok(next) => Some(next.with_timezone(&Utc)),
        Err(e) => {
            warn!(schedule, error = %e, "Cron expression has no next occurrence");
            None
        }
    }
}

/// Parse the timestamp forms the task store writes.
///
/// Offset-less forms are read in local time; a bare date is midnight UTC.
/// Inputs without a date separator are rejected outright so that plain
/// numbers are never mistaken for epochs.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if !raw.contains('-') && !raw.contains('/') {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y/%m/%d %H:%M:%S",
        "%Y/%m/%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(next: &str) -> DateTime<Utc> {
        parse_timestamp(next).unwrap()
    }

    #[test]
    fn test_cron_is_strictly_after_now() {
        let now = Utc::now();
        let next = parsed(&calculate_next_run("*/5 * * * *", now));
        assert!(next > now);
        assert!(next <= now + Duration::minutes(5));

        let daily = parsed(&calculate_next_run("0 9 * * *", now));
        assert!(daily > now);
        assert!(daily <= now + Duration::hours(25));
    }

    #[test]
    fn test_cron_lands_on_whole_seconds() {
        let now = Utc.with_ymd_and_hms(2026, 10, 17, 19, 57, 53).unwrap()
            + Duration::milliseconds(498);
        let next = calculate_next_run("*/5 * * * *", now);
        assert_eq!(parsed(&next).timestamp_subsec_millis(), 0);
        assert!(next.ends_with(":00.000Z"), "{next}");
        assert_eq!(parsed(&next).timestamp() % 300, 0);
    }

    #[test]
    fn test_timestamp_returned_unchanged() {
        let now = Utc::now();
        let future = format_timestamp(now + Duration::days(3));
        assert_eq!(calculate_next_run(&future, now), future);
        assert_eq!(
            calculate_next_run("2020-01-01T00:00:00Z", now),
            "2020-01-01T00:00:00Z"
        );
        assert_eq!(calculate_next_run("2031-06-01 09:30", now), "2031-06-01 09:30");
    }

    #[test]
    fn test_garbage_falls_back_to_a_day() {
        let now = Utc::now();
        for schedule in ["whenever you like", "", "12345", "every tuesday-ish"] {
            let next = parsed(&calculate_next_run(schedule, now));
            assert!(next >= now + Duration::hours(23), "{schedule}");
            assert!(next <= now + Duration::hours(25), "{schedule}");
        }
    }

    #[test]
    fn test_parse_timestamp_forms() {
        assert_eq!(
            parse_timestamp("2026-03-14T09:30:00.000Z"),
            Some(Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap())
        );
        assert_eq!(
            parse_timestamp("2026-03-14T10:30:00+01:00"),
            Some(Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap())
        );
        assert_eq!(
            parse_timestamp("2026-03-14"),
            Some(Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap())
        );
        assert!(parse_timestamp("2026/03/14 09:30").is_some());
        assert!(parse_timestamp("1700000000").is_none());
        assert!(parse_timestamp("not-a-date").is_none());
    }
}
