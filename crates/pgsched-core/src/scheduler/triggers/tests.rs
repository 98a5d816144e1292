use super::*;
use chrono::{Datelike, Timelike};
use chrono_tz::America::New_York;

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

fn cron(expr: &str, tz: &str) -> Trigger {
    Trigger::parse(&ScheduleDescriptor::cron(expr, tz)).unwrap()
}

fn interval(expr: &str) -> Trigger {
    Trigger::parse(&ScheduleDescriptor::interval(expr)).unwrap()
}

/// Every fire strictly after `start` and at or before `end`
fn fires_between(
    trigger: &Trigger,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let mut out = Vec::new();
    let mut next = trigger.next_fire(None, start);
    while let Some(t) = next {
        if t > end {
            break;
        }
        out.push(t);
        next = trigger.next_fire(Some(t), t);
    }
    out
}

#[test]
fn test_cron_every_quarter_hour() {
    let t = cron("*/15 * * * *", "UTC");
    assert_eq!(
        t.next_fire(None, utc(2024, 5, 1, 10, 7, 0)),
        Some(utc(2024, 5, 1, 10, 15, 0))
    );
    // Strictly after: a fire exactly at `after` is not repeated.
    assert_eq!(
        t.next_fire(Some(utc(2024, 5, 1, 10, 15, 0)), utc(2024, 5, 1, 10, 15, 0)),
        Some(utc(2024, 5, 1, 10, 30, 0))
    );
}

#[test]
fn test_cron_six_fields_with_seconds() {
    let t = cron("30 0 12 * * *", "UTC");
    assert_eq!(
        t.next_fire(None, utc(2024, 5, 1, 12, 0, 30)),
        Some(utc(2024, 5, 2, 12, 0, 30))
    );
    assert_eq!(
        t.next_fire(None, utc(2024, 5, 1, 11, 59, 59)),
        Some(utc(2024, 5, 1, 12, 0, 30))
    );
}

#[test]
fn test_cron_names_and_sunday_seven() {
    let named = cron("0 9 * jan-mar Mon", "UTC");
    // 2024-01-01 is a Monday.
    assert_eq!(
        named.next_fire(None, utc(2023, 12, 31, 0, 0, 0)),
        Some(utc(2024, 1, 1, 9, 0, 0))
    );

    let sunday = cron("0 0 * * 7", "UTC");
    let next = sunday.next_fire(None, utc(2024, 5, 1, 0, 0, 0)).unwrap();
    assert_eq!(next.weekday(), chrono::Weekday::Sun);
    assert_eq!(next, utc(2024, 5, 5, 0, 0, 0));
}

#[test]
fn test_cron_day_fields_are_or_when_both_restricted() {
    // 1st of the month OR any Friday.
    let t = cron("0 0 1 * FRI", "UTC");
    let fires = fires_between(&t, utc(2024, 5, 28, 0, 0, 0), utc(2024, 6, 8, 0, 0, 0));
    assert_eq!(
        fires,
        vec![
            utc(2024, 5, 31, 0, 0, 0),
            utc(2024, 6, 1, 0, 0, 0),
            utc(2024, 6, 7, 0, 0, 0),
        ]
    );
}

#[test]
fn test_cron_day_fields_are_and_when_one_is_wildcard() {
    let t = cron("0 0 1-7 * *", "UTC");
    let fires = fires_between(&t, utc(2024, 5, 30, 0, 0, 0), utc(2024, 6, 30, 0, 0, 0));
    assert_eq!(fires.len(), 7);
    assert!(fires.iter().all(|f| f.day() <= 7));
}

#[test]
fn test_cron_steps_and_ranges() {
    let t = cron("5/20 8-10 * * *", "UTC");
    let fires = fires_between(&t, utc(2024, 5, 1, 0, 0, 0), utc(2024, 5, 1, 23, 59, 59));
    let minutes: Vec<(u32, u32)> = fires.iter().map(|f| (f.hour(), f.minute())).collect();
    assert_eq!(
        minutes,
        vec![
            (8, 5), (8, 25), (8, 45),
            (9, 5), (9, 25), (9, 45),
            (10, 5), (10, 25), (10, 45),
        ]
    );
}

#[test]
fn test_cron_rejects_malformed() {
    for expr in [
        "",
        "* * * *",
        "* * * * * * *",
        "61 * * * *",
        "* 24 * * *",
        "* * 0 * *",
        "* * * 13 *",
        "* * * * 8",
        "*/0 * * * *",
        "10-5 * * * *",
        "a * * * *",
        "* * * FOO *",
    ] {
        let err = Trigger::parse(&ScheduleDescriptor::cron(expr, "UTC")).unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidCron { .. }), "{expr}: {err}");
    }
}

#[test]
fn test_cron_that_never_fires_is_rejected() {
    let err = Trigger::parse(&ScheduleDescriptor::cron("0 0 30 2 *", "UTC")).unwrap_err();
    assert_eq!(err, ScheduleError::NeverFires("0 0 30 2 *".to_string()));

    // Leap day exists, just rarely.
    let leap = cron("0 0 29 2 *", "UTC");
    assert_eq!(
        leap.next_fire(None, utc(2024, 3, 1, 0, 0, 0)),
        Some(utc(2028, 2, 29, 0, 0, 0))
    );

    // A weekday restriction makes it satisfiable through the OR rule.
    assert!(Trigger::parse(&ScheduleDescriptor::cron("0 0 30 2 MON", "UTC")).is_ok());
}

#[test]
fn test_unknown_timezone() {
    let err = Trigger::parse(&ScheduleDescriptor::cron("0 * * * *", "Mars/Olympus")).unwrap_err();
    assert_eq!(err, ScheduleError::UnknownTimezone("Mars/Olympus".to_string()));

    assert_eq!(parse_timezone("").unwrap(), Tz::UTC);
    assert_eq!(parse_timezone("America/New_York").unwrap(), New_York);
}

#[test]
fn test_hourly_cron_across_spring_forward() {
    // 2024-03-10: New York jumps from 02:00 EST to 03:00 EDT.
    let t = cron("0 * * * *", "America/New_York");
    let start = utc(2024, 3, 10, 5, 0, 0); // local midnight EST
    let end = utc(2024, 3, 11, 4, 0, 0); // next local midnight EDT
    let fires = fires_between(&t, start, end);

    assert_eq!(fires.len(), 23);
    assert!(fires.windows(2).all(|w| (w[1] - w[0]).num_seconds() == 3600));

    let local_hours: Vec<u32> = fires
        .iter()
        .map(|f| f.with_timezone(&New_York).hour())
        .collect();
    assert!(!local_hours.contains(&2));
    assert_eq!(local_hours[0], 1);
    assert_eq!(local_hours[1], 3);
}

#[test]
fn test_hourly_cron_across_fall_back_has_no_duplicate() {
    // 2024-11-03: New York repeats 01:00-01:59.
    let t = cron("0 * * * *", "America/New_York");
    let start = utc(2024, 11, 3, 4, 0, 0); // local midnight EDT
    let end = utc(2024, 11, 4, 5, 0, 0); // next local midnight EST
    let fires = fires_between(&t, start, end);

    assert_eq!(fires.len(), 24);
    let mut local: Vec<(u32, u32)> = fires
        .iter()
        .map(|f| {
            let l = f.with_timezone(&New_York);
            (l.day(), l.hour())
        })
        .collect();
    let before = local.len();
    local.dedup();
    assert_eq!(local.len(), before, "a wall-clock hour fired twice");

    // 01:00 EDT is the only 1 o'clock fire; the next one is 02:00 EST.
    assert_eq!(fires[0], utc(2024, 11, 3, 5, 0, 0));
    assert_eq!(fires[1], utc(2024, 11, 3, 7, 0, 0));
}

#[test]
fn test_repeated_hour_matched_from_inside_second_pass() {
    // Already in the second 01:xx pass: the next 01:45 belongs to the first
    // pass and is in the past, so the next fire is the following day.
    let t = cron("45 1 * * *", "America/New_York");
    let after = utc(2024, 11, 3, 6, 10, 0); // 01:10 EST
    assert_eq!(t.next_fire(None, after), Some(utc(2024, 11, 4, 6, 45, 0)));
}

#[test]
fn test_daily_cron_in_skipped_hour_skips_that_day() {
    let t = cron("30 2 * * *", "America/New_York");
    let after = utc(2024, 3, 9, 8, 0, 0); // 03:00 EST on the 9th
    assert_eq!(t.next_fire(None, after), Some(utc(2024, 3, 11, 6, 30, 0)));
}

#[test]
fn test_interval_pt1h_over_three_hours() {
    let t = interval("PT1H");
    let start = utc(2024, 5, 1, 0, 0, 0);
    let fires = fires_between(&t, start, start + Duration::hours(3));

    assert_eq!(fires.len(), 3);
    assert_eq!(fires[0], start + Duration::hours(1));
    assert!(fires.windows(2).all(|w| (w[1] - w[0]).num_seconds() == 3600));
}

#[test]
fn test_interval_follows_scheduled_not_actual_time() {
    let t = interval("PT10M");
    let scheduled = utc(2024, 5, 1, 0, 10, 0);
    let late = scheduled + Duration::seconds(37);
    assert_eq!(
        t.next_fire(Some(scheduled), late),
        Some(utc(2024, 5, 1, 0, 20, 0))
    );
}

#[test]
fn test_duration_formats() {
    assert_eq!(parse_duration("PT1H").unwrap(), Duration::hours(1));
    assert_eq!(parse_duration("PT30M").unwrap(), Duration::minutes(30));
    assert_eq!(parse_duration("P2W").unwrap(), Duration::days(14));
    assert_eq!(
        parse_duration("P1DT2H3M4S").unwrap(),
        Duration::seconds(86_400 + 7_200 + 180 + 4)
    );
    assert_eq!(parse_duration("PT1.5S").unwrap(), Duration::milliseconds(1500));
    assert_eq!(parse_duration("PT0,25S").unwrap(), Duration::milliseconds(250));
    assert_eq!(parse_duration("3600").unwrap(), Duration::hours(1));
    assert_eq!(parse_duration(" pt5m ").unwrap(), Duration::minutes(5));
}

#[test]
fn test_duration_rejects_calendar_units_and_zero() {
    for text in [
        "P1Y", "P1M", "P1Y2M", "P1W2D", "PT0S", "0", "P", "PT", "1H", "PT1.5H", "PT5", "",
    ] {
        assert!(parse_duration(text).is_err(), "{text}");
    }
    assert!(matches!(
        Trigger::parse(&ScheduleDescriptor::interval("P1M")),
        Err(ScheduleError::InvalidInterval { .. })
    ));
}

#[test]
fn test_interval_catch_up_keeps_grid() {
    let t = interval("PT1H");
    let due = utc(2024, 5, 1, 10, 0, 0);
    let now = utc(2024, 5, 1, 13, 30, 0);

    let c = t.catch_up(due, now);
    assert_eq!(c.fire_at, utc(2024, 5, 1, 13, 0, 0));
    assert_eq!(c.missed, 3);
    assert_eq!(c.next, Some(utc(2024, 5, 1, 14, 0, 0)));
}

#[test]
fn test_catch_up_on_time_is_noop() {
    let t = interval("PT1H");
    let due = utc(2024, 5, 1, 10, 0, 0);
    let c = t.catch_up(due, due + Duration::minutes(5));
    assert_eq!(c.fire_at, due);
    assert_eq!(c.missed, 0);
    assert_eq!(c.next, Some(utc(2024, 5, 1, 11, 0, 0)));
}

#[test]
fn test_cron_catch_up() {
    let t = cron("0 * * * *", "UTC");
    let c = t.catch_up(utc(2024, 5, 1, 10, 0, 0), utc(2024, 5, 1, 12, 30, 0));
    assert_eq!(c.fire_at, utc(2024, 5, 1, 12, 0, 0));
    assert_eq!(c.missed, 2);
    assert_eq!(c.next, Some(utc(2024, 5, 1, 13, 0, 0)));
}

#[test]
fn test_period_and_timezone_accessors() {
    assert_eq!(interval("PT2M").period(), Some(Duration::minutes(2)));
    assert_eq!(interval("PT2M").timezone(), Tz::UTC);

    let c = cron("0 * * * *", "America/New_York");
    assert_eq!(c.period(), None);
    assert_eq!(c.timezone(), New_York);
}
