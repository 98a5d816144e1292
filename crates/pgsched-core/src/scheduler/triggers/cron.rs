//! Cron expression parsing and matching
//!
//! Five fields (`minute hour day-of-month month day-of-week`) or six with a
//! leading seconds field. Supports `*`, `?`, lists, ranges, steps, month and
//! weekday names, and `7` as Sunday. When both day fields are restricted a
//! day matches if either matches.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const DAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parsed cron expression, as bit sets per field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    names_base: u32,
}

const SECOND: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    names_base: 1,
};
// 7 is accepted and folded onto 0 (Sunday).
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
    names_base: 0,
};

impl CronSchedule {
    /// Parse a five- or six-field expression
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let (sec, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(format!("expected 5 or 6 fields, found {n}")),
        };

        let mut days_of_week = parse_field(rest[4], DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            seconds: parse_field(sec, SECOND)?,
            minutes: parse_field(rest[0], MINUTE)?,
            hours: parse_field(rest[1], HOUR)?,
            days_of_month: parse_field(rest[2], DAY_OF_MONTH)?,
            months: parse_field(rest[3], MONTH)?,
            days_of_week,
            dom_restricted: is_restricted(rest[2]),
            dow_restricted: is_restricted(rest[4]),
        })
    }

    /// Whether some calendar day can ever match.
    ///
    /// Only a restricted day-of-month against an unrestricted weekday can
    /// be empty, e.g. `30 2` (February 30th).
    pub fn is_satisfiable(&self) -> bool {
        if self.dow_restricted {
            return true;
        }
        (1..=12u32).filter(|m| bit(self.months, *m)).any(|m| {
            let longest = match m {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            (1..=longest).any(|d| bit(self.days_of_month, d))
        })
    }

    /// Whether a calendar day matches the month and day fields
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !bit(self.months, date.month()) {
            return false;
        }
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether a local wall-clock time matches every field
    pub fn matches(&self, t: NaiveDateTime) -> bool {
        self.matches_date(t.date())
            && bit(self.hours, t.hour())
            && bit(self.minutes, t.minute())
            && bit(self.seconds, t.second())
    }

    /// Earliest matching wall-clock time at or after `from` (to the
    /// second), bounded by `until`.
    pub fn next_local(&self, from: NaiveDateTime, until: NaiveDate) -> Option<NaiveDateTime> {
        let mut t = from.with_nanosecond(0)?;

        loop {
            let date = t.date();
            if date > until {
                return None;
            }
            if !bit(self.months, date.month()) {
                t = first_of_next_month(date)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.matches_date(date) {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            let Some(hour) = next_bit(self.hours, t.hour(), 23) else {
                t = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            };
            if hour != t.hour() {
                t = date.and_hms_opt(hour, 0, 0)?;
            }

            let Some(minute) = next_bit(self.minutes, t.minute(), 59) else {
                t = start_of_next_hour(t)?;
                continue;
            };
            if minute != t.minute() {
                t = date.and_hms_opt(t.hour(), minute, 0)?;
            }

            let Some(second) = next_bit(self.seconds, t.second(), 59) else {
                t = start_of_next_minute(t)?;
                continue;
            };
            return date.and_hms_opt(t.hour(), t.minute(), second);
        }
    }
}

fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field.starts_with('?'))
}

fn bit(mask: u64, n: u32) -> bool {
    n < 64 && mask & (1u64 << n) != 0
}

fn next_bit(mask: u64, from: u32, max: u32) -> Option<u32> {
    (from..=max).find(|n| bit(mask, *n))
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn start_of_next_hour(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.hour() == 23 {
        t.date().succ_opt()?.and_hms_opt(0, 0, 0)
    } else {
        t.date().and_hms_opt(t.hour() + 1, 0, 0)
    }
}

fn start_of_next_minute(t: NaiveDateTime) -> Option<NaiveDateTime> {
    if t.minute() == 59 {
        start_of_next_hour(t)
    } else {
        t.date().and_hms_opt(t.hour(), t.minute() + 1, 0)
    }
}

fn parse_field(field: &str, field_spec: FieldSpec) -> Result<u64, String> {
    if field.is_empty() {
        return Err(format!("empty {} field", field_spec.name));
    }
    let mut mask = 0u64;
    for part in field.split(',') {
        mask |= parse_part(part, field_spec)?;
    }
    Ok(mask)
}

fn parse_part(part: &str, field_spec: FieldSpec) -> Result<u64, String> {
    let (range, step) = match part.split_once('/') {
        Some((range, step)) => {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("invalid step '{step}' in {} field", field_spec.name))?;
            if step == 0 {
                return Err(format!("step must be positive in {} field", field_spec.name));
            }
            (range, Some(step))
        }
        None => (part, None),
    };

    let (start, end) = if range == "*" || range == "?" {
        (field_spec.min, field_spec.max)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_value(a, field_spec)?, parse_value(b, field_spec)?)
    } else {
        let start = parse_value(range, field_spec)?;
        // `a/n` runs from a to the end of the field.
        (start, if step.is_some() { field_spec.max } else { start })
    };

    if start > end {
        return Err(format!(
            "range {start}-{end} is reversed in {} field",
            field_spec.name
        ));
    }

    let step = step.unwrap_or(1);
    Ok((start..=end)
        .step_by(step as usize)
        .fold(0u64, |mask, n| mask | (1u64 << n)))
}

fn parse_value(text: &str, field_spec: FieldSpec) -> Result<u32, String> {
    let upper = text.to_ascii_uppercase();
    if let Some(idx) = field_spec.names.iter().position(|n| *n == upper) {
        return Ok(idx as u32 + field_spec.names_base);
    }
    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value '{text}' in {} field", field_spec.name))?;
    if value < field_spec.min || value > field_spec.max {
        return Err(format!(
            "value {value} out of range {}-{} in {} field",
            field_spec.min, field_spec.max, field_spec.name
        ));
    }
    Ok(value)
}
