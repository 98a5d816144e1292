//! ISO-8601 fixed durations
//!
//! Accepts `PnW` on its own, or `PnDTnHnMnS` with an optional fractional
//! seconds part. A bare integer is taken as seconds. Years and months are
//! not fixed lengths and are rejected.

use chrono::Duration;

/// Parse a fixed duration with millisecond precision.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("duration is empty".to_string());
    }

    let millis = if text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse::<i64>()
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .ok_or_else(|| format!("duration '{text}' is too large"))?
    } else {
        parse_iso(&text.to_ascii_uppercase())?
    };

    if millis <= 0 {
        return Err(format!("duration '{text}' must be greater than zero"));
    }
    Ok(Duration::milliseconds(millis))
}

fn parse_iso(text: &str) -> Result<i64, String> {
    let body = text
        .strip_prefix('P')
        .ok_or_else(|| format!("duration '{text}' must start with 'P'"))?;
    if body.is_empty() {
        return Err(format!("duration '{text}' has no components"));
    }

    if let Some(weeks) = body.strip_suffix('W') {
        let weeks: i64 = weeks
            .parse()
            .map_err(|_| format!("invalid week count in '{text}'"))?;
        return weeks
            .checked_mul(7 * 24 * 3_600_000)
            .ok_or_else(|| format!("duration '{text}' is too large"));
    }

    let (date, time) = match body.split_once('T') {
        Some((date, time)) => {
            if time.is_empty() {
                return Err(format!("duration '{text}' has an empty time part"));
            }
            (date, Some(time))
        }
        None => (body, None),
    };

    let mut total: i64 = 0;
    for (value, unit) in components(date, text)? {
        let unit_ms = match unit {
            'D' => 24 * 3_600_000,
            'Y' | 'M' => {
                return Err(format!(
                    "calendar unit '{unit}' in '{text}' has no fixed length"
                ))
            }
            'W' => return Err(format!("weeks cannot be combined with other units in '{text}'")),
            other => return Err(format!("unknown date unit '{other}' in '{text}'")),
        };
        total = add_component(total, value, unit_ms, text)?;
    }

    if let Some(time) = time {
        for (value, unit) in components(time, text)? {
            let unit_ms = match unit {
                'H' => 3_600_000,
                'M' => 60_000,
                'S' => 1_000,
                other => return Err(format!("unknown time unit '{other}' in '{text}'")),
            };
            if unit != 'S' && value.fract() != 0.0 {
                return Err(format!("only seconds may be fractional in '{text}'"));
            }
            total = add_component(total, value, unit_ms, text)?;
        }
    }

    Ok(total)
}

fn add_component(total: i64, value: f64, unit_ms: i64, text: &str) -> Result<i64, String> {
    let ms = (value * unit_ms as f64).round();
    if !ms.is_finite() || ms > i64::MAX as f64 {
        return Err(format!("duration '{text}' is too large"));
    }
    total
        .checked_add(ms as i64)
        .ok_or_else(|| format!("duration '{text}' is too large"))
}

/// Split `12H30M1.5S` into `[(12, 'H'), (30, 'M'), (1.5, 'S')]`.
fn components(part: &str, text: &str) -> Result<Vec<(f64, char)>, String> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
            continue;
        }
        if number.is_empty() {
            return Err(format!("unit '{c}' without a value in '{text}'"));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number '{number}' in '{text}'"))?;
        out.push((value, c));
        number.clear();
    }
    if !number.is_empty() {
        return Err(format!("trailing number without a unit in '{text}'"));
    }
    Ok(out)
}
