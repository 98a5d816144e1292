//! Trigger calculation
//!
//! A [`Trigger`] turns a job's schedule descriptor into concrete UTC fire
//! instants. Cron expressions are evaluated against wall-clock time in the
//! job's timezone; intervals are fixed durations on a grid anchored at the
//! first fire.

mod cron;
mod duration;

#[cfg(test)]
mod tests;

use chrono::{DateTime, Duration, LocalResult, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::registry::{ScheduleDescriptor, ScheduleType};

pub use cron::CronSchedule;
pub use duration::parse_duration;

/// How far ahead a cron search looks before giving up (covers leap days)
const CRON_HORIZON_DAYS: i64 = 366 * 9;

/// Upper bound on slots counted when a cron job has fallen behind
const MAX_CATCH_UP_SCAN: u64 = 10_000;

/// Invalid schedule descriptor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Cron expression did not parse
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        /// Offending expression
        expression: String,
        /// Parser message
        reason: String,
    },

    /// Cron expression parses but no calendar day satisfies it
    #[error("cron expression '{0}' never fires")]
    NeverFires(String),

    /// Interval expression did not parse
    #[error("invalid interval '{expression}': {reason}")]
    InvalidInterval {
        /// Offending expression
        expression: String,
        /// Parser message
        reason: String,
    },

    /// Timezone is not a known IANA name
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

/// Cron schedule bound to a timezone
#[derive(Debug, Clone, PartialEq)]
pub struct CronTrigger {
    expression: String,
    schedule: CronSchedule,
    timezone: Tz,
}

impl CronTrigger {
    /// Parse `expression` for evaluation in `timezone`
    pub fn new(expression: &str, timezone: Tz) -> Result<Self, ScheduleError> {
        let schedule = CronSchedule::parse(expression).map_err(|reason| {
            ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason,
            }
        })?;
        if !schedule.is_satisfiable() {
            return Err(ScheduleError::NeverFires(expression.to_string()));
        }
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    /// Source expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Smallest instant strictly after `after` whose local wall time
    /// matches, taking the earliest instant when a wall time repeats.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone).naive_local();
        let until = local.date().checked_add_signed(Duration::days(CRON_HORIZON_DAYS))?;
        let mut from = local.checked_add_signed(Duration::seconds(1))?;

        loop {
            let candidate = self.schedule.next_local(from, until)?;
            let instant = match self.timezone.from_local_datetime(&candidate) {
                LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                    Some(t.with_timezone(&Utc))
                }
                // Wall time skipped by a DST jump.
                LocalResult::None => None,
            };
            if let Some(instant) = instant.filter(|t| *t > after) {
                return Some(instant);
            }
            from = candidate.checked_add_signed(Duration::seconds(1))?;
        }
    }
}

/// Fixed-period schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalTrigger {
    period: Duration,
}

impl IntervalTrigger {
    /// Parse an ISO-8601 duration or integer seconds
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let period = parse_duration(expression).map_err(|reason| {
            ScheduleError::InvalidInterval {
                expression: expression.to_string(),
                reason,
            }
        })?;
        Ok(Self { period })
    }

    /// Fixed period
    pub fn period(&self) -> Duration {
        self.period
    }
}

/// Parsed schedule
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Wall-clock cron schedule
    Cron(CronTrigger),
    /// Fixed interval
    Interval(IntervalTrigger),
}

/// Where a late entry lands after skipping elapsed slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUp {
    /// Slot that fires now
    pub fire_at: DateTime<Utc>,
    /// Earlier slots skipped
    pub missed: u64,
    /// Slot after `fire_at`
    pub next: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Parse a schedule descriptor
    pub fn parse(descriptor: &ScheduleDescriptor) -> Result<Self, ScheduleError> {
        match descriptor.kind {
            ScheduleType::Cron => {
                let tz = parse_timezone(&descriptor.timezone)?;
                Ok(Trigger::Cron(CronTrigger::new(descriptor.expression.trim(), tz)?))
            }
            ScheduleType::Interval => {
                // Still validated so a bad name is reported rather than ignored.
                parse_timezone(&descriptor.timezone)?;
                Ok(Trigger::Interval(IntervalTrigger::parse(&descriptor.expression)?))
            }
        }
    }

    /// Fixed period, for interval triggers
    pub fn period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval(i) => Some(i.period()),
            Trigger::Cron(_) => None,
        }
    }

    /// Timezone cron fields are evaluated in (UTC for intervals)
    pub fn timezone(&self) -> Tz {
        match self {
            Trigger::Cron(c) => c.timezone,
            Trigger::Interval(_) => Tz::UTC,
        }
    }

    /// Next fire time.
    ///
    /// `after` is the previous scheduled fire, `None` on registration. An
    /// interval's first fire is one period after `now`; later fires are one
    /// period after the previous scheduled fire. Cron fires follow `after`
    /// (or `now`).
    pub fn next_fire(
        &self,
        after: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval(i) => after.unwrap_or(now).checked_add_signed(i.period),
            Trigger::Cron(c) => c.next_after(after.unwrap_or(now)),
        }
    }

    /// Resolve a due slot that may be several periods old.
    ///
    /// The latest slot at or before `now` fires; the ones before it are
    /// counted as missed. Interval catch-up is arithmetic so the anchor grid
    /// is kept however far behind the loop is.
    pub fn catch_up(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> CatchUp {
        if now <= due {
            return CatchUp {
                fire_at: due,
                missed: 0,
                next: self.next_fire(Some(due), now),
            };
        }

        match self {
            Trigger::Interval(i) => {
                let period_ms = i.period.num_milliseconds().max(1);
                let behind = (now - due).num_milliseconds() / period_ms;
                let fire_at = behind
                    .checked_mul(period_ms)
                    .and_then(|ms| due.checked_add_signed(Duration::milliseconds(ms)))
                    .unwrap_or(due);
                CatchUp {
                    fire_at,
                    missed: behind.max(0) as u64,
                    next: fire_at.checked_add_signed(i.period),
                }
            }
            Trigger::Cron(c) => {
                let mut fire_at = due;
                let mut missed = 0;
                loop {
                    match c.next_after(fire_at) {
                        Some(n) if n <= now && missed < MAX_CATCH_UP_SCAN => {
                            fire_at = n;
                            missed += 1;
                        }
                        Some(n) if n > now => {
                            return CatchUp {
                                fire_at,
                                missed,
                                next: Some(n),
                            }
                        }
                        // Scan cap hit, or the schedule ran past the horizon.
                        _ => {
                            return CatchUp {
                                fire_at,
                                missed,
                                next: c.next_after(now),
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Parse an IANA timezone name; empty means UTC
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    let name = name.trim();
    if name.is_empty() {
        return Ok(Tz::UTC);
    }
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::UnknownTimezone(name.to_string()))
}
