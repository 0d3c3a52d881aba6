//! Pure next-run computation. No state, no I/O.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::error::{Result, SchedulerError};
use crate::types::Trigger;

/// Compute the next execution time for `trigger` strictly after `after`.
///
/// Returns `Ok(None)` when the trigger is exhausted (an `At` instant that has
/// already passed). Only cron evaluation can fail; `At` and `Every` never
/// error once a job holding them has been validated at creation time.
pub fn next_run(trigger: &Trigger, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    match trigger {
        Trigger::Cron {
            expression,
            timezone,
        } => {
            let tz = parse_timezone(timezone.as_deref())?;
            let schedule = parse_cron(expression)?;
            Ok(schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|dt| dt.with_timezone(&Utc)))
        }

        Trigger::At { at } => Ok((*at > after).then_some(*at)),

        Trigger::Every { every_secs, anchor } => {
            if *every_secs == 0 {
                return Err(SchedulerError::Schedule(
                    "interval must be at least one second".to_string(),
                ));
            }
            // Stay on the anchor grid: the smallest anchor + k·interval that
            // lies strictly after `after`, so missed wakeups never drift the
            // cadence.
            if after < *anchor {
                return Ok(Some(*anchor));
            }
            let every = *every_secs as i64;
            let elapsed = (after - *anchor).num_seconds();
            let k = elapsed / every + 1;
            Ok(Some(*anchor + Duration::seconds(k * every)))
        }
    }
}

/// Validate a trigger without caring about the computed instant. Used at
/// creation/update time so the store never persists an unevaluable trigger.
pub fn validate(trigger: &Trigger) -> Result<()> {
    next_run(trigger, Utc::now()).map(|_| ())
}

/// Parse a standard 5-field cron expression.
///
/// The `cron` crate expects a seconds field, so `MIN HOUR DOM MON DOW` is
/// normalised to `0 MIN HOUR DOM MON DOW` before parsing. Six- or seven-field
/// expressions are rejected — callers hand us validated 5-field input.
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let fields = expression.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::Schedule(format!(
            "cron expression must have 5 fields, got {fields}: '{expression}'"
        )));
    }
    cron::Schedule::from_str(&format!("0 {}", expression.trim()))
        .map_err(|e| SchedulerError::Schedule(format!("invalid cron expression '{expression}': {e}")))
}

fn parse_timezone(timezone: Option<&str>) -> Result<Tz> {
    match timezone {
        None => Ok(chrono_tz::UTC),
        Some(name) => Tz::from_str(name)
            .map_err(|_| SchedulerError::Schedule(format!("unknown timezone '{name}'"))),
    }
}
