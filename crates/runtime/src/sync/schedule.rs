// Cron schedule evaluation for the sync scheduler.
//
// One shared scheduler ticks on a fixed interval; a source is due when its
// expression has an occurrence inside the window since the previous tick.
// This keeps minute-granularity cron correct regardless of tick phase.

use chrono::{DateTime, Utc};
use croner::Cron;

use crate::error::RuntimeError;

pub fn validate(expr: &str) -> Result<(), RuntimeError> {
    parse(expr).map(|_| ())
}

/// First occurrence strictly after `after`, if any.
pub fn next_occurrence(
    expr: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RuntimeError> {
    let cron = parse(expr)?;
    Ok(cron.find_next_occurrence(&after, false).ok())
}

/// Whether `expr` has an occurrence in `(window_start, now]`. An invalid
/// expression is never due (creation-time validation rejects it anyway).
pub fn is_due(expr: &str, window_start: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match next_occurrence(expr, window_start) {
        Ok(Some(next)) => next <= now,
        _ => false,
    }
}

fn parse(expr: &str) -> Result<Cron, RuntimeError> {
    Cron::new(expr)
        .parse()
        .map_err(|error| RuntimeError::Validation(format!("invalid cron expression `{expr}`: {error}")))
}
