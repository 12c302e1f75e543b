use crate::model::{Cents, Ms, RateCard, Span};

use super::EngineError;

pub const MS_PER_DAY: Ms = 86_400_000;

/// Billable whole days for an interval: the ceiling of its duration in days,
/// computed on the calendar instants themselves. `[d, d)` is zero days.
pub fn rental_days(span: &Span) -> Result<i64, EngineError> {
    if span.end < span.start {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    Ok((span.duration_ms() + MS_PER_DAY - 1) / MS_PER_DAY)
}

/// Total price for renting at `rates` over `span`.
///
/// Only the daily rate participates; weekly/monthly rates are carried on the
/// card but never applied to the amount due.
pub fn quote(rates: &RateCard, span: &Span) -> Result<Cents, EngineError> {
    Ok(rental_days(span)? * rates.daily_cents)
}
