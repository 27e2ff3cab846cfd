use chrono::{Datelike, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::model::*;

/// 0 = Monday … 6 = Sunday, matching `Slot::day_of_week`.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_monday() as u8
}

/// Hourly price for `span` on `date`: the first slot of that weekday that
/// fully contains the range, else the base price.
pub fn hourly_rate(base_price: Decimal, slots: &[Slot], date: NaiveDate, span: &Span) -> Decimal {
    let day = day_of_week(date);
    slots
        .iter()
        .find(|s| s.day_of_week == day && s.span.contains_span(span))
        .map_or(base_price, |s| s.price_per_hour)
}

/// `price_per_hour × minutes / 60`, to two decimals.
pub fn total_amount(price_per_hour: Decimal, span: &Span) -> Decimal {
    (price_per_hour * Decimal::from(span.duration_minutes()) / Decimal::from(60))
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Price a booking against an arena (or, with `None`, the venue's base rate).
pub fn quote(venue: &Venue, arena: Option<&Arena>, date: NaiveDate, span: &Span) -> Decimal {
    let rate = match arena {
        Some(a) => hourly_rate(a.base_price_per_hour, &a.slots, date, span),
        None => venue.base_price_per_hour,
    };
    total_amount(rate, span)
}
