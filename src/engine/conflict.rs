use chrono::{NaiveDate, Timelike, Utc};
use rust_decimal::Decimal;

use crate::limits::*;
use crate::model::*;

use super::store::DayLedger;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Calendar "today" for past-date checks and the sweeper (UTC).
pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(crate) fn minute_of_day_now() -> Minute {
    let now = Utc::now();
    (now.hour() * 60 + now.minute()) as Minute
}

/// Strict `YYYY-MM-DD`.
pub(crate) fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    let s = s.trim();
    let b = s.as_bytes();
    if b.len() != 10 || b[4] != b'-' || b[7] != b'-' {
        return Err(EngineError::invalid(format!("booking_date {s:?} is not YYYY-MM-DD")));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::invalid(format!("booking_date {s:?} is not a calendar date")))
}

/// Strict 24-hour `HH:MM`, hour 0–23, minute 0–59.
pub(crate) fn parse_hhmm(s: &str) -> Result<Minute, EngineError> {
    let s = s.trim();
    let bad = || EngineError::invalid(format!("time {s:?} is not HH:MM"));
    let b = s.as_bytes();
    if b.len() != 5 || b[2] != b':' || !b.iter().enumerate().all(|(i, c)| i == 2 || c.is_ascii_digit()) {
        return Err(bad());
    }
    let hour = (b[0] - b'0') as Minute * 10 + (b[1] - b'0') as Minute;
    let minute = (b[3] - b'0') as Minute * 10 + (b[4] - b'0') as Minute;
    if hour > 23 || minute > 59 {
        return Err(bad());
    }
    Ok(hour * 60 + minute)
}

/// Parse a booking range. End must be after start and the range at least
/// `min_minutes` long.
pub(crate) fn parse_span(start: &str, end: &str, min_minutes: Minute) -> Result<Span, EngineError> {
    let start = parse_hhmm(start)?;
    let end = parse_hhmm(end)?;
    if end <= start {
        return Err(EngineError::invalid(format!(
            "end_time {} must be after start_time {}",
            format_hhmm(end),
            format_hhmm(start)
        )));
    }
    if end - start < min_minutes {
        return Err(EngineError::invalid(format!(
            "duration {} min is below the {min_minutes} min minimum",
            end - start
        )));
    }
    Ok(Span::new(start, end))
}

/// Canonical mobile: optional leading `+`, then digits. Spaces and dashes
/// are dropped.
pub(crate) fn normalize_mobile(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => ("+", rest),
        None => ("", trimmed),
    };
    let digits: String = rest.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if !digits.chars().all(|c| c.is_ascii_digit())
        || !(MIN_MOBILE_DIGITS..=MAX_MOBILE_DIGITS).contains(&digits.len())
    {
        return Err(EngineError::invalid(format!("{raw:?} is not a mobile number")));
    }
    Ok(format!("{plus}{digits}"))
}

pub(crate) fn validate_price(price: Decimal) -> Result<(), EngineError> {
    if price.is_sign_negative() {
        return Err(EngineError::invalid("price_per_hour must not be negative"));
    }
    if price > Decimal::from(MAX_PRICE_PER_HOUR) {
        return Err(EngineError::LimitExceeded("price_per_hour too large"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be blank")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Reject `span` if any non-cancelled booking in the partition overlaps it.
pub(crate) fn check_no_conflict(ledger: &DayLedger, span: &Span) -> Result<(), EngineError> {
    match ledger.overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhmm_accepts_valid() {
        assert_eq!(parse_hhmm("00:00").unwrap(), 0);
        assert_eq!(parse_hhmm("18:30").unwrap(), 18 * 60 + 30);
        assert_eq!(parse_hhmm("23:59").unwrap(), 23 * 60 + 59);
        assert_eq!(parse_hhmm(" 07:05 ").unwrap(), 7 * 60 + 5);
    }

    #[test]
    fn hhmm_rejects_malformed() {
        for bad in ["24:00", "12:60", "7:00", "0700", "ab:cd", "12:5", "", "12:300", "-1:00"] {
            assert!(
                matches!(parse_hhmm(bad), Err(EngineError::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn date_strict_format() {
        assert_eq!(
            parse_date("2025-09-24").unwrap(),
            NaiveDate::from_ymd_opt(2025, 9, 24).unwrap()
        );
        for bad in ["2025-9-24", "2025/09/24", "2025-02-30", "24-09-2025", "tomorrow"] {
            assert!(parse_date(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn span_boundaries() {
        // zero length
        assert!(matches!(parse_span("18:00", "18:00", 60), Err(EngineError::InvalidInput(_))));
        // inverted
        assert!(matches!(parse_span("18:00", "17:00", 60), Err(EngineError::InvalidInput(_))));
        // below minimum
        assert!(matches!(parse_span("18:00", "18:45", 60), Err(EngineError::InvalidInput(_))));
        // fractional hours above the minimum are accepted
        assert_eq!(parse_span("18:00", "19:30", 60).unwrap(), Span::new(1080, 1170));
        assert_eq!(parse_span("18:00", "19:00", 60).unwrap(), Span::new(1080, 1140));
    }

    #[test]
    fn mobile_normalization() {
        assert_eq!(normalize_mobile("+91 98123-45678").unwrap(), "+919812345678");
        assert_eq!(normalize_mobile("9812345678").unwrap(), "9812345678");
        assert!(normalize_mobile("12345").is_err());
        assert!(normalize_mobile("98123x5678").is_err());
        assert!(normalize_mobile("++9812345678").is_err());
    }

    #[test]
    fn price_validation() {
        assert!(validate_price(Decimal::ZERO).is_ok());
        assert!(validate_price(Decimal::new(-1, 0)).is_err());
        assert!(matches!(
            validate_price(Decimal::from(MAX_PRICE_PER_HOUR + 1)),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
