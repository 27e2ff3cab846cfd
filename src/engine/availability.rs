use crate::model::*;

use super::store::DayLedger;

// ── Availability Algorithm ────────────────────────────────────────

/// Free windows on one partition: `windows` (the weekday's slot windows, or
/// the whole day) minus every non-cancelled booking in `ledger`.
///
/// Windows are merged first so overlapping slots don't produce duplicate
/// gaps. With `min_duration`, shorter fragments are dropped.
pub fn free_windows(
    windows: &[Span],
    ledger: Option<&DayLedger>,
    min_duration: Option<Minute>,
) -> Vec<Span> {
    let mut base = windows.to_vec();
    base.sort_by_key(|s| s.start);
    let base = merge_overlapping(&base);

    let mut free = match ledger {
        Some(ledger) => {
            // Ledger is already sorted by start.
            let taken: Vec<Span> = ledger
                .bookings
                .iter()
                .filter(|b| b.occupies())
                .map(|b| b.span)
                .collect();
            subtract_intervals(&base, &merge_overlapping(&taken))
        }
        None => base,
    };

    if let Some(min) = min_duration {
        free.retain(|span| span.duration_minutes() >= min);
    }
    free
}

/// Windows that bound availability for `arena` on `day_of_week`. An arena
/// without slots that day is open all day.
pub fn arena_windows(arena: &Arena, day_of_week: u8) -> Vec<Span> {
    let spans: Vec<Span> = arena.slots_on(day_of_week).map(|s| s.span).collect();
    if spans.is_empty() {
        vec![Span::whole_day()]
    } else {
        spans
    }
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted by start and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}
