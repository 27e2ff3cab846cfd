use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

/// Minutes since midnight, `0..=1440`.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Half-open time-of-day range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn whole_day() -> Self {
        Self::new(0, MINUTES_PER_DAY)
    }

    pub fn duration_minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

/// Render minutes since midnight as `HH:MM`. 1440 renders as `24:00`.
pub fn format_hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// The exclusive unit a booking occupies: an arena, or a whole venue for
/// legacy venue-level bookings. The two never conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKey {
    Arena(Ulid),
    Venue(Ulid),
}

impl ResourceKey {
    pub fn for_booking(venue_id: Ulid, arena_id: Option<Ulid>) -> Self {
        match arena_id {
            Some(a) => ResourceKey::Arena(a),
            None => ResourceKey::Venue(venue_id),
        }
    }

    pub fn id(&self) -> Ulid {
        match self {
            ResourceKey::Arena(id) | ResourceKey::Venue(id) => *id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Arena(id) => write!(f, "arena:{id}"),
            ResourceKey::Venue(id) => write!(f, "venue:{id}"),
        }
    }
}

/// One ledger partition: a resource on a calendar date. This is the lock unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerKey {
    pub resource: ResourceKey,
    pub date: NaiveDate,
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.resource, self.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    /// `pending → confirmed → completed`, and `pending|confirmed → cancelled`.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        matches!(
            (self, next),
            (BookingStatus::Pending, BookingStatus::Confirmed)
                | (BookingStatus::Confirmed, BookingStatus::Completed)
                | (BookingStatus::Pending, BookingStatus::Cancelled)
                | (BookingStatus::Confirmed, BookingStatus::Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

/// Recurring weekly pricing window on an arena. Advisory only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    /// 0 = Monday … 6 = Sunday.
    pub day_of_week: u8,
    pub span: Span,
    pub price_per_hour: Decimal,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Venue {
    pub id: Ulid,
    pub name: String,
    pub base_price_per_hour: Decimal,
    pub is_active: bool,
    pub booking_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub name: String,
    pub sport: String,
    /// Informational only; an arena is a single exclusive resource.
    pub capacity: u32,
    pub base_price_per_hour: Decimal,
    pub is_active: bool,
    pub booking_count: u64,
    /// Sorted by `(day_of_week, span.start)`.
    pub slots: Vec<Slot>,
}

impl Arena {
    pub fn slots_on(&self, day_of_week: u8) -> impl Iterator<Item = &Slot> {
        self.slots.iter().filter(move |s| s.day_of_week == day_of_week)
    }

    pub fn insert_slot(&mut self, slot: Slot) {
        let pos = self
            .slots
            .partition_point(|s| (s.day_of_week, s.span.start) <= (slot.day_of_week, slot.span.start));
        self.slots.insert(pos, slot);
    }

    pub fn remove_slot(&mut self, id: Ulid) -> Option<Slot> {
        let pos = self.slots.iter().position(|s| s.id == id)?;
        Some(self.slots.remove(pos))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: Ulid,
    pub mobile: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub id: Ulid,
    pub venue_id: Ulid,
    pub arena_id: Option<Ulid>,
    pub player_id: Ulid,
    pub booking_date: NaiveDate,
    pub span: Span,
    pub total_amount: Decimal,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub sport: Option<String>,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::for_booking(self.venue_id, self.arena_id)
    }

    pub fn ledger_key(&self) -> LedgerKey {
        LedgerKey {
            resource: self.resource_key(),
            date: self.booking_date,
        }
    }

    /// Cancelled bookings no longer occupy their range.
    pub fn occupies(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }

    /// Duration in hours, fractional for non-whole-hour ranges.
    pub fn duration_hours(&self) -> Decimal {
        Decimal::from(self.span.duration_minutes()) / Decimal::from(60)
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VenueCreated {
        id: Ulid,
        name: String,
        base_price_per_hour: Decimal,
    },
    VenueDeactivated {
        id: Ulid,
    },
    ArenaCreated {
        id: Ulid,
        venue_id: Ulid,
        name: String,
        sport: String,
        capacity: u32,
        base_price_per_hour: Decimal,
    },
    ArenaDeactivated {
        id: Ulid,
    },
    SlotAdded {
        id: Ulid,
        arena_id: Ulid,
        day_of_week: u8,
        span: Span,
        price_per_hour: Decimal,
        capacity: u32,
    },
    SlotRemoved {
        id: Ulid,
        arena_id: Ulid,
    },
    PlayerRegistered {
        id: Ulid,
        mobile: String,
        name: String,
    },
    BookingCreated {
        id: Ulid,
        venue_id: Ulid,
        arena_id: Option<Ulid>,
        player_id: Ulid,
        booking_date: NaiveDate,
        span: Span,
        total_amount: Decimal,
        sport: Option<String>,
        notes: Option<String>,
        at: Ms,
    },
    /// Payment received: pending → confirmed, payment → paid.
    BookingConfirmed {
        id: Ulid,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        at: Ms,
    },
    /// Paid bookings are refunded on cancellation.
    BookingCancelled {
        id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::VenueCreated { .. } => "venue_created",
            Event::VenueDeactivated { .. } => "venue_deactivated",
            Event::ArenaCreated { .. } => "arena_created",
            Event::ArenaDeactivated { .. } => "arena_deactivated",
            Event::SlotAdded { .. } => "slot_added",
            Event::SlotRemoved { .. } => "slot_removed",
            Event::PlayerRegistered { .. } => "player_registered",
            Event::BookingCreated { .. } => "booking_created",
            Event::BookingConfirmed { .. } => "booking_confirmed",
            Event::BookingCompleted { .. } => "booking_completed",
            Event::BookingCancelled { .. } => "booking_cancelled",
        }
    }
}

// ── Request / result types ───────────────────────────────────────

/// A reservation request as received from a client. Date and times are kept
/// as raw strings; the resolver validates them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingRequest {
    pub venue_id: Ulid,
    pub arena_id: Option<Ulid>,
    pub player_mobile: String,
    pub player_name: Option<String>,
    pub booking_date: String,
    pub start_time: String,
    pub end_time: String,
    pub sport: Option<String>,
    pub notes: Option<String>,
}

/// Result of a committed booking. Warnings record side effects that failed
/// after the commit; the booking stands regardless.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub booking: Booking,
    pub player: Player,
    pub player_created: bool,
    pub payment_link: Option<String>,
    pub notified: bool,
    pub warnings: Vec<String>,
}

impl BookingReceipt {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}
