use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

/// Committed bookings of one resource on one date, sorted by `span.start`.
/// Cancelled bookings stay in the list but never occupy their range.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub key: LedgerKey,
    pub bookings: Vec<Booking>,
}

pub type SharedLedger = Arc<RwLock<DayLedger>>;

impl DayLedger {
    pub fn new(key: LedgerKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    /// Insert maintaining sort order by `span.start`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Non-cancelled bookings whose range overlaps `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.occupies() && b.span.end > query.start)
    }

    pub fn occupied_count(&self) -> usize {
        self.bookings.iter().filter(|b| b.occupies()).count()
    }
}

/// Venue/arena directory, player directory and the partitioned booking ledger.
pub struct InMemoryStore {
    venues: DashMap<Ulid, Venue>,
    arenas: DashMap<Ulid, Arena>,
    /// Venue → arena ids, in creation order.
    venue_arenas: DashMap<Ulid, Vec<Ulid>>,
    players: DashMap<Ulid, Player>,
    /// Mobile → player id.
    mobiles: DashMap<String, Ulid>,
    ledgers: DashMap<LedgerKey, SharedLedger>,
    /// Booking id → owning partition.
    booking_index: DashMap<Ulid, LedgerKey>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            venues: DashMap::new(),
            arenas: DashMap::new(),
            venue_arenas: DashMap::new(),
            players: DashMap::new(),
            mobiles: DashMap::new(),
            ledgers: DashMap::new(),
            booking_index: DashMap::new(),
        }
    }

    // ── Directory ────────────────────────────────────────────

    pub fn venue_count(&self) -> usize {
        self.venues.len()
    }

    pub fn contains_venue(&self, id: &Ulid) -> bool {
        self.venues.contains_key(id)
    }

    pub fn contains_arena(&self, id: &Ulid) -> bool {
        self.arenas.contains_key(id)
    }

    pub fn get_venue(&self, id: &Ulid) -> Option<Venue> {
        self.venues.get(id).map(|v| v.value().clone())
    }

    pub fn get_arena(&self, id: &Ulid) -> Option<Arena> {
        self.arenas.get(id).map(|a| a.value().clone())
    }

    pub fn venues(&self) -> Vec<Venue> {
        let mut out: Vec<Venue> = self.venues.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|v| v.id);
        out
    }

    pub fn arena_ids_of(&self, venue_id: &Ulid) -> Vec<Ulid> {
        self.venue_arenas
            .get(venue_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn arena_of_slot(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.arenas
            .iter()
            .find(|e| e.value().slots.iter().any(|s| s.id == *slot_id))
            .map(|e| *e.key())
    }

    pub fn arena_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.arenas.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Best-effort cumulative counters; not part of the booking commit.
    pub fn increment_booking_count(&self, venue_id: &Ulid, arena_id: Option<&Ulid>) {
        if let Some(mut venue) = self.venues.get_mut(venue_id) {
            venue.booking_count += 1;
        }
        if let Some(id) = arena_id
            && let Some(mut arena) = self.arenas.get_mut(id)
        {
            arena.booking_count += 1;
        }
    }

    pub fn find_player_by_mobile(&self, mobile: &str) -> Option<Player> {
        let id = *self.mobiles.get(mobile)?.value();
        self.get_player(&id)
    }

    pub fn get_player(&self, id: &Ulid) -> Option<Player> {
        self.players.get(id).map(|p| p.value().clone())
    }

    pub fn players(&self) -> Vec<Player> {
        let mut out: Vec<Player> = self.players.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.id);
        out
    }

    // ── Ledger ───────────────────────────────────────────────

    pub fn get_ledger(&self, key: &LedgerKey) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    pub fn ledger_or_insert(&self, key: LedgerKey) -> SharedLedger {
        self.ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key))))
            .value()
            .clone()
    }

    pub fn ledger_keys(&self) -> Vec<LedgerKey> {
        let mut keys: Vec<LedgerKey> = self.ledgers.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    pub fn ledger_for_booking(&self, booking_id: &Ulid) -> Option<LedgerKey> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a directory event. Booking events are ignored here; they need
    /// the partition's write guard and go through `apply_ledger_event`.
    pub fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::VenueCreated {
                id,
                name,
                base_price_per_hour,
            } => {
                self.venues.insert(
                    *id,
                    Venue {
                        id: *id,
                        name: name.clone(),
                        base_price_per_hour: *base_price_per_hour,
                        is_active: true,
                        booking_count: 0,
                    },
                );
            }
            Event::VenueDeactivated { id } => {
                if let Some(mut venue) = self.venues.get_mut(id) {
                    venue.is_active = false;
                }
            }
            Event::ArenaCreated {
                id,
                venue_id,
                name,
                sport,
                capacity,
                base_price_per_hour,
            } => {
                self.arenas.insert(
                    *id,
                    Arena {
                        id: *id,
                        venue_id: *venue_id,
                        name: name.clone(),
                        sport: sport.clone(),
                        capacity: *capacity,
                        base_price_per_hour: *base_price_per_hour,
                        is_active: true,
                        booking_count: 0,
                        slots: Vec::new(),
                    },
                );
                self.venue_arenas.entry(*venue_id).or_default().push(*id);
            }
            Event::ArenaDeactivated { id } => {
                if let Some(mut arena) = self.arenas.get_mut(id) {
                    arena.is_active = false;
                }
            }
            Event::SlotAdded {
                id,
                arena_id,
                day_of_week,
                span,
                price_per_hour,
                capacity,
            } => {
                if let Some(mut arena) = self.arenas.get_mut(arena_id) {
                    arena.insert_slot(Slot {
                        id: *id,
                        day_of_week: *day_of_week,
                        span: *span,
                        price_per_hour: *price_per_hour,
                        capacity: *capacity,
                    });
                }
            }
            Event::SlotRemoved { id, arena_id } => {
                if let Some(mut arena) = self.arenas.get_mut(arena_id) {
                    arena.remove_slot(*id);
                }
            }
            Event::PlayerRegistered { id, mobile, name } => {
                self.players.insert(
                    *id,
                    Player {
                        id: *id,
                        mobile: mobile.clone(),
                        name: name.clone(),
                    },
                );
                self.mobiles.insert(mobile.clone(), *id);
            }
            Event::BookingCreated { .. }
            | Event::BookingConfirmed { .. }
            | Event::BookingCompleted { .. }
            | Event::BookingCancelled { .. } => {}
        }
    }

    /// Apply a booking event to its partition (caller holds the write guard).
    pub fn apply_ledger_event(&self, ledger: &mut DayLedger, event: &Event) {
        match event {
            Event::BookingCreated {
                id,
                venue_id,
                arena_id,
                player_id,
                booking_date,
                span,
                total_amount,
                sport,
                notes,
                at,
            } => {
                ledger.insert_booking(Booking {
                    id: *id,
                    venue_id: *venue_id,
                    arena_id: *arena_id,
                    player_id: *player_id,
                    booking_date: *booking_date,
                    span: *span,
                    total_amount: *total_amount,
                    status: BookingStatus::Pending,
                    payment_status: PaymentStatus::Pending,
                    sport: sport.clone(),
                    notes: notes.clone(),
                    created_at: *at,
                    updated_at: *at,
                });
                self.booking_index.insert(*id, ledger.key);
            }
            Event::BookingConfirmed { id, at } => {
                if let Some(b) = ledger.get_mut(*id) {
                    b.status = BookingStatus::Confirmed;
                    b.payment_status = PaymentStatus::Paid;
                    b.updated_at = *at;
                }
            }
            Event::BookingCompleted { id, at } => {
                if let Some(b) = ledger.get_mut(*id) {
                    b.status = BookingStatus::Completed;
                    b.updated_at = *at;
                }
            }
            Event::BookingCancelled { id, at } => {
                if let Some(b) = ledger.get_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                    if b.payment_status == PaymentStatus::Paid {
                        b.payment_status = PaymentStatus::Refunded;
                    }
                    b.updated_at = *at;
                }
            }
            _ => {}
        }
    }
}

/// The partition a booking event belongs to, if it can be resolved.
pub fn event_ledger_key(store: &InMemoryStore, event: &Event) -> Option<LedgerKey> {
    match event {
        Event::BookingCreated {
            venue_id,
            arena_id,
            booking_date,
            ..
        } => Some(LedgerKey {
            resource: ResourceKey::for_booking(*venue_id, *arena_id),
            date: *booking_date,
        }),
        Event::BookingConfirmed { id, .. }
        | Event::BookingCompleted { id, .. }
        | Event::BookingCancelled { id, .. } => store.ledger_for_booking(id),
        _ => None,
    }
}
