use chrono::NaiveDate;
use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{normalize_mobile, now_ms, parse_span, validate_name, validate_price};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Directory ────────────────────────────────────────────

    pub async fn create_venue(
        &self,
        id: Ulid,
        name: String,
        base_price_per_hour: Decimal,
    ) -> Result<(), EngineError> {
        validate_name(&name, "venue name")?;
        validate_price(base_price_per_hour)?;

        let _directory = self.lock_directory().await;
        if self.store.venue_count() >= MAX_VENUES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many venues"));
        }
        if self.store.contains_venue(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_directory(&Event::VenueCreated {
            id,
            name: name.trim().to_string(),
            base_price_per_hour,
        })
        .await
    }

    /// Inactive venues accept no new bookings; existing ones are kept.
    pub async fn deactivate_venue(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.lock_directory().await;
        let venue = self
            .store
            .get_venue(&id)
            .ok_or_else(|| EngineError::not_found("venue", id))?;
        if !venue.is_active {
            return Ok(());
        }
        self.persist_directory(&Event::VenueDeactivated { id }).await
    }

    pub async fn create_arena(
        &self,
        id: Ulid,
        venue_id: Ulid,
        name: String,
        sport: String,
        capacity: u32,
        base_price_per_hour: Decimal,
    ) -> Result<(), EngineError> {
        validate_name(&name, "arena name")?;
        if sport.trim().is_empty() {
            return Err(EngineError::invalid("sport must not be blank"));
        }
        if sport.len() > MAX_SPORT_LEN {
            return Err(EngineError::LimitExceeded("sport too long"));
        }
        if capacity == 0 {
            return Err(EngineError::invalid("capacity must be at least 1"));
        }
        validate_price(base_price_per_hour)?;

        let _directory = self.lock_directory().await;
        if !self.store.get_venue(&venue_id).is_some_and(|v| v.is_active) {
            return Err(EngineError::not_found("venue", venue_id));
        }
        if self.store.contains_arena(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.arena_ids_of(&venue_id).len() >= MAX_ARENAS_PER_VENUE {
            return Err(EngineError::LimitExceeded("too many arenas in venue"));
        }
        self.persist_directory(&Event::ArenaCreated {
            id,
            venue_id,
            name: name.trim().to_string(),
            sport: sport.trim().to_string(),
            capacity,
            base_price_per_hour,
        })
        .await
    }

    pub async fn deactivate_arena(&self, id: Ulid) -> Result<(), EngineError> {
        let _directory = self.lock_directory().await;
        let arena = self
            .store
            .get_arena(&id)
            .ok_or_else(|| EngineError::not_found("arena", id))?;
        if !arena.is_active {
            return Ok(());
        }
        self.persist_directory(&Event::ArenaDeactivated { id }).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add_slot(
        &self,
        id: Ulid,
        arena_id: Ulid,
        day_of_week: u8,
        start_time: &str,
        end_time: &str,
        price_per_hour: Decimal,
        capacity: u32,
    ) -> Result<(), EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::invalid(format!(
                "day_of_week {day_of_week} is outside 0 (Monday) to 6 (Sunday)"
            )));
        }
        let span = parse_span(start_time, end_time, 1)?;
        validate_price(price_per_hour)?;
        if capacity == 0 {
            return Err(EngineError::invalid("capacity must be at least 1"));
        }

        let _directory = self.lock_directory().await;
        let arena = self
            .store
            .get_arena(&arena_id)
            .ok_or_else(|| EngineError::not_found("arena", arena_id))?;
        if self.store.arena_of_slot(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if arena.slots.len() >= MAX_SLOTS_PER_ARENA {
            return Err(EngineError::LimitExceeded("too many slots on arena"));
        }
        self.persist_directory(&Event::SlotAdded {
            id,
            arena_id,
            day_of_week,
            span,
            price_per_hour,
            capacity,
        })
        .await
    }

    /// Returns the arena the slot belonged to.
    pub async fn remove_slot(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _directory = self.lock_directory().await;
        let arena_id = self
            .store
            .arena_of_slot(&id)
            .ok_or_else(|| EngineError::not_found("slot", id))?;
        self.persist_directory(&Event::SlotRemoved { id, arena_id }).await?;
        Ok(arena_id)
    }

    /// Look a player up by mobile, registering them when unknown. The stored
    /// name wins for known players. Returns `(player, created)`.
    pub async fn find_or_create_player(
        &self,
        mobile: &str,
        name: Option<String>,
    ) -> Result<(Player, bool), EngineError> {
        let mobile = normalize_mobile(mobile)?;
        if let Some(existing) = self.store.find_player_by_mobile(&mobile) {
            return Ok((existing, false));
        }
        let name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::invalid("name is required for a new player"))?;
        validate_name(&name, "player name")?;

        let _directory = self.lock_directory().await;
        if let Some(existing) = self.store.find_player_by_mobile(&mobile) {
            return Ok((existing, false));
        }
        let id = Ulid::new();
        self.persist_directory(&Event::PlayerRegistered {
            id,
            mobile: mobile.clone(),
            name: name.clone(),
        })
        .await?;
        Ok((Player { id, mobile, name }, true))
    }

    // ── Booking lifecycle ────────────────────────────────────

    async fn transition(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let mut ledger = self.lock_booking(id).await?;
        let from = ledger
            .get(id)
            .map(|b| b.status)
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { id, from, to });
        }

        let at = now_ms();
        let event = match to {
            BookingStatus::Confirmed => Event::BookingConfirmed { id, at },
            BookingStatus::Completed => Event::BookingCompleted { id, at },
            BookingStatus::Cancelled => Event::BookingCancelled { id, at },
            BookingStatus::Pending => return Err(EngineError::InvalidTransition { id, from, to }),
        };
        self.persist_ledger(&mut ledger, &event).await?;
        info!(booking = %id, %from, %to, "booking status changed");
        ledger
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    /// Payment received: pending → confirmed, payment pending → paid.
    pub async fn confirm_payment(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::Confirmed).await
    }

    pub async fn complete_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::Completed).await
    }

    /// Cancel a pending or confirmed booking, freeing its range. A paid
    /// booking is marked refunded.
    pub async fn cancel_booking(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(booking_id, BookingStatus::Cancelled).await
    }

    /// Confirmed bookings whose range has ended as of `(today, now_minute)`.
    pub fn collect_elapsed_bookings(&self, today: NaiveDate, now_minute: Minute) -> Vec<Ulid> {
        let mut elapsed = Vec::new();
        for key in self.store.ledger_keys() {
            if key.date > today {
                continue;
            }
            let Some(ledger) = self.store.get_ledger(&key) else { continue };
            // Busy partitions are picked up on the next sweep.
            let Ok(guard) = ledger.try_read() else { continue };
            elapsed.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed)
                    .filter(|b| key.date < today || b.span.end <= now_minute)
                    .map(|b| b.id),
            );
        }
        elapsed
    }

    // ── Compaction ───────────────────────────────────────────

    /// Events that recreate the current state, directory first.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        for venue in self.store.venues() {
            events.push(Event::VenueCreated {
                id: venue.id,
                name: venue.name.clone(),
                base_price_per_hour: venue.base_price_per_hour,
            });
            if !venue.is_active {
                events.push(Event::VenueDeactivated { id: venue.id });
            }
            for arena in self
                .store
                .arena_ids_of(&venue.id)
                .iter()
                .filter_map(|id| self.store.get_arena(id))
            {
                events.push(Event::ArenaCreated {
                    id: arena.id,
                    venue_id: arena.venue_id,
                    name: arena.name.clone(),
                    sport: arena.sport.clone(),
                    capacity: arena.capacity,
                    base_price_per_hour: arena.base_price_per_hour,
                });
                events.extend(arena.slots.iter().map(|slot| Event::SlotAdded {
                    id: slot.id,
                    arena_id: arena.id,
                    day_of_week: slot.day_of_week,
                    span: slot.span,
                    price_per_hour: slot.price_per_hour,
                    capacity: slot.capacity,
                }));
                if !arena.is_active {
                    events.push(Event::ArenaDeactivated { id: arena.id });
                }
            }
        }

        for player in self.store.players() {
            events.push(Event::PlayerRegistered {
                id: player.id,
                mobile: player.mobile,
                name: player.name,
            });
        }

        for key in self.store.ledger_keys() {
            let Some(ledger) = self.store.get_ledger(&key) else { continue };
            let guard = ledger.read().await;
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    venue_id: b.venue_id,
                    arena_id: b.arena_id,
                    player_id: b.player_id,
                    booking_date: b.booking_date,
                    span: b.span,
                    total_amount: b.total_amount,
                    sport: b.sport.clone(),
                    notes: b.notes.clone(),
                    at: b.created_at,
                });
                let at = b.updated_at;
                let paid = matches!(b.payment_status, PaymentStatus::Paid | PaymentStatus::Refunded);
                if paid {
                    events.push(Event::BookingConfirmed { id: b.id, at });
                }
                match b.status {
                    BookingStatus::Completed => events.push(Event::BookingCompleted { id: b.id, at }),
                    BookingStatus::Cancelled => events.push(Event::BookingCancelled { id: b.id, at }),
                    BookingStatus::Pending | BookingStatus::Confirmed => {}
                }
            }
        }

        events
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let events = self.snapshot_events().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("WAL compaction: {e}")))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
