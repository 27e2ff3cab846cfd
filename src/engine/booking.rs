//! The booking conflict resolver.
//!
//! Everything that can be rejected without shared state is rejected before
//! the partition lock is taken. The critical section is the overlap check
//! plus the WAL append; payment links and notifications run after the lock
//! is released and can only degrade the receipt, never undo the booking.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};
use ulid::Ulid;

use crate::dispatch::DispatchError;
use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_TOTAL, DISPATCH_FAILURES_TOTAL};

use super::conflict::{check_no_conflict, normalize_mobile, now_ms, parse_date, parse_span, today};
use super::pricing::quote;
use super::{Engine, EngineError};

/// Validated request, ready for the critical section.
struct Resolved {
    venue: Venue,
    arena: Option<Arena>,
    key: LedgerKey,
    span: Span,
    total_amount: rust_decimal::Decimal,
    mobile: String,
    /// Known player, or the name to register a new one under.
    player: Result<Player, String>,
    sport: Option<String>,
    notes: Option<String>,
}

fn optional_text(value: Option<String>, max: usize, what: &'static str) -> Result<Option<String>, EngineError> {
    match value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
        Some(v) if v.len() > max => Err(EngineError::LimitExceeded(what)),
        other => Ok(other),
    }
}

async fn bounded<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, DispatchError>>,
) -> Result<T, DispatchError> {
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(DispatchError::TimedOut(limit.as_millis())))
}

impl Engine {
    /// Reserve `[start_time, end_time)` on the requested arena (or, without
    /// an arena, the whole venue) for the given date.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let result = self.resolve_and_commit(request).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.label(),
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    fn resolve(&self, request: BookingRequest) -> Result<Resolved, EngineError> {
        let venue = self
            .store
            .get_venue(&request.venue_id)
            .filter(|v| v.is_active)
            .ok_or_else(|| EngineError::not_found("venue", request.venue_id))?;

        let arena = match request.arena_id {
            Some(arena_id) => Some(
                self.store
                    .get_arena(&arena_id)
                    .filter(|a| a.is_active && a.venue_id == venue.id)
                    .ok_or_else(|| EngineError::not_found("arena", arena_id))?,
            ),
            None => None,
        };

        let date = parse_date(&request.booking_date)?;
        if self.policy.reject_past_dates && date < today() {
            return Err(EngineError::invalid(format!("booking_date {date} is in the past")));
        }
        let span = parse_span(
            &request.start_time,
            &request.end_time,
            self.policy.min_duration_minutes,
        )?;

        let sport = optional_text(request.sport, MAX_SPORT_LEN, "sport too long")?;
        let notes = optional_text(request.notes, MAX_NOTES_LEN, "notes too long")?;

        let mobile = normalize_mobile(&request.player_mobile)?;
        let player = match self.store.find_player_by_mobile(&mobile) {
            Some(existing) => Ok(existing),
            None => {
                let name = optional_text(request.player_name, MAX_NAME_LEN, "player name too long")?
                    .ok_or_else(|| EngineError::invalid("player_name is required for a new player"))?;
                Err(name)
            }
        };

        let total_amount = quote(&venue, arena.as_ref(), date, &span);
        let key = LedgerKey {
            resource: ResourceKey::for_booking(venue.id, arena.as_ref().map(|a| a.id)),
            date,
        };

        Ok(Resolved {
            venue,
            arena,
            key,
            span,
            total_amount,
            mobile,
            player,
            sport,
            notes,
        })
    }

    async fn resolve_and_commit(&self, request: BookingRequest) -> Result<BookingReceipt, EngineError> {
        let r = self.resolve(request)?;
        let arena_id = r.arena.as_ref().map(|a| a.id);

        let mut ledger = self.lock_partition(r.key).await?;
        if ledger.occupied_count() >= MAX_BOOKINGS_PER_PARTITION {
            return Err(EngineError::LimitExceeded("too many bookings on this date"));
        }
        if let Err(e) = check_no_conflict(&ledger, &r.span) {
            info!(partition = %r.key, span = %r.span, "booking rejected: {e}");
            return Err(e);
        }

        // Held until the booking commits so the mobile is registered once.
        let mut directory = None;
        let (player, registration) = match r.player {
            Ok(player) => (player, None),
            Err(name) => {
                directory = Some(self.directory_lock.lock().await);
                // Another partition may have registered this mobile meanwhile.
                match self.store.find_player_by_mobile(&r.mobile) {
                    Some(existing) => (existing, None),
                    None => {
                        let player = Player {
                            id: Ulid::new(),
                            mobile: r.mobile.clone(),
                            name,
                        };
                        let event = Event::PlayerRegistered {
                            id: player.id,
                            mobile: player.mobile.clone(),
                            name: player.name.clone(),
                        };
                        (player, Some(event))
                    }
                }
            }
        };
        let player_created = registration.is_some();

        let id = Ulid::new();
        let event = Event::BookingCreated {
            id,
            venue_id: r.venue.id,
            arena_id,
            player_id: player.id,
            booking_date: r.key.date,
            span: r.span,
            total_amount: r.total_amount,
            sport: r.sport,
            notes: r.notes,
            at: now_ms(),
        };
        self.persist_ledger_with(&mut ledger, registration.as_ref(), &event)
            .await?;
        drop(directory);
        let booking = ledger
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        drop(ledger);

        info!(
            booking = %id,
            partition = %r.key,
            span = %r.span,
            amount = %booking.total_amount,
            player_created,
            "booking created"
        );

        self.store.increment_booking_count(&r.venue.id, arena_id.as_ref());

        let limit = self.policy.dispatch_timeout;
        let (link, notified) = tokio::join!(
            bounded(limit, self.dispatch.payments.create_payment_link(&booking)),
            bounded(limit, self.dispatch.notifier.notify_player(&player, &booking)),
        );

        let mut warnings = Vec::new();
        let payment_link = match link {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(booking = %id, error = %e, "payment link failed");
                metrics::counter!(DISPATCH_FAILURES_TOTAL, "kind" => "payment_link").increment(1);
                warnings.push(format!("payment link unavailable: {e}"));
                None
            }
        };
        let notified = match notified {
            Ok(()) => true,
            Err(e) => {
                warn!(booking = %id, error = %e, "player notification failed");
                metrics::counter!(DISPATCH_FAILURES_TOTAL, "kind" => "notify").increment(1);
                warnings.push(format!("player not notified: {e}"));
                false
            }
        };

        Ok(BookingReceipt {
            booking,
            player,
            player_created,
            payment_link,
            notified,
            warnings,
        })
    }
}
