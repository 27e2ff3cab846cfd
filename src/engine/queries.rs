use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::{arena_windows, free_windows};
use super::conflict::normalize_mobile;
use super::pricing::day_of_week;
use super::{Engine, EngineError};

impl Engine {
    pub fn list_venues(&self) -> Vec<Venue> {
        self.store.venues()
    }

    /// Arenas of one venue in creation order, or every arena.
    pub fn list_arenas(&self, venue_id: Option<Ulid>) -> Result<Vec<Arena>, EngineError> {
        let ids = match venue_id {
            Some(vid) => {
                if !self.store.contains_venue(&vid) {
                    return Err(EngineError::not_found("venue", vid));
                }
                self.store.arena_ids_of(&vid)
            }
            None => self.store.arena_ids(),
        };
        Ok(ids.iter().filter_map(|id| self.store.get_arena(id)).collect())
    }

    pub fn list_slots(&self, arena_id: Ulid) -> Result<Vec<Slot>, EngineError> {
        self.store
            .get_arena(&arena_id)
            .map(|a| a.slots)
            .ok_or_else(|| EngineError::not_found("arena", arena_id))
    }

    pub fn get_player(&self, mobile: &str) -> Result<Player, EngineError> {
        let mobile = normalize_mobile(mobile)?;
        self.store
            .find_player_by_mobile(&mobile)
            .ok_or_else(|| EngineError::NotFound(format!("player {mobile}")))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let ledger = self
            .store
            .ledger_for_booking(&id)
            .and_then(|key| self.store.get_ledger(&key))
            .ok_or_else(|| EngineError::not_found("booking", id))?;
        let guard = ledger.read().await;
        guard
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("booking", id))
    }

    fn ensure_resource(&self, resource: ResourceKey) -> Result<(), EngineError> {
        let known = match resource {
            ResourceKey::Arena(id) => self.store.contains_arena(&id),
            ResourceKey::Venue(id) => self.store.contains_venue(&id),
        };
        if known {
            Ok(())
        } else {
            Err(EngineError::NotFound(resource.to_string()))
        }
    }

    /// Bookings on `resource`, optionally for one date, ordered by date then
    /// start time. Cancelled bookings are included.
    pub async fn list_bookings(
        &self,
        resource: ResourceKey,
        date: Option<NaiveDate>,
    ) -> Result<Vec<Booking>, EngineError> {
        self.ensure_resource(resource)?;
        let mut out = Vec::new();
        for key in self.store.ledger_keys() {
            if key.resource != resource || date.is_some_and(|d| d != key.date) {
                continue;
            }
            if let Some(ledger) = self.store.get_ledger(&key) {
                out.extend(ledger.read().await.bookings.iter().cloned());
            }
        }
        Ok(out)
    }

    /// Free windows on `resource` for `date`: the weekday's slot windows (or
    /// the whole day) minus non-cancelled bookings.
    pub async fn availability(
        &self,
        resource: ResourceKey,
        date: NaiveDate,
        min_duration: Option<Minute>,
    ) -> Result<Vec<Span>, EngineError> {
        let windows = match resource {
            ResourceKey::Arena(id) => {
                let arena = self
                    .store
                    .get_arena(&id)
                    .ok_or_else(|| EngineError::not_found("arena", id))?;
                arena_windows(&arena, day_of_week(date))
            }
            ResourceKey::Venue(_) => {
                self.ensure_resource(resource)?;
                vec![Span::whole_day()]
            }
        };

        let key = LedgerKey { resource, date };
        match self.store.get_ledger(&key) {
            Some(ledger) => {
                let guard = ledger.read().await;
                Ok(free_windows(&windows, Some(&guard), min_duration))
            }
            None => Ok(free_windows(&windows, None, min_duration)),
        }
    }
}
