use super::*;
use crate::dispatch::{DispatchError, Notifier, PaymentGateway};
use crate::limits::*;
use crate::wal::Wal;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio_test::{assert_err, assert_ok};

const H: Minute = 60;
/// A Monday.
const DATE: &str = "2099-01-05";

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2099, 1, 5).unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtside_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn test_policy() -> BookingPolicy {
    BookingPolicy {
        lock_timeout: Duration::from_millis(200),
        dispatch_timeout: Duration::from_millis(200),
        ..BookingPolicy::default()
    }
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), test_policy(), Dispatch::default()).unwrap()
}

async fn setup_arena(engine: &Engine, price: Decimal) -> (Ulid, Ulid) {
    let venue = Ulid::new();
    let arena = Ulid::new();
    engine
        .create_venue(venue, "Green Turf".into(), dec!(500))
        .await
        .unwrap();
    engine
        .create_arena(arena, venue, "Pitch A".into(), "Cricket".into(), 22, price)
        .await
        .unwrap();
    (venue, arena)
}

fn request(venue: Ulid, arena: Option<Ulid>, start: &str, end: &str) -> BookingRequest {
    BookingRequest {
        venue_id: venue,
        arena_id: arena,
        player_mobile: "9812345678".into(),
        player_name: Some("Asha".into()),
        booking_date: DATE.into(),
        start_time: start.into(),
        end_time: end.into(),
        ..BookingRequest::default()
    }
}

// ── Conflict resolution ──────────────────────────────────

#[tokio::test]
async fn booking_is_created_pending() {
    let engine = new_engine("created_pending.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let receipt = assert_ok!(engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await);
    let b = &receipt.booking;
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.payment_status, PaymentStatus::Pending);
    assert_eq!(b.total_amount, dec!(2400));
    assert_eq!(b.span, Span::new(18 * H, 20 * H));
    assert_eq!(b.booking_date, date());
    assert!(receipt.player_created);
    assert!(receipt.notified);
    assert!(!receipt.is_degraded());
    assert!(receipt.payment_link.unwrap().contains(&b.id.to_string()));

    assert_eq!(assert_ok!(engine.get_booking(b.id).await), *b);
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = new_engine("overlap_conflict.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let first = engine
        .create_booking(request(venue, Some(arena), "18:00", "20:00"))
        .await
        .unwrap();

    for (start, end) in [("19:00", "21:00"), ("17:00", "19:00"), ("18:30", "19:30"), ("17:00", "21:00")] {
        let err = assert_err!(engine.create_booking(request(venue, Some(arena), start, end)).await);
        match err {
            EngineError::Conflict(existing) => assert_eq!(existing, first.booking.id),
            other => panic!("expected conflict for {start}-{end}, got {other:?}"),
        }
    }

    let bookings = engine.list_bookings(ResourceKey::Arena(arena), Some(date())).await.unwrap();
    assert_eq!(bookings.len(), 1);
}

#[tokio::test]
async fn back_to_back_bookings_do_not_conflict() {
    let engine = new_engine("back_to_back.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    engine.create_booking(request(venue, Some(arena), "20:00", "21:00")).await.unwrap();
    engine.create_booking(request(venue, Some(arena), "16:00", "18:00")).await.unwrap();

    let free = engine.availability(ResourceKey::Arena(arena), date(), None).await.unwrap();
    assert_eq!(free, vec![Span::new(0, 16 * H), Span::new(21 * H, MINUTES_PER_DAY)]);
}

#[tokio::test]
async fn arenas_are_independent() {
    let engine = new_engine("arena_independence.wal");
    let (venue, a) = setup_arena(&engine, dec!(1200)).await;
    let b = Ulid::new();
    engine
        .create_arena(b, venue, "Pitch B".into(), "Cricket".into(), 22, dec!(800))
        .await
        .unwrap();

    engine.create_booking(request(venue, Some(a), "18:00", "20:00")).await.unwrap();
    let other = engine.create_booking(request(venue, Some(b), "18:00", "20:00")).await.unwrap();
    assert_eq!(other.booking.total_amount, dec!(1600));
}

#[tokio::test]
async fn different_dates_are_independent() {
    let engine = new_engine("date_independence.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    let mut next_day = request(venue, Some(arena), "18:00", "20:00");
    next_day.booking_date = "2099-01-06".into();
    assert_ok!(engine.create_booking(next_day).await);
}

#[tokio::test]
async fn cancellation_frees_the_range() {
    let engine = new_engine("cancel_frees.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let first = engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    let cancelled = engine.cancel_booking(first.booking.id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::Pending);

    let second = assert_ok!(engine.create_booking(request(venue, Some(arena), "19:00", "21:00")).await);
    assert_ne!(second.booking.id, first.booking.id);

    // The cancelled booking is still listed.
    let all = engine.list_bookings(ResourceKey::Arena(arena), None).await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_commit_exactly_once() {
    let engine = Arc::new(new_engine("concurrent_race.wal"));
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let n = 16;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        let mut req = request(venue, Some(arena), "18:00", "20:00");
        req.player_mobile = format!("98000000{i:02}");
        req.player_name = Some(format!("Player {i}"));
        handles.push(tokio::spawn(async move { eng.create_booking(req).await }));
    }

    let mut created = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => created += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(created, 1);
    assert_eq!(conflicts, n - 1);

    let bookings = engine.list_bookings(ResourceKey::Arena(arena), Some(date())).await.unwrap();
    assert_eq!(bookings.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_on_different_arenas_all_commit() {
    let engine = Arc::new(new_engine("concurrent_arenas.wal"));
    let venue = Ulid::new();
    engine.create_venue(venue, "Arena Park".into(), dec!(500)).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let arena = Ulid::new();
        engine
            .create_arena(arena, venue, format!("Court {i}"), "Badminton".into(), 4, dec!(400))
            .await
            .unwrap();
        let eng = engine.clone();
        let req = request(venue, Some(arena), "06:00", "07:00");
        handles.push(tokio::spawn(async move { eng.create_booking(req).await }));
    }
    for h in handles {
        assert_ok!(h.await.unwrap());
    }
    assert_eq!(engine.store.get_venue(&venue).unwrap().booking_count, 8);
}

// ── Validation ───────────────────────────────────────────

#[tokio::test]
async fn duration_boundaries() {
    let engine = new_engine("duration_bounds.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    for (start, end) in [("18:00", "18:00"), ("18:00", "17:00"), ("18:00", "18:59")] {
        let err = assert_err!(engine.create_booking(request(venue, Some(arena), start, end)).await);
        assert!(matches!(err, EngineError::InvalidInput(_)), "{start}-{end}: {err:?}");
    }

    let exact = assert_ok!(engine.create_booking(request(venue, Some(arena), "06:00", "07:00")).await);
    assert_eq!(exact.booking.total_amount, dec!(1200));

    let fractional = assert_ok!(engine.create_booking(request(venue, Some(arena), "08:00", "09:30")).await);
    assert_eq!(fractional.booking.total_amount, dec!(1800));
    assert_eq!(fractional.booking.duration_hours(), dec!(1.5));
}

#[tokio::test]
async fn malformed_date_and_time_rejected() {
    let engine = new_engine("malformed_input.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let mut bad_date = request(venue, Some(arena), "18:00", "20:00");
    bad_date.booking_date = "05/01/2099".into();
    assert!(matches!(engine.create_booking(bad_date).await, Err(EngineError::InvalidInput(_))));

    let bad_time = request(venue, Some(arena), "25:00", "26:00");
    assert!(matches!(engine.create_booking(bad_time).await, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn past_dates_rejected_by_default() {
    let engine = new_engine("past_dates.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let mut past = request(venue, Some(arena), "18:00", "20:00");
    past.booking_date = "2001-01-01".into();
    assert!(matches!(engine.create_booking(past).await, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn unknown_or_inactive_targets_not_found() {
    let engine = new_engine("not_found_targets.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let unknown_venue = request(Ulid::new(), None, "18:00", "20:00");
    assert!(matches!(engine.create_booking(unknown_venue).await, Err(EngineError::NotFound(_))));

    let unknown_arena = request(venue, Some(Ulid::new()), "18:00", "20:00");
    assert!(matches!(engine.create_booking(unknown_arena).await, Err(EngineError::NotFound(_))));

    // Arena of another venue.
    let (_, foreign_arena) = setup_arena(&engine, dec!(900)).await;
    let mismatched = request(venue, Some(foreign_arena), "18:00", "20:00");
    assert!(matches!(engine.create_booking(mismatched).await, Err(EngineError::NotFound(_))));

    engine.deactivate_arena(arena).await.unwrap();
    let inactive = request(venue, Some(arena), "18:00", "20:00");
    assert!(matches!(engine.create_booking(inactive).await, Err(EngineError::NotFound(_))));

    engine.deactivate_venue(venue).await.unwrap();
    let inactive_venue = request(venue, None, "18:00", "20:00");
    assert!(matches!(engine.create_booking(inactive_venue).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn new_player_requires_name() {
    let engine = new_engine("player_name_required.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let mut nameless = request(venue, Some(arena), "18:00", "20:00");
    nameless.player_name = Some("   ".into());
    assert!(matches!(engine.create_booking(nameless).await, Err(EngineError::InvalidInput(_))));
    // Nothing was written.
    assert!(engine.list_bookings(ResourceKey::Arena(arena), None).await.unwrap().is_empty());
    assert!(engine.get_player("9812345678").is_err());

    let mut bad_mobile = request(venue, Some(arena), "18:00", "20:00");
    bad_mobile.player_mobile = "12ab".into();
    assert!(matches!(engine.create_booking(bad_mobile).await, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn existing_player_name_wins() {
    let engine = new_engine("player_name_wins.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let first = engine.create_booking(request(venue, Some(arena), "06:00", "07:00")).await.unwrap();
    assert!(first.player_created);

    let mut again = request(venue, Some(arena), "08:00", "09:00");
    again.player_mobile = "98123 45678".into();
    again.player_name = Some("Somebody Else".into());
    let second = engine.create_booking(again).await.unwrap();
    assert!(!second.player_created);
    assert_eq!(second.player.id, first.player.id);
    assert_eq!(second.player.name, "Asha");

    // A known mobile needs no name.
    let mut anonymous = request(venue, Some(arena), "10:00", "11:00");
    anonymous.player_name = None;
    assert_ok!(engine.create_booking(anonymous).await);
}

#[tokio::test]
async fn conflict_does_not_register_player() {
    let engine = new_engine("conflict_no_player.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();

    let mut rival = request(venue, Some(arena), "19:00", "20:00");
    rival.player_mobile = "9700000001".into();
    rival.player_name = Some("Ravi".into());
    assert!(matches!(engine.create_booking(rival).await, Err(EngineError::Conflict(_))));
    assert!(engine.get_player("9700000001").is_err());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn failed_commit_does_not_register_player() {
    let path = test_wal_path("failed_commit_player.wal");
    let mut engine = Engine::new(path.clone(), test_policy(), Dispatch::default()).unwrap();
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    // Every flush to /dev/full fails with ENOSPC.
    engine.wal_tx = spawn_wal_writer(Wal::open(&PathBuf::from("/dev/full")).unwrap());
    let result = engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await;
    assert!(matches!(result, Err(EngineError::Unavailable(_))));
    assert!(engine.get_player("9812345678").is_err());
    let none = engine.list_bookings(ResourceKey::Arena(arena), None).await.unwrap();
    assert!(none.is_empty());

    engine.wal_tx = spawn_wal_writer(Wal::open(&path).unwrap());
    let receipt = assert_ok!(engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await);
    assert!(receipt.player_created);

    let restored = Engine::new(path, test_policy(), Dispatch::default()).unwrap();
    assert_eq!(restored.store.players().len(), 1);
    assert_eq!(restored.get_player("9812345678").unwrap().id, receipt.player.id);
}

#[tokio::test]
async fn cancelled_bookings_do_not_count_toward_partition_cap() {
    let engine = new_engine("cap_ignores_cancelled.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    for _ in 0..MAX_BOOKINGS_PER_PARTITION {
        let receipt = engine.create_booking(request(venue, Some(arena), "18:00", "19:00")).await.unwrap();
        engine.cancel_booking(receipt.booking.id).await.unwrap();
    }

    assert_ok!(engine.create_booking(request(venue, Some(arena), "06:00", "07:00")).await);
    assert_ok!(engine.create_booking(request(venue, Some(arena), "18:00", "19:00")).await);
}

#[tokio::test]
async fn long_notes_rejected() {
    let engine = new_engine("long_notes.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let mut req = request(venue, Some(arena), "18:00", "20:00");
    req.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
    assert!(matches!(engine.create_booking(req).await, Err(EngineError::LimitExceeded(_))));
}

// ── Pricing ──────────────────────────────────────────────

#[tokio::test]
async fn two_arena_evening_scenario() {
    let policy = BookingPolicy {
        reject_past_dates: false,
        ..test_policy()
    };
    let engine = Engine::new(test_wal_path("evening_scenario.wal"), policy, Dispatch::default()).unwrap();
    let venue = Ulid::new();
    let (a, b) = (Ulid::new(), Ulid::new());
    engine.create_venue(venue, "Legacy Ground".into(), dec!(1000)).await.unwrap();
    engine
        .create_arena(a, venue, "A".into(), "Cricket".into(), 22, dec!(1200))
        .await
        .unwrap();
    engine
        .create_arena(b, venue, "B".into(), "Cricket".into(), 22, dec!(800))
        .await
        .unwrap();

    let on = |arena, start: &str, end: &str| {
        let mut req = request(venue, Some(arena), start, end);
        req.booking_date = "2025-09-24".into();
        req
    };

    let first = engine.create_booking(on(a, "18:00", "20:00")).await.unwrap();
    assert_eq!(first.booking.total_amount, dec!(2400));

    let clash = engine.create_booking(on(a, "19:00", "21:00")).await;
    assert!(matches!(clash, Err(EngineError::Conflict(id)) if id == first.booking.id));

    let other = engine.create_booking(on(b, "19:00", "21:00")).await.unwrap();
    assert_eq!(other.booking.total_amount, dec!(1600));
}

#[tokio::test]
async fn slot_price_applies_when_range_fits() {
    let engine = new_engine("slot_pricing.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    // Monday evening peak.
    engine
        .add_slot(Ulid::new(), arena, 0, "18:00", "22:00", dec!(1500), 1)
        .await
        .unwrap();

    let peak = engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    assert_eq!(peak.booking.total_amount, dec!(3000));

    let straddle = engine.create_booking(request(venue, Some(arena), "16:00", "18:00")).await.unwrap();
    assert_eq!(straddle.booking.total_amount, dec!(2400));
}

#[tokio::test]
async fn venue_level_booking_uses_venue_key_and_price() {
    let engine = new_engine("venue_level.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let legacy = engine.create_booking(request(venue, None, "18:00", "20:00")).await.unwrap();
    assert_eq!(legacy.booking.arena_id, None);
    assert_eq!(legacy.booking.total_amount, dec!(1000));
    assert_eq!(legacy.booking.resource_key(), ResourceKey::Venue(venue));

    // Arena bookings live under a different key and don't collide.
    assert_ok!(engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await);
    let clash = engine.create_booking(request(venue, None, "19:00", "20:00")).await;
    assert!(matches!(clash, Err(EngineError::Conflict(_))));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn payment_then_completion() {
    let engine = new_engine("lifecycle.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    let id = engine
        .create_booking(request(venue, Some(arena), "18:00", "20:00"))
        .await
        .unwrap()
        .booking
        .id;

    assert!(matches!(
        engine.complete_booking(id).await,
        Err(EngineError::InvalidTransition { from: BookingStatus::Pending, .. })
    ));

    let paid = engine.confirm_payment(id).await.unwrap();
    assert_eq!(paid.status, BookingStatus::Confirmed);
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    assert!(matches!(engine.confirm_payment(id).await, Err(EngineError::InvalidTransition { .. })));

    let done = engine.complete_booking(id).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert!(matches!(engine.cancel_booking(id).await, Err(EngineError::InvalidTransition { .. })));
    // Completed bookings still occupy their range.
    assert!(matches!(
        engine.create_booking(request(venue, Some(arena), "18:00", "19:00")).await,
        Err(EngineError::Conflict(_))
    ));
}

#[tokio::test]
async fn cancel_paid_booking_refunds() {
    let engine = new_engine("cancel_refund.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    let id = engine
        .create_booking(request(venue, Some(arena), "18:00", "20:00"))
        .await
        .unwrap()
        .booking
        .id;
    engine.confirm_payment(id).await.unwrap();

    let cancelled = engine.cancel_booking(id).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::Refunded);
    assert!(matches!(engine.cancel_booking(id).await, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn unknown_booking_not_found() {
    let engine = new_engine("unknown_booking.wal");
    let id = Ulid::new();
    assert!(matches!(engine.cancel_booking(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.confirm_payment(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_booking(id).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn elapsed_confirmed_bookings_are_collected() {
    let engine = new_engine("collect_elapsed.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    let confirmed = engine
        .create_booking(request(venue, Some(arena), "18:00", "20:00"))
        .await
        .unwrap()
        .booking
        .id;
    engine.confirm_payment(confirmed).await.unwrap();
    // Pending bookings are never swept.
    engine.create_booking(request(venue, Some(arena), "06:00", "07:00")).await.unwrap();

    assert!(engine.collect_elapsed_bookings(date().pred_opt().unwrap(), 0).is_empty());
    assert!(engine.collect_elapsed_bookings(date(), 19 * H).is_empty());
    assert_eq!(engine.collect_elapsed_bookings(date(), 20 * H), vec![confirmed]);
    assert_eq!(engine.collect_elapsed_bookings(date().succ_opt().unwrap(), 0), vec![confirmed]);
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn directory_validation() {
    let engine = new_engine("directory_validation.wal");
    let venue = Ulid::new();
    assert!(matches!(
        engine.create_venue(venue, "Bad".into(), dec!(-1)).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.create_venue(venue, "  ".into(), dec!(100)).await,
        Err(EngineError::InvalidInput(_))
    ));
    engine.create_venue(venue, "Good".into(), dec!(100)).await.unwrap();
    assert!(matches!(
        engine.create_venue(venue, "Good".into(), dec!(100)).await,
        Err(EngineError::AlreadyExists(id)) if id == venue
    ));

    assert!(matches!(
        engine
            .create_arena(Ulid::new(), Ulid::new(), "X".into(), "Cricket".into(), 1, dec!(1))
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine
            .create_arena(Ulid::new(), venue, "X".into(), "Cricket".into(), 0, dec!(1))
            .await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn slots_add_list_remove() {
    let engine = new_engine("slots_crud.wal");
    let (_, arena) = setup_arena(&engine, dec!(1200)).await;

    let evening = Ulid::new();
    engine.add_slot(evening, arena, 2, "18:00", "22:00", dec!(1500), 1).await.unwrap();
    engine.add_slot(Ulid::new(), arena, 0, "06:00", "10:00", dec!(700), 1).await.unwrap();
    assert!(matches!(
        engine.add_slot(Ulid::new(), arena, 7, "06:00", "10:00", dec!(700), 1).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.add_slot(evening, arena, 2, "06:00", "10:00", dec!(700), 1).await,
        Err(EngineError::AlreadyExists(_))
    ));

    let slots = engine.list_slots(arena).unwrap();
    assert_eq!(slots.iter().map(|s| s.day_of_week).collect::<Vec<_>>(), vec![0, 2]);

    assert_eq!(engine.remove_slot(evening).await.unwrap(), arena);
    assert_eq!(engine.list_slots(arena).unwrap().len(), 1);
    assert!(matches!(engine.remove_slot(evening).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn availability_follows_slots_and_bookings() {
    let engine = new_engine("availability_slots.wal");
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    engine.add_slot(Ulid::new(), arena, 0, "06:00", "10:00", dec!(700), 1).await.unwrap();
    engine.add_slot(Ulid::new(), arena, 0, "17:00", "22:00", dec!(1500), 1).await.unwrap();

    engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    engine.create_booking(request(venue, Some(arena), "20:00", "21:30")).await.unwrap();

    let free = engine.availability(ResourceKey::Arena(arena), date(), None).await.unwrap();
    assert_eq!(
        free,
        vec![Span::new(6 * H, 10 * H), Span::new(17 * H, 18 * H), Span::new(21 * H + 30, 22 * H)]
    );

    let long = engine.availability(ResourceKey::Arena(arena), date(), Some(60)).await.unwrap();
    assert_eq!(long, vec![Span::new(6 * H, 10 * H), Span::new(17 * H, 18 * H)]);

    // Tuesday has no slots: open all day.
    let tuesday = date().succ_opt().unwrap();
    let free = engine.availability(ResourceKey::Arena(arena), tuesday, None).await.unwrap();
    assert_eq!(free, vec![Span::whole_day()]);

    assert!(matches!(
        engine.availability(ResourceKey::Arena(Ulid::new()), date(), None).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn find_or_create_player_is_idempotent() {
    let engine = new_engine("find_or_create.wal");
    let (p, created) = engine.find_or_create_player("+91 98123 45678", Some("Asha".into())).await.unwrap();
    assert!(created);
    assert_eq!(p.mobile, "+919812345678");

    let (again, created) = engine.find_or_create_player("+919812345678", None).await.unwrap();
    assert!(!created);
    assert_eq!(again, p);

    assert!(matches!(
        engine.find_or_create_player("9000000000", None).await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Side effects ─────────────────────────────────────────

struct RejectingGateway;

#[async_trait]
impl PaymentGateway for RejectingGateway {
    async fn create_payment_link(&self, _booking: &Booking) -> Result<String, DispatchError> {
        Err(DispatchError::Rejected("gateway down".into()))
    }
}

struct StalledNotifier;

#[async_trait]
impl Notifier for StalledNotifier {
    async fn notify_player(&self, _player: &Player, _booking: &Booking) -> Result<(), DispatchError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn failed_side_effects_degrade_but_keep_booking() {
    let dispatch = Dispatch {
        payments: Arc::new(RejectingGateway),
        notifier: Arc::new(StalledNotifier),
    };
    let policy = BookingPolicy {
        dispatch_timeout: Duration::from_millis(50),
        ..test_policy()
    };
    let engine = Engine::new(test_wal_path("degraded.wal"), policy, dispatch).unwrap();
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let receipt = engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await.unwrap();
    assert!(receipt.is_degraded());
    assert_eq!(receipt.warnings.len(), 2);
    assert!(receipt.payment_link.is_none());
    assert!(!receipt.notified);

    // Committed regardless.
    assert_ok!(engine.get_booking(receipt.booking.id).await);
    assert_eq!(engine.store.get_arena(&arena).unwrap().booking_count, 1);
}

#[tokio::test]
async fn busy_partition_times_out_as_unavailable() {
    let policy = BookingPolicy {
        lock_timeout: Duration::from_millis(50),
        ..test_policy()
    };
    let engine = Engine::new(test_wal_path("lock_timeout.wal"), policy, Dispatch::default()).unwrap();
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;

    let key = LedgerKey {
        resource: ResourceKey::Arena(arena),
        date: date(),
    };
    let held = engine.store.ledger_or_insert(key).write_owned().await;

    let result = engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await;
    assert!(matches!(result, Err(EngineError::Unavailable(_))));

    drop(held);
    assert_ok!(engine.create_booking(request(venue, Some(arena), "18:00", "20:00")).await);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_bookings_and_counters() {
    let path = test_wal_path("replay.wal");
    let (venue, arena, booking) = {
        let engine = Engine::new(path.clone(), test_policy(), Dispatch::default()).unwrap();
        let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
        engine.add_slot(Ulid::new(), arena, 0, "06:00", "10:00", dec!(700), 1).await.unwrap();
        let booking = engine
            .create_booking(request(venue, Some(arena), "18:00", "20:00"))
            .await
            .unwrap()
            .booking;
        engine.confirm_payment(booking.id).await.unwrap();
        engine.create_booking(request(venue, None, "06:00", "07:00")).await.unwrap();
        (venue, arena, booking.id)
    };

    let engine = Engine::new(path, test_policy(), Dispatch::default()).unwrap();
    let restored = engine.get_booking(booking).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Confirmed);
    assert_eq!(restored.payment_status, PaymentStatus::Paid);
    assert_eq!(restored.total_amount, dec!(2400));
    assert_eq!(engine.store.ledger_for_booking(&booking), Some(restored.ledger_key()));

    assert_eq!(engine.store.get_venue(&venue).unwrap().booking_count, 2);
    assert_eq!(engine.store.get_arena(&arena).unwrap().booking_count, 1);
    assert_eq!(engine.list_slots(arena).unwrap().len(), 1);
    assert_eq!(engine.get_player("9812345678").unwrap().name, "Asha");

    // The restored booking still blocks its range.
    assert!(matches!(
        engine.create_booking(request(venue, Some(arena), "19:00", "21:00")).await,
        Err(EngineError::Conflict(id)) if id == booking
    ));
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let engine = Engine::new(path.clone(), test_policy(), Dispatch::default()).unwrap();
    let (venue, arena) = setup_arena(&engine, dec!(1200)).await;
    engine.add_slot(Ulid::new(), arena, 0, "06:00", "10:00", dec!(700), 1).await.unwrap();

    let mut ids = Vec::new();
    for (start, end) in [("06:00", "07:00"), ("08:00", "09:00"), ("10:00", "11:00"), ("12:00", "13:00")] {
        let r = engine.create_booking(request(venue, Some(arena), start, end)).await.unwrap();
        ids.push(r.booking.id);
    }
    engine.cancel_booking(ids[0]).await.unwrap();
    engine.confirm_payment(ids[1]).await.unwrap();
    engine.confirm_payment(ids[2]).await.unwrap();
    engine.complete_booking(ids[2]).await.unwrap();
    engine.confirm_payment(ids[3]).await.unwrap();
    engine.cancel_booking(ids[3]).await.unwrap();
    let retired = Ulid::new();
    engine.create_venue(retired, "Closed Ground".into(), dec!(300)).await.unwrap();
    engine.deactivate_venue(retired).await.unwrap();

    let before = engine.list_bookings(ResourceKey::Arena(arena), None).await.unwrap();
    assert!(engine.wal_appends_since_compact().await > 0);
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the new file.
    let late = engine.create_booking(request(venue, Some(arena), "14:00", "15:00")).await.unwrap();

    let replayed = Engine::new(path, test_policy(), Dispatch::default()).unwrap();
    let mut after = replayed.list_bookings(ResourceKey::Arena(arena), None).await.unwrap();
    assert_eq!(after.pop().unwrap().id, late.booking.id);
    assert_eq!(after, before);

    assert!(!replayed.store.get_venue(&retired).unwrap().is_active);
    assert_eq!(replayed.store.get_arena(&arena).unwrap().booking_count, 5);
    assert_eq!(replayed.list_slots(arena).unwrap().len(), 1);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), test_policy(), Dispatch::default()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_venue(Ulid::new(), format!("Venue {i}"), dec!(100)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_venues().len(), n);

    let engine2 = Engine::new(path, test_policy(), Dispatch::default()).unwrap();
    assert_eq!(engine2.list_venues().len(), n);
}
