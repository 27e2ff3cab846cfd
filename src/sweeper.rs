use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{minute_of_day_now, today, Engine};
use crate::observability::BOOKINGS_SWEPT_TOTAL;

/// Complete every confirmed booking whose range has ended. Returns how many
/// were moved to completed.
pub async fn sweep_once(engine: &Engine) -> usize {
    let elapsed = engine.collect_elapsed_bookings(today(), minute_of_day_now());
    let mut completed = 0;
    for booking_id in elapsed {
        match engine.complete_booking(booking_id).await {
            Ok(_) => completed += 1,
            // Cancelled or completed since collection.
            Err(e) => debug!("sweeper skip {booking_id}: {e}"),
        }
    }
    if completed > 0 {
        metrics::counter!(BOOKINGS_SWEPT_TOTAL).increment(completed as u64);
        info!(completed, "swept elapsed bookings");
    }
    completed
}

/// Background task that periodically completes elapsed bookings.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// Compact when the WAL has grown by at least `threshold` appends.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!(appends, "WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that checks the WAL size every 30 s.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}
