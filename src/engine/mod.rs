mod availability;
mod booking;
mod conflict;
mod error;
mod mutations;
mod pricing;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub use availability::{arena_windows, free_windows, merge_overlapping, subtract_intervals};
pub(crate) use conflict::{minute_of_day_now, parse_date, today};
pub use error::EngineError;
pub use pricing::{day_of_week, quote, total_amount};
pub use store::{DayLedger, InMemoryStore, SharedLedger};

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::dispatch::Dispatch;
use crate::model::*;
use crate::observability::{LEDGER_LOCK_WAIT_SECONDS, WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use store::event_ledger_key;

/// Per-tenant booking rules.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub min_duration_minutes: Minute,
    pub reject_past_dates: bool,
    /// Upper bound on waiting for a ledger partition lock.
    pub lock_timeout: Duration,
    /// Upper bound on each post-commit side effect.
    pub dispatch_timeout: Duration,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            min_duration_minutes: 60,
            reject_past_dates: true,
            lock_timeout: Duration::from_millis(2_000),
            dispatch_timeout: Duration::from_millis(3_000),
        }
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One or more events that share a single outcome.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!(path = %wal.path().display(), "WAL writer stopped");
}

type AppendBatch = Vec<(Vec<Event>, oneshot::Sender<io::Result<()>>)>;

fn commit_batch(wal: &mut Wal, batch: &mut AppendBatch) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, events = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &AppendBatch) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'append: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'append;
            }
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let mut batch = vec![(events, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

pub(super) fn spawn_wal_writer(wal: Wal) -> mpsc::Sender<WalCommand> {
    let (wal_tx, wal_rx) = mpsc::channel(4096);
    tokio::spawn(wal_writer_loop(wal, wal_rx));
    wal_tx
}

/// Exclusive access to one ledger partition. Also holds a share of the
/// commit gate so compaction never snapshots mid-commit.
pub(super) struct PartitionGuard {
    ledger: OwnedRwLockWriteGuard<DayLedger>,
    _commit: OwnedRwLockReadGuard<()>,
}

impl Deref for PartitionGuard {
    type Target = DayLedger;

    fn deref(&self) -> &DayLedger {
        &self.ledger
    }
}

impl DerefMut for PartitionGuard {
    fn deref_mut(&mut self) -> &mut DayLedger {
        &mut self.ledger
    }
}

pub(super) struct DirectoryGuard<'a> {
    _directory: tokio::sync::MutexGuard<'a, ()>,
    _commit: OwnedRwLockReadGuard<()>,
}

pub struct Engine {
    pub store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub policy: BookingPolicy,
    pub(super) dispatch: Dispatch,
    /// Serializes directory writes (venues, arenas, slots, players).
    /// Lock order: ledger partition, then directory.
    pub(super) directory_lock: Mutex<()>,
    /// Every commit holds a read share; compaction takes it exclusively.
    pub(super) commit_gate: Arc<RwLock<()>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: BookingPolicy, dispatch: Dispatch) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal_tx = spawn_wal_writer(Wal::open(&wal_path)?);

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            policy,
            dispatch,
            directory_lock: Mutex::new(()),
            commit_gate: Arc::new(RwLock::new(())),
        };

        // Sole owner of every ledger during replay, so try_write never contends.
        // Never block here: this may run inside an async context (lazy tenant creation).
        for event in &events {
            match event_ledger_key(&engine.store, event) {
                Some(key) => {
                    let ledger = engine.store.ledger_or_insert(key);
                    let mut guard = ledger
                        .try_write()
                        .map_err(|_| io::Error::other(format!("replay: ledger {key} contended")))?;
                    engine.store.apply_ledger_event(&mut guard, event);
                    if let Event::BookingCreated { venue_id, arena_id, .. } = event {
                        engine.store.increment_booking_count(venue_id, arena_id.as_ref());
                    }
                }
                None => engine.store.apply_directory_event(event),
            }
        }

        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            venues = engine.store.venue_count(),
            "engine replayed"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    /// Write several events in one flush; they become durable or fail together.
    async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(format!("write-ahead log: {e}")))
    }

    /// Acquire the write lock of a ledger partition, bounded by `lock_timeout`.
    pub(super) async fn lock_partition(&self, key: LedgerKey) -> Result<PartitionGuard, EngineError> {
        let ledger = self.store.ledger_or_insert(key);
        let started = Instant::now();
        let acquire = async move {
            let commit = self.commit_gate.clone().read_owned().await;
            let ledger = ledger.write_owned().await;
            PartitionGuard {
                ledger,
                _commit: commit,
            }
        };
        let guard = tokio::time::timeout(self.policy.lock_timeout, acquire)
            .await
            .map_err(|_| {
                tracing::warn!(partition = %key, "ledger lock timed out");
                EngineError::Unavailable(format!("timed out waiting for {key}"))
            })?;
        metrics::histogram!(LEDGER_LOCK_WAIT_SECONDS).record(started.elapsed().as_secs_f64());
        Ok(guard)
    }

    /// Lock the partition that owns `booking_id`.
    pub(super) async fn lock_booking(&self, booking_id: Ulid) -> Result<PartitionGuard, EngineError> {
        let key = self
            .store
            .ledger_for_booking(&booking_id)
            .ok_or_else(|| EngineError::not_found("booking", booking_id))?;
        self.lock_partition(key).await
    }

    pub(super) async fn lock_directory(&self) -> DirectoryGuard<'_> {
        let commit = self.commit_gate.clone().read_owned().await;
        let directory = self.directory_lock.lock().await;
        DirectoryGuard {
            _directory: directory,
            _commit: commit,
        }
    }

    /// WAL-append then apply a directory event. Caller holds the directory lock.
    pub(super) async fn persist_directory(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_directory_event(event);
        Ok(())
    }

    /// WAL-append then apply a booking event to its locked partition.
    pub(super) async fn persist_ledger(
        &self,
        ledger: &mut DayLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_ledger_event(ledger, event);
        Ok(())
    }

    /// Like `persist_ledger`, with a directory event committed in the same
    /// WAL flush. Nothing is applied unless both are durable. Caller holds
    /// the directory lock when `directory` is set.
    pub(super) async fn persist_ledger_with(
        &self,
        ledger: &mut DayLedger,
        directory: Option<&Event>,
        event: &Event,
    ) -> Result<(), EngineError> {
        let Some(directory) = directory else {
            return self.persist_ledger(ledger, event).await;
        };
        self.wal_append_all(vec![directory.clone(), event.clone()]).await?;
        self.store.apply_directory_event(directory);
        self.store.apply_ledger_event(ledger, event);
        Ok(())
    }
}
