mod booking;
mod error;
mod queries;
mod store;
mod validate;

pub use error::BookingError;
pub use store::{ReservationStore, SharedSlotBoard, UniqueViolation};
pub use validate::{check_horizon, parse_resource, parse_slot_time};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::clock::{Clock, SystemClock};
use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

/// Owns the WAL. Appends that arrive while one is pending are drained into
/// the same batch and made durable with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} records failed: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-written bytes never join the next batch.
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, &mut vec![(event, response)]),
    }
}

/// One venue's reservation store plus the booking and availability services
/// that are the only way to touch it.
pub struct Engine {
    pub(super) store: ReservationStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) clock: Arc<dyn Clock>,
    /// Identity writes hold this shared; compaction holds it exclusively so
    /// its snapshot cannot miss a registration.
    pub(super) directory_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        Self::with_clock(wal_path, Arc::new(SystemClock))
    }

    /// Replay `wal_path` and start its group-commit writer. Must run inside a Tokio runtime.
    pub fn with_clock(wal_path: PathBuf, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let (wal, replay) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = ReservationStore::new();
        store.replay(&replay.events);
        let counts = replay.counts;
        tracing::info!(
            "{}: replayed {} records ({} registrations, {} deletions, {} bookings, {} cancellations), {} users and {} reservations live",
            wal_path.display(),
            counts.total(),
            counts.users_registered,
            counts.users_deleted,
            counts.reservations_created,
            counts.reservations_cancelled,
            store.user_count(),
            store.reservation_count()
        );

        Ok(Self {
            store,
            wal_tx,
            clock,
            directory_gate: RwLock::new(()),
        })
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), BookingError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()))
    }

    /// WAL-append then apply to the locked board. Nothing is applied if the write fails.
    pub(super) async fn persist_and_apply(
        &self,
        board: &mut SlotBoard,
        event: &Event,
    ) -> Result<(), BookingError> {
        self.wal_append(event).await?;
        self.store.apply_to_board(board, event);
        Ok(())
    }

    /// Rewrite the WAL with only the records needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), BookingError> {
        let gate = self.directory_gate.write().await;
        let mut guards = Vec::with_capacity(ResourceKind::ALL.len());
        for board in self.store.boards() {
            guards.push(board.read_owned().await);
        }

        let mut events = vec![Event::IdWatermark {
            next_reservation_id: self.store.peek_next_reservation_id(),
        }];
        for user in self.store.users() {
            events.push(Event::UserRegistered {
                id: user.id,
                email: user.email,
                display_name: user.display_name,
                created_at: user.created_at,
            });
        }
        for guard in &guards {
            for r in guard.iter() {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    owner_id: r.owner_id,
                    resource: r.resource,
                    slot_time: r.slot_time,
                    display_name: r.display_name.clone(),
                    created_at: r.created_at,
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| BookingError::Storage("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| BookingError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| BookingError::Storage(e.to_string()));
        drop(guards);
        drop(gate);
        result
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
