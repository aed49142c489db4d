mod availability;
pub(crate) mod conflict;
mod mutations;
mod queries;

pub use availability::{available_rooms, is_available};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};

use crate::model::*;
use crate::repository::{RepoError, Repository};
use crate::wal::{Replay, Wal};

pub type SharedRoomState = Arc<RwLock<RoomState>>;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL file.
///
/// Appends that arrive while a batch is being collected share one fsync.
/// A non-append command ends the batch; the batch is committed before the
/// command runs so compaction never drops acknowledged events.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            run_command(&mut wal, cmd);
            continue;
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
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

        if !commit_batch(&mut wal, batch) {
            // The log may end in garbage; later appends would be lost on replay.
            tracing::error!("WAL writer stopping, further writes will fail");
            return;
        }
        if let Some(cmd) = deferred {
            run_command(&mut wal, cmd);
        }
    }
}

/// Append and fsync one batch, answering every waiter. Returns false when a
/// failed batch could not be rolled back.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) -> bool {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // A failed batch is acknowledged to nobody, so none of it may stay in the log.
    let mut intact = true;
    if let Err(e) = &result {
        tracing::error!("WAL batch of {} failed: {e}", batch.len());
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed: {e}");
            intact = false;
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
    intact
}

fn run_command(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Durable room index: every room's restrictions in memory, every change in the WAL.
pub struct Engine {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    pub(super) reservations: DashMap<ReservationId, Reservation>,
    /// Reverse lookup: restriction id → room id.
    pub(super) restriction_to_room: DashMap<RestrictionId, RoomId>,
    pub(super) next_reservation_id: AtomicI64,
    pub(super) next_restriction_id: AtomicI64,
    /// Mutations hold this shared from WAL append to apply; compaction takes it
    /// exclusively so its snapshot and the log swap see the same state.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the background writer.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let Replay { events, valid_len } = Wal::replay(&wal_path)?;
        if let Ok(meta) = std::fs::metadata(&wal_path)
            && meta.len() > valid_len
        {
            tracing::warn!(
                "dropping {} bytes of torn or corrupt WAL tail",
                meta.len() - valid_len
            );
            Wal::truncate(&wal_path, valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            restriction_to_room: DashMap::new(),
            next_reservation_id: AtomicI64::new(1),
            next_restriction_id: AtomicI64::new(1),
            commit_gate: RwLock::new(()),
            wal_tx,
        };

        // Nobody else holds these locks yet, so try_write never contends. Blocking
        // variants would panic if this runs inside an async context.
        for event in &events {
            match engine.room_for_event(event) {
                Some(room_id) => {
                    if let Some(rs) = engine.get_room(&room_id)
                        && let Ok(mut guard) = rs.try_write()
                    {
                        engine.apply(Some(&mut *guard), event);
                    }
                }
                None => engine.apply(None, event),
            }
        }

        tracing::info!(
            "replayed {} WAL events: {} rooms, {} reservations",
            events.len(),
            engine.rooms.len(),
            engine.reservations.len()
        );
        Ok(engine)
    }

    pub fn get_room(&self, id: &RoomId) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    /// Room whose lock must be held while applying `event`, if any.
    pub(super) fn room_for_event(&self, event: &Event) -> Option<RoomId> {
        match event {
            Event::RestrictionAdded { restriction } => Some(restriction.room_id),
            Event::BookingCommitted { restriction, .. } => Some(restriction.room_id),
            Event::ReservationDeleted { id } => self.reservations.get(id).map(|r| r.room_id),
            Event::RoomCreated { .. }
            | Event::ReservationInserted { .. }
            | Event::SequencesAdvanced { .. } => None,
        }
    }

    /// Apply an event to the in-memory tables. The caller holds the write lock of
    /// the room returned by `room_for_event`.
    pub(super) fn apply(&self, rs: Option<&mut RoomState>, event: &Event) {
        match event {
            Event::RoomCreated { room } => {
                self.rooms
                    .insert(room.id, Arc::new(RwLock::new(RoomState::new(room.clone()))));
            }
            Event::ReservationInserted { reservation } => {
                advance(&self.next_reservation_id, reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationDeleted { id } => {
                if let Some(rs) = rs {
                    let held: Vec<RestrictionId> = rs
                        .restrictions
                        .iter()
                        .filter(|r| r.reservation_id() == Some(*id))
                        .map(|r| r.id)
                        .collect();
                    for rid in held {
                        rs.remove_restriction(rid);
                        self.restriction_to_room.remove(&rid);
                    }
                }
                self.reservations.remove(id);
            }
            Event::RestrictionAdded { restriction } => {
                advance(&self.next_restriction_id, restriction.id);
                if let Some(rs) = rs {
                    rs.insert_restriction(*restriction);
                }
                self.restriction_to_room
                    .insert(restriction.id, restriction.room_id);
            }
            Event::BookingCommitted {
                reservation,
                restriction,
            } => {
                // Restriction first: a reader may see a hold without its reservation
                // for an instant, never a reservation without its hold.
                advance(&self.next_restriction_id, restriction.id);
                if let Some(rs) = rs {
                    rs.insert_restriction(*restriction);
                }
                self.restriction_to_room
                    .insert(restriction.id, restriction.room_id);
                advance(&self.next_reservation_id, reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::SequencesAdvanced {
                next_reservation_id,
                next_restriction_id,
            } => {
                advance(&self.next_reservation_id, next_reservation_id - 1);
                advance(&self.next_restriction_id, next_restriction_id - 1);
            }
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), RepoError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| RepoError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepoError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| RepoError::Storage(format!("WAL append failed: {e}")))
    }

    /// WAL-append, then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: Option<&mut RoomState>,
        event: &Event,
    ) -> Result<(), RepoError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }

    pub(super) fn allocate_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(super) fn allocate_restriction_id(&self) -> RestrictionId {
        self.next_restriction_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Make sure the sequence hands out ids above `seen`.
fn advance(seq: &AtomicI64, seen: i64) {
    seq.fetch_max(seen + 1, Ordering::SeqCst);
}

#[async_trait]
impl Repository for Engine {
    async fn create_room(&self, room: Room) -> Result<(), RepoError> {
        Engine::create_room(self, room).await
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, RepoError> {
        Ok(Engine::list_rooms(self).await)
    }

    async fn get_room_by_id(&self, id: RoomId) -> Result<Room, RepoError> {
        Engine::get_room_by_id(self, id).await
    }

    async fn insert_reservation(
        &self,
        reservation: &NewReservation,
    ) -> Result<ReservationId, RepoError> {
        Engine::insert_reservation(self, reservation).await
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<(), RepoError> {
        Engine::delete_reservation(self, id).await
    }

    async fn insert_room_restriction(
        &self,
        restriction: &NewRoomRestriction,
    ) -> Result<RestrictionId, RepoError> {
        Engine::insert_room_restriction(self, restriction).await
    }

    async fn search_availability_for_all_rooms(
        &self,
        range: DateRange,
    ) -> Result<Vec<Room>, RepoError> {
        Engine::search_availability_for_all_rooms(self, range).await
    }

    async fn search_availability_by_room(
        &self,
        range: DateRange,
        room_id: RoomId,
    ) -> Result<bool, RepoError> {
        Engine::search_availability_by_room(self, range, room_id).await
    }

    async fn commit_reservation(&self, reservation: &NewReservation) -> Result<Booking, RepoError> {
        Engine::commit_booking(self, reservation).await
    }
}
