use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;
use crate::repository::{Entity, RepoError};

use super::conflict::{
    check_no_conflict, check_room_capacity, validate_guest, validate_range, validate_room,
};
use super::{Engine, WalCommand};

impl Engine {
    pub async fn create_room(&self, room: Room) -> Result<(), RepoError> {
        validate_room(&room)?;
        // Exclusive: two creators of the same id must not both pass the existence check.
        let _gate = self.commit_gate.write().await;
        if self.rooms.len() >= MAX_ROOMS {
            return Err(RepoError::LimitExceeded("too many rooms"));
        }
        if self.rooms.contains_key(&room.id) {
            return Err(RepoError::AlreadyExists(Entity::Room(room.id)));
        }

        let event = Event::RoomCreated { room };
        self.persist_and_apply(None, &event).await
    }

    pub async fn insert_reservation(
        &self,
        new: &NewReservation,
    ) -> Result<ReservationId, RepoError> {
        validate_range(&new.range)?;
        validate_guest(&new.guest)?;
        let _gate = self.commit_gate.read().await;
        if !self.rooms.contains_key(&new.room_id) {
            return Err(RepoError::NotFound(Entity::Room(new.room_id)));
        }

        let reservation = Reservation::from_new(self.allocate_reservation_id(), new);
        let id = reservation.id;
        let event = Event::ReservationInserted { reservation };
        self.persist_and_apply(None, &event).await?;
        Ok(id)
    }

    pub async fn delete_reservation(&self, id: ReservationId) -> Result<(), RepoError> {
        let _gate = self.commit_gate.read().await;
        let room_id = self
            .reservations
            .get(&id)
            .map(|r| r.room_id)
            .ok_or(RepoError::NotFound(Entity::Reservation(id)))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(RepoError::NotFound(Entity::Room(room_id)))?;
        let mut guard = rs.write().await;

        let event = Event::ReservationDeleted { id };
        self.persist_and_apply(Some(&mut *guard), &event).await
    }

    pub async fn insert_room_restriction(
        &self,
        new: &NewRoomRestriction,
    ) -> Result<RestrictionId, RepoError> {
        validate_range(&new.range)?;
        let _gate = self.commit_gate.read().await;
        if let RestrictionKind::Reservation(reservation_id) = new.kind {
            let reservation = self
                .reservations
                .get(&reservation_id)
                .map(|r| r.room_id)
                .ok_or(RepoError::NotFound(Entity::Reservation(reservation_id)))?;
            if reservation != new.room_id {
                return Err(RepoError::NotFound(Entity::Reservation(reservation_id)));
            }
        }
        let rs = self
            .get_room(&new.room_id)
            .ok_or(RepoError::NotFound(Entity::Room(new.room_id)))?;
        let mut guard = rs.write().await;
        check_room_capacity(&guard)?;
        check_no_conflict(&guard, &new.range)?;

        let restriction = RoomRestriction {
            id: self.allocate_restriction_id(),
            room_id: new.room_id,
            range: new.range,
            kind: new.kind,
        };
        let event = Event::RestrictionAdded { restriction };
        self.persist_and_apply(Some(&mut *guard), &event).await?;
        Ok(restriction.id)
    }

    /// Reservation and restriction in one WAL record, applied under the room's
    /// write lock. Overlapping concurrent commits on one room serialize here and
    /// all but the first get `Conflict`.
    pub async fn commit_booking(&self, new: &NewReservation) -> Result<Booking, RepoError> {
        validate_range(&new.range)?;
        validate_guest(&new.guest)?;
        let _gate = self.commit_gate.read().await;
        let rs = self
            .get_room(&new.room_id)
            .ok_or(RepoError::NotFound(Entity::Room(new.room_id)))?;
        let mut guard = rs.write().await;
        check_room_capacity(&guard)?;
        check_no_conflict(&guard, &new.range)?;

        let reservation = Reservation::from_new(self.allocate_reservation_id(), new);
        let restriction = RoomRestriction {
            id: self.allocate_restriction_id(),
            room_id: new.room_id,
            range: new.range,
            kind: RestrictionKind::Reservation(reservation.id),
        };
        let event = Event::BookingCommitted {
            reservation: reservation.clone(),
            restriction,
        };
        self.persist_and_apply(Some(&mut *guard), &event).await?;

        tracing::debug!(
            "committed reservation {} on room {} for {}",
            reservation.id,
            new.room_id,
            new.range
        );
        Ok(Booking {
            reservation,
            restriction,
        })
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), RepoError> {
        let _gate = self.commit_gate.write().await;

        let mut events = vec![Event::SequencesAdvanced {
            next_reservation_id: self.peek_next_reservation_id(),
            next_restriction_id: self.peek_next_restriction_id(),
        }];

        let mut room_ids: Vec<RoomId> = self.rooms.iter().map(|e| *e.key()).collect();
        room_ids.sort_unstable();

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|e| e.value().clone()).collect();
        reservations.sort_by_key(|r| r.id);

        let mut restrictions = Vec::new();
        for id in &room_ids {
            let Some(rs) = self.get_room(id) else { continue };
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                room: guard.room.clone(),
            });
            restrictions.extend(guard.restrictions.iter().copied());
        }
        events.extend(
            reservations
                .into_iter()
                .map(|reservation| Event::ReservationInserted { reservation }),
        );
        events.extend(
            restrictions
                .into_iter()
                .map(|restriction| Event::RestrictionAdded { restriction }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| RepoError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepoError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| RepoError::Storage(format!("WAL compaction failed: {e}")))?;
        tracing::info!("compacted WAL to {count} events");
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
