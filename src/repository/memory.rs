use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::engine::conflict::{check_no_conflict, check_room_capacity, validate_range};
use crate::engine::{SharedRoomState, available_rooms, is_available};
use crate::model::*;

use super::{Entity, RepoError, Repository};

/// Non-durable repository for tests and demos.
///
/// Uses the trait's two-step `commit_reservation`, so it also exercises the
/// compensating rollback. `fail_next_restriction` makes the next restriction
/// insert fail with a storage error.
pub struct MemoryRepository {
    rooms: DashMap<RoomId, SharedRoomState>,
    reservations: DashMap<ReservationId, Reservation>,
    next_id: AtomicI64,
    fail_next_restriction: AtomicBool,
    inserts: AtomicUsize,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            next_id: AtomicI64::new(1),
            fail_next_restriction: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
        }
    }

    pub fn with_rooms(rooms: impl IntoIterator<Item = Room>) -> Self {
        let repo = Self::new();
        for room in rooms {
            repo.rooms
                .insert(room.id, Arc::new(RwLock::new(RoomState::new(room))));
        }
        repo
    }

    pub fn fail_next_restriction(&self) {
        self.fail_next_restriction.store(true, Ordering::SeqCst);
    }

    /// Successful reservation and restriction inserts so far.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        all.sort_by_key(|r| r.id);
        all
    }

    pub async fn restrictions(&self) -> Vec<RoomRestriction> {
        let mut all = Vec::new();
        for rs in self.room_states() {
            all.extend(rs.read().await.restrictions.iter().copied());
        }
        all
    }

    fn room_states(&self) -> Vec<SharedRoomState> {
        let mut states: Vec<(RoomId, SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_unstable_by_key(|(id, _)| *id);
        states.into_iter().map(|(_, rs)| rs).collect()
    }

    fn get_room(&self, id: RoomId) -> Result<SharedRoomState, RepoError> {
        self.rooms
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(RepoError::NotFound(Entity::Room(id)))
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_room(&self, room: Room) -> Result<(), RepoError> {
        match self.rooms.entry(room.id) {
            dashmap::Entry::Occupied(_) => Err(RepoError::AlreadyExists(Entity::Room(room.id))),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(RoomState::new(room))));
                Ok(())
            }
        }
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, RepoError> {
        let mut rooms = Vec::new();
        for rs in self.room_states() {
            rooms.push(rs.read().await.room.clone());
        }
        Ok(rooms)
    }

    async fn get_room_by_id(&self, id: RoomId) -> Result<Room, RepoError> {
        let rs = self.get_room(id)?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    async fn insert_reservation(
        &self,
        reservation: &NewReservation,
    ) -> Result<ReservationId, RepoError> {
        validate_range(&reservation.range)?;
        self.get_room(reservation.room_id)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.reservations
            .insert(id, Reservation::from_new(id, reservation));
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn delete_reservation(&self, id: ReservationId) -> Result<(), RepoError> {
        let (_, reservation) = self
            .reservations
            .remove(&id)
            .ok_or(RepoError::NotFound(Entity::Reservation(id)))?;
        let rs = self.get_room(reservation.room_id)?;
        rs.write()
            .await
            .restrictions
            .retain(|r| r.reservation_id() != Some(id));
        Ok(())
    }

    async fn insert_room_restriction(
        &self,
        restriction: &NewRoomRestriction,
    ) -> Result<RestrictionId, RepoError> {
        if self.fail_next_restriction.swap(false, Ordering::SeqCst) {
            return Err(RepoError::Storage("injected restriction failure".into()));
        }
        validate_range(&restriction.range)?;
        if let RestrictionKind::Reservation(id) = restriction.kind
            && !self.reservations.contains_key(&id)
        {
            return Err(RepoError::NotFound(Entity::Reservation(id)));
        }
        let rs = self.get_room(restriction.room_id)?;
        let mut guard = rs.write().await;
        check_room_capacity(&guard)?;
        check_no_conflict(&guard, &restriction.range)?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        guard.insert_restriction(RoomRestriction {
            id,
            room_id: restriction.room_id,
            range: restriction.range,
            kind: restriction.kind,
        });
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn search_availability_for_all_rooms(
        &self,
        range: DateRange,
    ) -> Result<Vec<Room>, RepoError> {
        validate_range(&range)?;
        let mut guards = Vec::new();
        for rs in self.room_states() {
            guards.push(rs.read_owned().await);
        }
        Ok(available_rooms(guards.iter().map(|g| &**g), &range))
    }

    async fn search_availability_by_room(
        &self,
        range: DateRange,
        room_id: RoomId,
    ) -> Result<bool, RepoError> {
        validate_range(&range)?;
        let rs = self.get_room(room_id)?;
        let guard = rs.read().await;
        Ok(is_available(&guard, &range))
    }
}
