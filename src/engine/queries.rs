use std::sync::atomic::Ordering;

use crate::model::*;
use crate::repository::{Entity, RepoError};

use super::availability::{available_rooms, is_available};
use super::conflict::validate_range;
use super::Engine;

impl Engine {
    pub async fn get_room_by_id(&self, id: RoomId) -> Result<Room, RepoError> {
        let rs = self
            .get_room(&id)
            .ok_or(RepoError::NotFound(Entity::Room(id)))?;
        let guard = rs.read().await;
        Ok(guard.room.clone())
    }

    pub async fn list_rooms(&self) -> Vec<Room> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for rs in self.room_states_by_id() {
            rooms.push(rs.read().await.room.clone());
        }
        rooms
    }

    pub async fn search_availability_for_all_rooms(
        &self,
        range: DateRange,
    ) -> Result<Vec<Room>, RepoError> {
        validate_range(&range)?;
        let states = self.room_states_by_id();
        let mut guards = Vec::with_capacity(states.len());
        for rs in states {
            guards.push(rs.read_owned().await);
        }
        Ok(available_rooms(guards.iter().map(|g| &**g), &range))
    }

    pub async fn search_availability_by_room(
        &self,
        range: DateRange,
        room_id: RoomId,
    ) -> Result<bool, RepoError> {
        validate_range(&range)?;
        let rs = self
            .get_room(&room_id)
            .ok_or(RepoError::NotFound(Entity::Room(room_id)))?;
        let guard = rs.read().await;
        Ok(is_available(&guard, &range))
    }

    pub fn get_reservation(&self, id: ReservationId) -> Option<Reservation> {
        self.reservations.get(&id).map(|e| e.value().clone())
    }

    pub fn reservation_count(&self) -> usize {
        self.reservations.len()
    }

    pub async fn get_restrictions(&self, room_id: RoomId) -> Vec<RoomRestriction> {
        match self.get_room(&room_id) {
            Some(rs) => rs.read().await.restrictions.clone(),
            None => Vec::new(),
        }
    }

    pub fn room_for_restriction(&self, id: RestrictionId) -> Option<RoomId> {
        self.restriction_to_room.get(&id).map(|e| *e.value())
    }

    pub(super) fn peek_next_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.load(Ordering::SeqCst)
    }

    pub(super) fn peek_next_restriction_id(&self) -> RestrictionId {
        self.next_restriction_id.load(Ordering::SeqCst)
    }

    /// Room handles sorted by id, so multi-room reads lock in a fixed order.
    fn room_states_by_id(&self) -> Vec<super::SharedRoomState> {
        let mut states: Vec<(RoomId, super::SharedRoomState)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        states.sort_unstable_by_key(|(id, _)| *id);
        states.into_iter().map(|(_, rs)| rs).collect()
    }
}
