pub mod memory;

use std::fmt;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::model::*;

pub use memory::MemoryRepository;

/// What a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room(RoomId),
    Reservation(ReservationId),
    Restriction(RestrictionId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Room(id) => write!(f, "room {id}"),
            Entity::Reservation(id) => write!(f, "reservation {id}"),
            Entity::Restriction(id) => write!(f, "restriction {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    NotFound(Entity),
    AlreadyExists(Entity),
    /// The requested range overlaps an existing restriction on the room.
    Conflict {
        room_id: RoomId,
        restriction_id: RestrictionId,
    },
    InvalidRange(DateRange),
    LimitExceeded(&'static str),
    Storage(String),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::NotFound(entity) => write!(f, "not found: {entity}"),
            RepoError::AlreadyExists(entity) => write!(f, "already exists: {entity}"),
            RepoError::Conflict {
                room_id,
                restriction_id,
            } => write!(
                f,
                "room {room_id} is unavailable: overlaps restriction {restriction_id}"
            ),
            RepoError::InvalidRange(range) => write!(f, "invalid date range {range}"),
            RepoError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            RepoError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for RepoError {}

/// Persistence capability used by the booking workflow.
///
/// Every operation is atomic with respect to concurrent callers.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn create_room(&self, room: Room) -> Result<(), RepoError>;

    async fn list_rooms(&self) -> Result<Vec<Room>, RepoError>;

    async fn get_room_by_id(&self, id: RoomId) -> Result<Room, RepoError>;

    async fn insert_reservation(
        &self,
        reservation: &NewReservation,
    ) -> Result<ReservationId, RepoError>;

    /// Removes a reservation and any restriction that points at it.
    async fn delete_reservation(&self, id: ReservationId) -> Result<(), RepoError>;

    /// Fails with `Conflict` if the range overlaps an existing restriction on the room.
    async fn insert_room_restriction(
        &self,
        restriction: &NewRoomRestriction,
    ) -> Result<RestrictionId, RepoError>;

    /// Rooms with no restriction overlapping `range`, by ascending id.
    async fn search_availability_for_all_rooms(
        &self,
        range: DateRange,
    ) -> Result<Vec<Room>, RepoError>;

    async fn search_availability_by_room(
        &self,
        range: DateRange,
        room_id: RoomId,
    ) -> Result<bool, RepoError>;

    /// Persist a reservation together with the restriction that holds its room.
    ///
    /// This default inserts the two rows in turn and deletes the reservation
    /// again if the restriction cannot be written. Backends that can apply both
    /// in one step should override it.
    async fn commit_reservation(&self, reservation: &NewReservation) -> Result<Booking, RepoError> {
        let reservation_id = self.insert_reservation(reservation).await?;
        let new_restriction = NewRoomRestriction {
            room_id: reservation.room_id,
            range: reservation.range,
            kind: RestrictionKind::Reservation(reservation_id),
        };
        match self.insert_room_restriction(&new_restriction).await {
            Ok(restriction_id) => Ok(Booking {
                reservation: Reservation::from_new(reservation_id, reservation),
                restriction: RoomRestriction {
                    id: restriction_id,
                    room_id: new_restriction.room_id,
                    range: new_restriction.range,
                    kind: new_restriction.kind,
                },
            }),
            Err(e) => {
                warn!(
                    "restriction insert failed for reservation {reservation_id}, rolling back: {e}"
                );
                if let Err(cleanup) = self.delete_reservation(reservation_id).await {
                    error!(
                        "orphaned reservation {reservation_id}: rollback failed: {cleanup} (after {e})"
                    );
                }
                Err(e)
            }
        }
    }
}
