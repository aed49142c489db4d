use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fixed wire format for calendar dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub type RoomId = i64;
pub type ReservationId = i64;
pub type RestrictionId = i64;

/// Inclusive date range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `None` when `start > end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Inclusive overlap: ranges that merely touch on a boundary day still conflict.
    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
}

/// Guest contact details as entered on the reservation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
}

/// A reservation that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReservation {
    pub guest: Guest,
    pub range: DateRange,
    pub room_id: RoomId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub guest: Guest,
    pub range: DateRange,
    pub room_id: RoomId,
}

impl Reservation {
    pub fn from_new(id: ReservationId, new: &NewReservation) -> Self {
        Self {
            id,
            guest: new.guest.clone(),
            range: new.range,
            room_id: new.room_id,
        }
    }
}

/// Why a room is unavailable over a restriction's range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionKind {
    /// Held by a guest booking.
    Reservation(ReservationId),
    /// Blocked by the owner, no reservation behind it.
    OwnerBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRoomRestriction {
    pub room_id: RoomId,
    pub range: DateRange,
    pub kind: RestrictionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRestriction {
    pub id: RestrictionId,
    pub room_id: RoomId,
    pub range: DateRange,
    pub kind: RestrictionKind,
}

impl RoomRestriction {
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match self.kind {
            RestrictionKind::Reservation(id) => Some(id),
            RestrictionKind::OwnerBlock => None,
        }
    }
}

/// Result of a commit: the reservation and the restriction holding its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub reservation: Reservation,
    pub restriction: RoomRestriction,
}

/// A room plus its restrictions, sorted by `range.start`.
///
/// Restrictions never overlap each other, so sorting by start also sorts by end.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub restrictions: Vec<RoomRestriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    pub fn insert_restriction(&mut self, restriction: RoomRestriction) {
        let pos = self
            .restrictions
            .partition_point(|r| r.range.start <= restriction.range.start);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: RestrictionId) -> Option<RoomRestriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    /// Restrictions overlapping `query`. Skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &RoomRestriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.range.start <= query.end);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.range.overlaps(query))
    }
}

/// WAL record format. One event is one atomic unit of durability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        room: Room,
    },
    ReservationInserted {
        reservation: Reservation,
    },
    ReservationDeleted {
        id: ReservationId,
    },
    RestrictionAdded {
        restriction: RoomRestriction,
    },
    /// Reservation and its restriction, written together.
    BookingCommitted {
        reservation: Reservation,
        restriction: RoomRestriction,
    },
    /// Written at the head of a compacted log so deleted ids are never reused.
    SequencesAdvanced {
        next_reservation_id: ReservationId,
        next_restriction_id: RestrictionId,
    },
}
