use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// True iff no restriction on the room overlaps `query`.
pub fn is_available(rs: &RoomState, query: &DateRange) -> bool {
    rs.overlapping(query).next().is_none()
}

/// Filter rooms down to those free over `query`, ordered by room id.
///
/// Takes already-locked room states so callers decide how to lock.
pub fn available_rooms<'a, I>(rooms: I, query: &DateRange) -> Vec<Room>
where
    I: IntoIterator<Item = &'a RoomState>,
{
    let mut free: Vec<Room> = rooms
        .into_iter()
        .filter(|rs| is_available(rs, query))
        .map(|rs| rs.room.clone())
        .collect();
    free.sort_by_key(|r| r.id);
    free
}
