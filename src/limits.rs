//! Hard caps that keep a single request or a single room from growing without bound.

pub const MAX_ROOMS: usize = 10_000;
pub const MAX_ROOM_NAME_LEN: usize = 255;
pub const MAX_RESTRICTIONS_PER_ROOM: usize = 100_000;

/// Widest date range accepted for a search, stay or owner block, in days.
pub const MAX_RANGE_DAYS: i64 = 730;

/// Longest accepted value for a guest contact field, in characters.
pub const MAX_FIELD_LEN: usize = 255;

pub const MAX_SESSIONS: usize = 1_000_000;
