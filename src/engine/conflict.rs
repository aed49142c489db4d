use crate::limits::*;
use crate::model::*;
use crate::repository::RepoError;

pub(crate) fn validate_range(range: &DateRange) -> Result<(), RepoError> {
    if range.start > range.end {
        return Err(RepoError::InvalidRange(*range));
    }
    if range.days() > MAX_RANGE_DAYS {
        return Err(RepoError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

pub(crate) fn validate_guest(guest: &Guest) -> Result<(), RepoError> {
    let fields = [
        &guest.first_name,
        &guest.last_name,
        &guest.phone,
        &guest.email,
    ];
    if fields.iter().any(|f| f.chars().count() > MAX_FIELD_LEN) {
        return Err(RepoError::LimitExceeded("guest field too long"));
    }
    Ok(())
}

/// Any restriction overlapping `range` is a conflict; rooms hold one booking per day.
pub(crate) fn check_no_conflict(rs: &RoomState, range: &DateRange) -> Result<(), RepoError> {
    match rs.overlapping(range).next() {
        Some(existing) => Err(RepoError::Conflict {
            room_id: rs.room.id,
            restriction_id: existing.id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_room_capacity(rs: &RoomState) -> Result<(), RepoError> {
    if rs.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
        return Err(RepoError::LimitExceeded("too many restrictions on room"));
    }
    Ok(())
}

pub(crate) fn validate_room(room: &Room) -> Result<(), RepoError> {
    if room.name.len() > MAX_ROOM_NAME_LEN {
        return Err(RepoError::LimitExceeded("room name too long"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn reversed_range_is_invalid() {
        let range = DateRange {
            start: d(2024, 6, 5),
            end: d(2024, 6, 1),
        };
        assert!(matches!(validate_range(&range), Err(RepoError::InvalidRange(_))));
    }

    #[test]
    fn overly_wide_range_rejected() {
        let range = DateRange::new(d(2024, 1, 1), d(2030, 1, 1)).unwrap();
        assert!(matches!(validate_range(&range), Err(RepoError::LimitExceeded(_))));
    }

    #[test]
    fn conflict_reports_blocking_restriction() {
        let mut rs = RoomState::new(Room {
            id: 7,
            name: "Suite".into(),
        });
        rs.insert_restriction(RoomRestriction {
            id: 42,
            room_id: 7,
            range: DateRange::new(d(2024, 6, 1), d(2024, 6, 3)).unwrap(),
            kind: RestrictionKind::OwnerBlock,
        });

        let touching = DateRange::new(d(2024, 6, 3), d(2024, 6, 4)).unwrap();
        assert_eq!(
            check_no_conflict(&rs, &touching),
            Err(RepoError::Conflict {
                room_id: 7,
                restriction_id: 42
            })
        );

        let after = DateRange::new(d(2024, 6, 4), d(2024, 6, 6)).unwrap();
        assert!(check_no_conflict(&rs, &after).is_ok());
    }

    #[test]
    fn long_guest_field_rejected() {
        let guest = Guest {
            first_name: "x".repeat(MAX_FIELD_LEN + 1),
            ..Guest::default()
        };
        assert!(validate_guest(&guest).is_err());
        assert!(validate_guest(&Guest::default()).is_ok());
    }
}
