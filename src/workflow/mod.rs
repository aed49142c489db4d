
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::forms::{Form, FormErrors};
use crate::limits::{MAX_FIELD_LEN, MAX_RANGE_DAYS};
use crate::model::*;
use crate::observability;
use crate::repository::{Entity, RepoError, Repository};
use crate::session::{Session, SessionError, SessionKey};

pub const SEARCH_PATH: &str = "/search-availability";
pub const MAKE_RESERVATION_PATH: &str = "/make-reservation";
pub const SUMMARY_PATH: &str = "/reservation-summary";

pub const NO_AVAILABILITY: &str = "No Availability";
pub const ROOM_TAKEN: &str = "Sorry, that room was just booked for those dates";
pub const SESSION_MISSING_NOTICE: &str = "Can't get reservation from session";
pub const UNKNOWN_ROOM: &str = "This room does not exist";

/// The guest's in-flight reservation.
pub const RESERVATION: SessionKey<SessionReservation> = SessionKey::new("reservation");
/// One notice shown on the next search page.
pub const FLASH: SessionKey<String> = SessionKey::new("flash");

const GUEST_FIELDS: [&str; 4] = ["first_name", "last_name", "email", "phone"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionReservation {
    Draft {
        range: DateRange,
        room: Option<Room>,
    },
    /// Persisted; kept only until the summary page reads it.
    Committed {
        reservation: Reservation,
        room: Room,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStage {
    Searching,
    Results,
    RoomChosen,
    DetailsEntered,
    Committed,
}

impl BookingStage {
    /// Where a session stands, judged by what it carries.
    pub fn of(session: &Session) -> Self {
        match session.get(&RESERVATION) {
            Ok(SessionReservation::Draft { room: None, .. }) => BookingStage::Results,
            Ok(SessionReservation::Draft { room: Some(_), .. }) => BookingStage::RoomChosen,
            Ok(SessionReservation::Committed { .. }) => BookingStage::Committed,
            Err(_) => BookingStage::Searching,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStage::Searching => "searching",
            BookingStage::Results => "results",
            BookingStage::RoomChosen => "room_chosen",
            BookingStage::DetailsEntered => "details_entered",
            BookingStage::Committed => "committed",
        }
    }
}

fn transition(session: &Session, from: BookingStage, to: BookingStage) {
    info!(
        session = %session.id(),
        from = from.as_str(),
        to = to.as_str(),
        "booking stage"
    );
    metrics::counter!(
        observability::WORKFLOW_TRANSITIONS_TOTAL,
        "from" => from.as_str(),
        "to" => to.as_str()
    )
    .increment(1);
}

/// A rendered page: template name plus the data it is filled with.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "page", rename_all = "kebab-case")]
pub enum Page {
    SearchAvailability {
        flash: Option<String>,
    },
    ChooseRoom {
        rooms: Vec<Room>,
        start_date: String,
        end_date: String,
    },
    MakeReservation {
        /// Absent only when a rejected form named a room that does not exist.
        room: Option<Room>,
        start_date: String,
        end_date: String,
        values: BTreeMap<String, String>,
        errors: FormErrors,
    },
    ReservationSummary {
        reservation: Reservation,
        room: Room,
        start_date: String,
        end_date: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Render(Page),
    Redirect(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AvailabilityResponse {
    pub ok: bool,
    pub message: String,
    pub room_id: String,
    pub start_date: String,
    pub end_date: String,
}

impl AvailabilityResponse {
    /// Echo the raw request values back with the reason it was not answered.
    pub fn rejected(start: &str, end: &str, room_id: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            room_id: room_id.to_string(),
            start_date: start.to_string(),
            end_date: end.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// A date or id in the request did not parse. Nothing was persisted.
    MalformedRequest(String),
    /// The session does not hold the state this step needs.
    SessionMissing,
    /// No session could be started for the guest.
    SessionsExhausted,
    NotFound(Entity),
    Storage(RepoError),
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowError::MalformedRequest(msg) => write!(f, "malformed request: {msg}"),
            WorkflowError::SessionMissing => write!(f, "no reservation in session"),
            WorkflowError::SessionsExhausted => write!(f, "session store is full"),
            WorkflowError::NotFound(entity) => write!(f, "{entity} not found"),
            WorkflowError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl From<RepoError> for WorkflowError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::NotFound(entity) => WorkflowError::NotFound(entity),
            RepoError::InvalidRange(range) => {
                WorkflowError::MalformedRequest(format!("invalid date range {range}"))
            }
            other => WorkflowError::Storage(other),
        }
    }
}

impl From<SessionError> for WorkflowError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Missing(_) => WorkflowError::SessionMissing,
            SessionError::Malformed { key, reason } => {
                warn!("discarding malformed session value {key:?}: {reason}");
                WorkflowError::SessionMissing
            }
            SessionError::StoreFull => WorkflowError::SessionsExhausted,
        }
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, WorkflowError> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).map_err(|e| {
        WorkflowError::MalformedRequest(format!("{field}: cannot parse {value:?} as a date: {e}"))
    })
}

fn parse_range(start: &str, end: &str) -> Result<DateRange, WorkflowError> {
    let start = parse_date("start", start)?;
    let end = parse_date("end", end)?;
    let range = DateRange::new(start, end).ok_or_else(|| {
        WorkflowError::MalformedRequest(format!("start date {start} is after end date {end}"))
    })?;
    if range.days() > MAX_RANGE_DAYS {
        return Err(WorkflowError::MalformedRequest(format!(
            "date range {range} is longer than {MAX_RANGE_DAYS} days"
        )));
    }
    Ok(range)
}

fn parse_room_id(value: &str) -> Result<RoomId, WorkflowError> {
    value
        .trim()
        .parse()
        .map_err(|_| WorkflowError::MalformedRequest(format!("invalid room id {value:?}")))
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

/// The reservation stored in session. A malformed value is dropped so the
/// guest can start over.
fn load_reservation(session: &Session) -> Result<SessionReservation, WorkflowError> {
    match session.get(&RESERVATION) {
        Ok(reservation) => Ok(reservation),
        Err(SessionError::Missing(_)) => Err(WorkflowError::SessionMissing),
        Err(e @ SessionError::Malformed { .. }) => {
            session.remove(&RESERVATION);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn flash(session: &Session, message: &str) -> Result<(), WorkflowError> {
    session.put(&FLASH, &message.to_string())?;
    Ok(())
}

/// Steps of the search → choose → details → summary flow.
///
/// Each step gets the caller's session handle; nothing is kept between calls
/// except what the session and the repository hold.
pub struct BookingWorkflow {
    repo: Arc<dyn Repository>,
}

impl BookingWorkflow {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    pub fn search_form(&self, session: &Session) -> Outcome {
        let flash = match session.take(&FLASH) {
            Ok(message) => Some(message),
            Err(SessionError::Missing(_)) => None,
            Err(e) => {
                warn!("dropping flash: {e}");
                None
            }
        };
        Outcome::Render(Page::SearchAvailability { flash })
    }

    pub async fn post_search(
        &self,
        session: &Session,
        start: &str,
        end: &str,
    ) -> Result<Outcome, WorkflowError> {
        let range = parse_range(start, end)?;
        let rooms = self.repo.search_availability_for_all_rooms(range).await?;
        if rooms.is_empty() {
            debug!("no rooms free for {range}");
            flash(session, NO_AVAILABILITY)?;
            return Ok(Outcome::Redirect(SEARCH_PATH));
        }

        let from = BookingStage::of(session);
        session.put(&RESERVATION, &SessionReservation::Draft { range, room: None })?;
        transition(session, from, BookingStage::Results);
        Ok(Outcome::Render(Page::ChooseRoom {
            rooms,
            start_date: format_date(range.start),
            end_date: format_date(range.end),
        }))
    }

    pub async fn availability_json(
        &self,
        start: &str,
        end: &str,
        room_id: &str,
    ) -> Result<AvailabilityResponse, WorkflowError> {
        let range = parse_range(start, end)?;
        let id = parse_room_id(room_id)?;
        let available = self.repo.search_availability_by_room(range, id).await?;
        Ok(AvailabilityResponse {
            ok: available,
            message: "OK!".to_string(),
            room_id: id.to_string(),
            start_date: format_date(range.start),
            end_date: format_date(range.end),
        })
    }

    pub async fn choose_room(
        &self,
        session: &Session,
        room_id: &str,
    ) -> Result<Outcome, WorkflowError> {
        let id = parse_room_id(room_id)?;
        let range = match load_reservation(session)? {
            SessionReservation::Draft { range, .. } => range,
            SessionReservation::Committed { .. } => return Err(WorkflowError::SessionMissing),
        };
        let from = BookingStage::of(session);
        let room = self.repo.get_room_by_id(id).await?;
        self.hold_room(session, from, range, room).await
    }

    /// Direct link into the details form for one room and date range.
    pub async fn book_room(
        &self,
        session: &Session,
        id: &str,
        start: &str,
        end: &str,
    ) -> Result<Outcome, WorkflowError> {
        let id = parse_room_id(id)?;
        let range = parse_range(start, end)?;
        let from = BookingStage::of(session);
        let room = self.repo.get_room_by_id(id).await?;
        self.hold_room(session, from, range, room).await
    }

    /// Attach `room` to the draft if it is still free, else send the guest back
    /// to search.
    async fn hold_room(
        &self,
        session: &Session,
        from: BookingStage,
        range: DateRange,
        room: Room,
    ) -> Result<Outcome, WorkflowError> {
        if !self.repo.search_availability_by_room(range, room.id).await? {
            debug!("room {} no longer free for {range}", room.id);
            session.remove(&RESERVATION);
            flash(session, ROOM_TAKEN)?;
            transition(session, from, BookingStage::Searching);
            return Ok(Outcome::Redirect(SEARCH_PATH));
        }
        session.put(
            &RESERVATION,
            &SessionReservation::Draft {
                range,
                room: Some(room),
            },
        )?;
        transition(session, from, BookingStage::RoomChosen);
        Ok(Outcome::Redirect(MAKE_RESERVATION_PATH))
    }

    pub fn reservation_form(&self, session: &Session) -> Result<Outcome, WorkflowError> {
        match load_reservation(session)? {
            SessionReservation::Draft {
                range,
                room: Some(room),
            } => Ok(Outcome::Render(Page::MakeReservation {
                room: Some(room),
                start_date: format_date(range.start),
                end_date: format_date(range.end),
                values: GUEST_FIELDS
                    .iter()
                    .map(|f| (f.to_string(), String::new()))
                    .collect(),
                errors: FormErrors::default(),
            })),
            _ => Err(WorkflowError::SessionMissing),
        }
    }

    /// Validate the guest's details and commit the reservation.
    ///
    /// Dates and room come from the posted form, not the session draft, and
    /// must parse before anything else happens.
    pub async fn post_reservation(
        &self,
        session: &Session,
        mut form: Form,
    ) -> Result<Outcome, WorkflowError> {
        let range = parse_range(form.get("start_date"), form.get("end_date"))?;
        let room_id = parse_room_id(form.get("room_id"))?;

        form.required(&GUEST_FIELDS);
        form.min_length("first_name", 3);
        form.is_email("email");
        for field in GUEST_FIELDS {
            form.max_length(field, MAX_FIELD_LEN);
        }

        let from = BookingStage::of(session);
        if !form.valid() {
            debug!("reservation form rejected for room {room_id}");
            let room = match self.repo.get_room_by_id(room_id).await {
                Ok(room) => Some(room),
                Err(RepoError::NotFound(_)) => {
                    form.add_error("room_id", UNKNOWN_ROOM);
                    None
                }
                Err(e) => return Err(e.into()),
            };
            let values = GUEST_FIELDS
                .iter()
                .map(|f| (f.to_string(), form.get(f).to_string()))
                .collect();
            return Ok(Outcome::Render(Page::MakeReservation {
                room,
                start_date: format_date(range.start),
                end_date: format_date(range.end),
                values,
                errors: form.into_errors(),
            }));
        }
        let room = self.repo.get_room_by_id(room_id).await?;
        transition(session, from, BookingStage::DetailsEntered);

        let new = NewReservation {
            guest: Guest {
                first_name: form.get("first_name").trim().to_string(),
                last_name: form.get("last_name").trim().to_string(),
                phone: form.get("phone").trim().to_string(),
                email: form.get("email").trim().to_string(),
            },
            range,
            room_id,
        };
        let booking = match self.repo.commit_reservation(&new).await {
            Ok(booking) => booking,
            Err(RepoError::Conflict { restriction_id, .. }) => {
                info!("room {room_id} taken for {range} by restriction {restriction_id}");
                metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                session.remove(&RESERVATION);
                flash(session, ROOM_TAKEN)?;
                transition(session, BookingStage::DetailsEntered, BookingStage::Searching);
                return Ok(Outcome::Redirect(SEARCH_PATH));
            }
            Err(e) => return Err(e.into()),
        };

        metrics::counter!(observability::BOOKINGS_COMMITTED_TOTAL).increment(1);
        session.put(
            &RESERVATION,
            &SessionReservation::Committed {
                reservation: booking.reservation,
                room,
            },
        )?;
        transition(session, BookingStage::DetailsEntered, BookingStage::Committed);
        Ok(Outcome::Redirect(SUMMARY_PATH))
    }

    /// Show the committed reservation once. A reload finds nothing.
    pub fn reservation_summary(&self, session: &Session) -> Result<Outcome, WorkflowError> {
        let (reservation, room) = match session.take(&RESERVATION)? {
            SessionReservation::Committed { reservation, room } => (reservation, room),
            draft @ SessionReservation::Draft { .. } => {
                // Not ours to consume.
                session.put(&RESERVATION, &draft)?;
                return Err(WorkflowError::SessionMissing);
            }
        };
        transition(session, BookingStage::Committed, BookingStage::Searching);
        Ok(Outcome::Render(Page::ReservationSummary {
            start_date: format_date(reservation.range.start),
            end_date: format_date(reservation.range.end),
            reservation,
            room,
        }))
    }
}
