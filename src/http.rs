use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Redirect, Response};
use axum::routing::get;
use axum::{Extension, Router};
use tokio::sync::Semaphore;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, warn};

use crate::forms::Form;
use crate::observability;
use crate::session::{COOKIE_NAME, Session, SessionStore};
use crate::workflow::{
    AvailabilityResponse, BookingWorkflow, FLASH, Outcome, SEARCH_PATH, SESSION_MISSING_NOTICE,
    WorkflowError,
};

#[derive(Clone)]
pub struct AppState {
    pub workflow: Arc<BookingWorkflow>,
    pub sessions: Arc<SessionStore>,
    limiter: Arc<Semaphore>,
    secure_cookies: bool,
}

impl AppState {
    pub fn new(
        workflow: Arc<BookingWorkflow>,
        sessions: Arc<SessionStore>,
        max_in_flight: usize,
        secure_cookies: bool,
    ) -> Self {
        Self {
            workflow,
            sessions,
            limiter: Arc::new(Semaphore::new(max_in_flight)),
            secure_cookies,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let guest_routes = Router::new()
        .route("/search-availability", get(search_form).post(post_search))
        .route("/choose-room/:id", get(choose_room))
        .route("/book-room", get(book_room))
        .route(
            "/make-reservation",
            get(reservation_form).post(post_reservation),
        )
        .route("/reservation-summary", get(reservation_summary))
        .layer(middleware::from_fn_with_state(state.clone(), with_session));

    // The JSON lookup is stateless and never touches the session store.
    Router::new()
        .route("/search-availability-json", get(availability_json))
        .merge(guest_routes)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), limit_in_flight))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

// ── Middleware ───────────────────────────────────────────────

/// Reject with 503 once every slot is taken instead of queueing.
async fn limit_in_flight(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Ok(_permit) = state.limiter.clone().try_acquire_owned() else {
        warn!("request limit reached, rejecting {}", req.uri().path());
        metrics::counter!(observability::REQUESTS_REJECTED_TOTAL).increment(1);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    metrics::gauge!(observability::REQUESTS_IN_FLIGHT).increment(1.0);
    let started = Instant::now();

    let response = next.run(req).await;

    metrics::gauge!(observability::REQUESTS_IN_FLIGHT).decrement(1.0);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    metrics::counter!(
        observability::REQUESTS_TOTAL,
        "route" => route,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

/// Attach the caller's session to the request. The cookie is only set once
/// the handler has written to a fresh session.
async fn with_session(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let cookie = session_cookie(req.headers());
    let session = state.sessions.open(cookie.as_deref());
    req.extensions_mut().insert(session.clone());

    let mut response = next.run(req).await;
    if session.needs_cookie() {
        let mut cookie = format!(
            "{COOKIE_NAME}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            session.id(),
            state.sessions.lifetime().as_secs()
        );
        if state.secure_cookies {
            cookie.push_str("; Secure");
        }
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(SET_COOKIE, value);
            }
            Err(e) => error!("cannot encode session cookie: {e}"),
        }
    }
    response
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == COOKIE_NAME)
        .map(|(_, value)| value.to_string())
}

// ── Outcome mapping ──────────────────────────────────────────

fn status_of(e: &WorkflowError) -> StatusCode {
    match e {
        WorkflowError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
        WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
        WorkflowError::SessionMissing => StatusCode::SEE_OTHER,
        WorkflowError::SessionsExhausted => StatusCode::SERVICE_UNAVAILABLE,
        WorkflowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn render(outcome: Outcome) -> Response {
    match outcome {
        Outcome::Render(page) => Json(page).into_response(),
        Outcome::Redirect(to) => Redirect::to(to).into_response(),
    }
}

fn respond(session: &Session, result: Result<Outcome, WorkflowError>) -> Response {
    let e = match result {
        Ok(outcome) => return render(outcome),
        Err(e) => e,
    };
    match e {
        WorkflowError::SessionMissing => {
            if let Err(e) = session.put(&FLASH, &SESSION_MISSING_NOTICE.to_string()) {
                warn!("cannot store notice: {e}");
            }
            Redirect::to(SEARCH_PATH).into_response()
        }
        WorkflowError::Storage(ref cause) => {
            error!("request failed: {cause}");
            (status_of(&e), "internal error").into_response()
        }
        WorkflowError::SessionsExhausted => {
            warn!("{e}");
            status_of(&e).into_response()
        }
        other => (
            status_of(&other),
            Json(serde_json::json!({ "error": other.to_string() })),
        )
            .into_response(),
    }
}

fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> &'a str {
    params.get(name).map(String::as_str).unwrap_or("")
}

// ── Handlers ─────────────────────────────────────────────────

async fn search_form(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Response {
    render(state.workflow.search_form(&session))
}

async fn post_search(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    axum::Form(fields): axum::Form<Vec<(String, String)>>,
) -> Response {
    let form = Form::from_pairs(fields);
    let result = state
        .workflow
        .post_search(&session, form.get("start"), form.get("end"))
        .await;
    respond(&session, result)
}

async fn availability_json(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (start, end, room_id) = (
        param(&params, "start"),
        param(&params, "end"),
        param(&params, "room_id"),
    );
    match state.workflow.availability_json(start, end, room_id).await {
        Ok(answer) => Json(answer).into_response(),
        Err(e) => {
            let message = match &e {
                WorkflowError::Storage(cause) => {
                    error!("availability lookup failed: {cause}");
                    "internal error".to_string()
                }
                other => other.to_string(),
            };
            let status = match e {
                WorkflowError::SessionMissing => StatusCode::BAD_REQUEST,
                ref other => status_of(other),
            };
            (
                status,
                Json(AvailabilityResponse::rejected(start, end, room_id, message)),
            )
                .into_response()
        }
    }
}

async fn choose_room(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Response {
    let result = state.workflow.choose_room(&session, &id).await;
    respond(&session, result)
}

async fn book_room(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let result = state
        .workflow
        .book_room(
            &session,
            param(&params, "id"),
            param(&params, "s"),
            param(&params, "e"),
        )
        .await;
    respond(&session, result)
}

async fn reservation_form(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Response {
    respond(&session, state.workflow.reservation_form(&session))
}

async fn post_reservation(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    axum::Form(fields): axum::Form<Vec<(String, String)>>,
) -> Response {
    let result = state
        .workflow
        .post_reservation(&session, Form::from_pairs(fields))
        .await;
    respond(&session, result)
}

async fn reservation_summary(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Response {
    respond(&session, state.workflow.reservation_summary(&session))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cookie_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; bookings_session=01HZX; lang=en"),
        );
        assert_eq!(session_cookie(&headers).as_deref(), Some("01HZX"));
    }

    #[test]
    fn missing_session_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("theme=dark"));
        assert_eq!(session_cookie(&headers), None);
        assert_eq!(session_cookie(&HeaderMap::new()), None);
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_of(&WorkflowError::MalformedRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&WorkflowError::NotFound(crate::repository::Entity::Room(1))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(&WorkflowError::Storage(crate::repository::RepoError::Storage(
                "disk".into()
            ))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_of(&WorkflowError::SessionsExhausted),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
