use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use tower::ServiceExt;
use ulid::Ulid;

use bookings::engine::Engine;
use bookings::http::{AppState, router};
use bookings::model::Room;
use bookings::repository::{MemoryRepository, Repository};
use bookings::session::SessionStore;
use bookings::workflow::BookingWorkflow;

// ── Test infrastructure ──────────────────────────────────────

fn rooms() -> Vec<Room> {
    vec![
        Room {
            id: 1,
            name: "General's Quarters".into(),
        },
        Room {
            id: 2,
            name: "Major's Suite".into(),
        },
    ]
}

fn sessions() -> Arc<SessionStore> {
    Arc::new(SessionStore::new(Duration::from_secs(3600)))
}

fn app_with_sessions(
    repo: Arc<dyn Repository>,
    sessions: Arc<SessionStore>,
    max_in_flight: usize,
) -> Router {
    let workflow = Arc::new(BookingWorkflow::new(repo));
    router(AppState::new(workflow, sessions, max_in_flight, false))
}

fn app_with(repo: Arc<dyn Repository>, max_in_flight: usize) -> Router {
    app_with_sessions(repo, sessions(), max_in_flight)
}

fn app() -> (Router, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::with_rooms(rooms()));
    (app_with(repo.clone(), 64), repo)
}

/// A browser that remembers the session cookie between requests.
struct Guest {
    app: Router,
    cookie: Option<String>,
}

impl Guest {
    fn new(app: Router) -> Self {
        Self { app, cookie: None }
    }

    async fn send(&mut self, req: axum::http::request::Builder, body: Body) -> Response<Body> {
        let req = match &self.cookie {
            Some(c) => req.header(COOKIE, c),
            None => req,
        };
        let response = self.app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        if let Some(set) = response.headers().get(SET_COOKIE) {
            let pair = set.to_str().unwrap().split(';').next().unwrap().to_string();
            self.cookie = Some(pair);
        }
        response
    }

    async fn get(&mut self, uri: &str) -> Response<Body> {
        self.send(Request::get(uri), Body::empty()).await
    }

    async fn post(&mut self, uri: &str, form: &str) -> Response<Body> {
        let req = Request::post(uri).header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        self.send(req, Body::from(form.to_string())).await
    }
}

async fn json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn location(response: &Response<Body>) -> &str {
    response.headers().get(LOCATION).unwrap().to_str().unwrap()
}

const DETAILS: &str = "first_name=Grace&last_name=Hopper&phone=555-0199\
    &email=grace%40example.com&start_date=2024-06-01&end_date=2024-06-05&room_id=2";

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn first_write_sets_session_cookie() {
    let (app, _) = app();
    let response = app
        .clone()
        .oneshot(Request::get("/search-availability").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(SET_COOKIE).is_none());
    let body = json(response).await;
    assert_eq!(body["page"], "search-availability");
    assert!(body["flash"].is_null());

    let response = app
        .oneshot(
            Request::post("/search-availability")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from("start=2024-06-01&end=2024-06-05"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
    assert!(cookie.starts_with("bookings_session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(!cookie.contains("Secure"));
}

#[tokio::test]
async fn cookieless_reads_leave_session_store_empty() {
    let repo = Arc::new(MemoryRepository::with_rooms(rooms()));
    let sessions = sessions();
    let mut guest = Guest::new(app_with_sessions(repo, sessions.clone(), 64));

    for _ in 0..3 {
        let response = guest
            .get("/search-availability-json?start=2024-06-01&end=2024-06-05&room_id=1")
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(SET_COOKIE).is_none());
    }
    guest.get("/search-availability").await;
    assert_eq!(sessions.len(), 0);
    assert_eq!(guest.cookie, None);
}

#[tokio::test]
async fn full_session_store_only_refuses_new_writers() {
    let repo = Arc::new(MemoryRepository::with_rooms(rooms()));
    let sessions = Arc::new(SessionStore::with_capacity(Duration::from_secs(3600), 1));
    let app = app_with_sessions(repo, sessions.clone(), 64);
    let mut alice = Guest::new(app.clone());
    let mut bob = Guest::new(app);

    let response = alice
        .post("/search-availability", "start=2024-06-01&end=2024-06-05")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sessions.len(), 1);

    // reading pages still works for everyone
    assert_eq!(bob.get("/search-availability").await.status(), StatusCode::OK);
    let response = bob
        .post("/search-availability", "start=2024-06-01&end=2024-06-05")
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(bob.cookie, None);

    // the guest who already has a session carries on
    let response = alice.get("/choose-room/1").await;
    assert_eq!(location(&response), "/make-reservation");
}

#[tokio::test]
async fn unknown_path_is_404_and_still_limited() {
    let (app, _) = app();
    let response = app
        .oneshot(Request::get("/no-such-page").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let repo = Arc::new(MemoryRepository::with_rooms(rooms()));
    let response = app_with(repo, 0)
        .oneshot(Request::get("/no-such-page").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn full_booking_over_http() {
    let (app, repo) = app();
    let mut guest = Guest::new(app);

    let response = guest
        .post("/search-availability", "start=2024-06-01&end=2024-06-05")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["page"], "choose-room");
    assert_eq!(body["rooms"].as_array().unwrap().len(), 2);

    let response = guest.get("/choose-room/2").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/make-reservation");

    let body = json(guest.get("/make-reservation").await).await;
    assert_eq!(body["page"], "make-reservation");
    assert_eq!(body["room"]["name"], "Major's Suite");
    assert_eq!(body["start_date"], "2024-06-01");

    let response = guest.post("/make-reservation", DETAILS).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/reservation-summary");
    assert_eq!(repo.reservations().len(), 1);
    assert_eq!(repo.restrictions().await.len(), 1);

    let body = json(guest.get("/reservation-summary").await).await;
    assert_eq!(body["page"], "reservation-summary");
    assert_eq!(body["reservation"]["guest"]["first_name"], "Grace");
    assert_eq!(body["room"]["id"], 2);

    // read-once: a reload bounces to search with a notice
    let response = guest.get("/reservation-summary").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/search-availability");
    let body = json(guest.get("/search-availability").await).await;
    assert_eq!(body["flash"], "Can't get reservation from session");
}

#[tokio::test]
async fn invalid_details_rerender_with_errors() {
    let (app, repo) = app();
    let mut guest = Guest::new(app);
    guest.get("/book-room?id=2&s=2024-06-01&e=2024-06-05").await;

    let response = guest
        .post("/make-reservation", &DETAILS.replace("Grace", "Al"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["page"], "make-reservation");
    assert_eq!(
        body["errors"]["first_name"][0],
        "This field must be at least 3 characters long"
    );
    assert_eq!(body["values"]["first_name"], "Al");
    assert_eq!(repo.insert_count(), 0);
}

#[tokio::test]
async fn no_availability_redirects_with_flash() {
    let repo = Arc::new(MemoryRepository::with_rooms(Vec::new()));
    let mut guest = Guest::new(app_with(repo, 8));

    let response = guest
        .post("/search-availability", "start=2024-06-01&end=2024-06-05")
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/search-availability");

    let body = json(guest.get("/search-availability").await).await;
    assert_eq!(body["flash"], "No Availability");

    // no draft was stored
    let response = guest.get("/make-reservation").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn malformed_and_unknown_inputs_map_to_status_codes() {
    let (app, _) = app();
    let mut guest = Guest::new(app);

    let response = guest
        .post("/search-availability", "start=junk&end=2024-06-05")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = guest.get("/book-room?id=9&s=2024-06-01&e=2024-06-05").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = guest.get("/book-room?id=two&s=2024-06-01&e=2024-06-05").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = guest.get("/choose-room/1").await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(location(&response), "/search-availability");
}

#[tokio::test]
async fn availability_json_shapes() {
    let (app, _) = app();
    let mut guest = Guest::new(app);

    let response = guest
        .get("/search-availability-json?start=2024-06-01&end=2024-06-05&room_id=1")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["room_id"], "1");
    assert_eq!(body["start_date"], "2024-06-01");
    assert_eq!(body["end_date"], "2024-06-05");

    let response = guest
        .get("/search-availability-json?start=bad&end=2024-06-05&room_id=1")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await;
    assert_eq!(body["ok"], false);
    assert_eq!(body["start_date"], "bad");
    assert!(body["message"].as_str().unwrap().contains("malformed"));

    let response = guest
        .get("/search-availability-json?start=2024-06-01&end=2024-06-05&room_id=77")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json(response).await["ok"], false);
}

#[tokio::test]
async fn sessions_are_per_cookie() {
    let (app, _) = app();
    let mut alice = Guest::new(app.clone());
    let mut bob = Guest::new(app);

    alice
        .post("/search-availability", "start=2024-06-01&end=2024-06-05")
        .await;
    bob.get("/search-availability").await;
    assert_ne!(alice.cookie, bob.cookie);

    let response = bob.get("/choose-room/1").await;
    assert_eq!(location(&response), "/search-availability");
    let response = alice.get("/choose-room/1").await;
    assert_eq!(location(&response), "/make-reservation");
}

#[tokio::test]
async fn zero_capacity_rejects_with_503() {
    let repo = Arc::new(MemoryRepository::with_rooms(rooms()));
    let app = app_with(repo, 0);
    let response = app
        .oneshot(Request::get("/search-availability").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn concurrent_guests_cannot_double_book_over_engine() {
    let dir = std::env::temp_dir().join(format!("bookings_http_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("bookings.wal")).unwrap());
    for room in rooms() {
        engine.create_room(room).await.unwrap();
    }
    let app = app_with(engine.clone(), 64);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let mut guest = Guest::new(app);
            guest.get("/book-room?id=1&s=2024-06-01&e=2024-06-05").await;
            let details = DETAILS.replace("room_id=2", "room_id=1");
            let response = guest.post("/make-reservation", &details).await;
            location(&response).to_string()
        }));
    }
    let mut committed = 0;
    for task in tasks {
        if task.await.unwrap() == "/reservation-summary" {
            committed += 1;
        }
    }
    assert_eq!(committed, 1);
    assert_eq!(engine.reservation_count(), 1);
}
