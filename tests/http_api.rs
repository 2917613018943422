use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode as StubStatus;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use ulid::Ulid;

use gymsched::api;
use gymsched::config::RemoteConfig;
use gymsched::engine::{Engine, EngineOptions};
use gymsched::events::{EventKind, SessionEvent};
use gymsched::gateway::{HttpDirectory, VerificationGateway};
use gymsched::publisher::InMemoryPublisher;

// ── Test infrastructure ──────────────────────────────────────

/// Members and Trainers stand-in. `ghost` is unknown, `inactive-*` ids are
/// not ACTIVE, and trainer `t-busy` is never available.
async fn start_directory_stub() -> SocketAddr {
    async fn member(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "ghost" => StubStatus::NOT_FOUND.into_response(),
            id if id.starts_with("inactive") => {
                Json(json!({ "member": { "status": "SUSPENDED" } })).into_response()
            }
            _ => Json(json!({ "member": { "status": "ACTIVE" } })).into_response(),
        }
    }
    async fn trainer(Path(id): Path<String>) -> impl IntoResponse {
        match id.as_str() {
            "ghost" => StubStatus::NOT_FOUND.into_response(),
            id if id.starts_with("inactive") => {
                Json(json!({ "status": "ON_LEAVE" })).into_response()
            }
            _ => Json(json!({ "status": "ACTIVE" })).into_response(),
        }
    }
    async fn available(Path(id): Path<String>) -> Json<Value> {
        Json(json!({ "available": id != "t-busy" }))
    }

    let app = Router::new()
        .route("/api/members/:id/profile", get(member))
        .route("/api/trainers/:id", get(trainer))
        .route("/api/trainers/:id/available", get(available));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

struct TestServer {
    base: String,
    http: reqwest::Client,
    events: broadcast::Receiver<SessionEvent>,
}

async fn start_test_server() -> TestServer {
    let stub = start_directory_stub().await;
    let remote = RemoteConfig {
        members_url: format!("http://{stub}"),
        trainers_url: format!("http://{stub}"),
        connect_timeout_ms: 1_000,
        timeout_ms: 2_000,
    };

    let dir = std::env::temp_dir().join(format!("gymsched_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();

    let publisher = Arc::new(InMemoryPublisher::new());
    let events = publisher.subscribe();
    let engine = Engine::new(
        dir.join("sessions.wal"),
        VerificationGateway::new(Arc::new(HttpDirectory::new(&remote).unwrap())),
        publisher,
        EngineOptions::default(),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = api::router(Arc::new(engine), 64);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    TestServer {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        events,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn book(&self, body: Value) -> reqwest::Response {
        self.http
            .post(self.url("/api/sessions/book"))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.http.post(self.url(path)).send().await.unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.unwrap()
    }

    /// Wait for the next lifecycle event with timeout.
    async fn next_event(&mut self) -> Option<SessionEvent> {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .ok()
            .and_then(Result::ok)
    }
}

fn booking(member: &str, trainer: &str, start: &str, end: &str) -> Value {
    json!({
        "memberId": member,
        "trainerId": trainer,
        "startTime": start,
        "endTime": end,
    })
}

fn id_of(body: &Value) -> String {
    body["id"].as_str().unwrap().to_string()
}

// ── Booking ──────────────────────────────────────────────────

#[tokio::test]
async fn book_returns_created_and_publishes() {
    let mut server = start_test_server().await;

    let resp = server
        .book(json!({
            "memberId": "m1",
            "trainerId": "t1",
            "startTime": "2031-01-10T10:00:00Z",
            "endTime": "2031-01-10T11:00:00Z",
            "sessionType": "PERSONAL",
            "focusArea": "legs",
        }))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "SCHEDULED");
    assert_eq!(body["memberId"], "m1");
    assert_eq!(body["focusArea"], "legs");
    assert!(body["participants"].as_array().unwrap().is_empty());

    let event = server.next_event().await.expect("scheduled event");
    assert_eq!(event.kind(), EventKind::Scheduled);
    assert_eq!(event.session_id.to_string(), id_of(&body));

    let resp = server.get(&format!("/api/sessions/{}", id_of(&body))).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let fetched: Value = resp.json().await.unwrap();
    assert_eq!(fetched["id"], body["id"]);
}

#[tokio::test]
async fn trainer_double_booking_conflicts() {
    let server = start_test_server().await;

    let first = server
        .book(booking("m1", "t1", "2031-01-10T10:00:00Z", "2031-01-10T11:00:00Z"))
        .await;
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = server
        .book(booking("m2", "t1", "2031-01-10T10:00:00Z", "2031-01-10T11:00:00Z"))
        .await;
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let err: Value = second.json().await.unwrap();
    assert_eq!(err["status"], 409);
    assert_eq!(err["error"], "Conflict");
    assert!(err["message"].as_str().unwrap().contains("trainer"));
    assert!(err["timestamp"].is_string());
}

#[tokio::test]
async fn remote_rejections_are_conflicts() {
    let server = start_test_server().await;
    let window = ("2031-01-11T10:00:00Z", "2031-01-11T11:00:00Z");

    for (member, trainer) in [
        ("ghost", "t1"),
        ("inactive-1", "t1"),
        ("m1", "ghost"),
        ("m1", "inactive-1"),
        ("m1", "t-busy"),
    ] {
        let resp = server.book(booking(member, trainer, window.0, window.1)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT, "{member}/{trainer}");
    }

    let list: Value = server.get("/api/sessions").await.json().await.unwrap();
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_requests_are_bad_requests() {
    let server = start_test_server().await;

    let resp = server
        .http
        .post(server.url("/api/sessions/book"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["status"], 400);
    assert_eq!(err["error"], "Bad Request");

    let resp = server
        .book(json!({ "memberId": "m1", "trainerId": "t1" }))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .book(booking("m1", "t1", "2031-01-10T11:00:00Z", "2031-01-10T10:00:00Z"))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .book(booking("m1", "t1", "2001-01-10T10:00:00Z", "2001-01-10T11:00:00Z"))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_and_malformed_ids_are_not_found() {
    let server = start_test_server().await;

    let resp = server.get(&format!("/api/sessions/{}", Ulid::new())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: Value = resp.json().await.unwrap();
    assert_eq!(err["status"], 404);

    let resp = server.get("/api/sessions/not-an-id").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server.post(&format!("/api/sessions/{}/confirm", Ulid::new())).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// ── Lifecycle ────────────────────────────────────────────────

#[tokio::test]
async fn confirm_complete_then_cancel_is_rejected() {
    let mut server = start_test_server().await;

    let body: Value = server
        .book(booking("m1", "t1", "2031-01-12T10:00:00Z", "2031-01-12T11:00:00Z"))
        .await
        .json()
        .await
        .unwrap();
    let id = id_of(&body);
    assert_eq!(server.next_event().await.unwrap().kind(), EventKind::Scheduled);

    let resp = server.post(&format!("/api/sessions/{id}/confirm")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let confirmed: Value = resp.json().await.unwrap();
    assert_eq!(confirmed["status"], "IN_PROGRESS");

    let resp = server
        .http
        .post(server.url(&format!("/api/sessions/{id}/complete")))
        .json(&json!({ "caloriesBurned": 420, "sessionNotes": "good form" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let completed: Value = resp.json().await.unwrap();
    assert_eq!(completed["status"], "COMPLETED");
    assert_eq!(completed["caloriesBurned"], 420);
    assert_eq!(completed["sessionNotes"], "good form");
    assert_eq!(server.next_event().await.unwrap().kind(), EventKind::Completed);

    let resp = server.post(&format!("/api/sessions/{id}/cancel")).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn cancel_without_body_uses_default_reason() {
    let mut server = start_test_server().await;

    let body: Value = server
        .book(booking("m1", "t1", "2031-01-13T10:00:00Z", "2031-01-13T11:00:00Z"))
        .await
        .json()
        .await
        .unwrap();
    let id = id_of(&body);
    server.next_event().await.unwrap();

    let resp = server.post(&format!("/api/sessions/{id}/cancel")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cancelled: Value = resp.json().await.unwrap();
    assert_eq!(cancelled["status"], "CANCELLED");
    assert_eq!(cancelled["sessionNotes"], "Cancelled by user");
    assert_eq!(server.next_event().await.unwrap().kind(), EventKind::Cancelled);

    // Cancelled sessions free the slot.
    let resp = server
        .book(booking("m2", "t1", "2031-01-13T10:00:00Z", "2031-01-13T11:00:00Z"))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);
}

#[tokio::test]
async fn reschedule_moves_window() {
    let mut server = start_test_server().await;

    let body: Value = server
        .book(booking("m1", "t1", "2031-01-14T10:00:00Z", "2031-01-14T11:00:00Z"))
        .await
        .json()
        .await
        .unwrap();
    let id = id_of(&body);
    server.next_event().await.unwrap();

    let resp = server
        .http
        .put(server.url(&format!("/api/sessions/{id}/reschedule")))
        .json(&json!({
            "startTime": "2031-01-14T15:00:00Z",
            "endTime": "2031-01-14T16:30:00Z",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let moved: Value = resp.json().await.unwrap();
    assert_eq!(moved["startTime"], "2031-01-14T15:00:00Z");
    assert_eq!(moved["endTime"], "2031-01-14T16:30:00Z");
    assert_eq!(server.next_event().await.unwrap().kind(), EventKind::Rescheduled);

    let resp = server
        .http
        .put(server.url(&format!("/api/sessions/{id}/reschedule")))
        .json(&json!({
            "startTime": "2031-01-14T17:00:00Z",
            "endTime": "2031-01-14T16:00:00Z",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

// ── Participants ─────────────────────────────────────────────

#[tokio::test]
async fn group_participant_lifecycle() {
    let server = start_test_server().await;

    let mut body = booking("m1", "t1", "2031-01-15T10:00:00Z", "2031-01-15T11:00:00Z");
    body["sessionType"] = json!("GROUP");
    let session: Value = server.book(body).await.json().await.unwrap();
    let id = id_of(&session);

    let resp = server.post(&format!("/api/sessions/{id}/participants/m7")).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let participant: Value = resp.json().await.unwrap();
    assert_eq!(participant["memberId"], "m7");
    assert_eq!(participant["status"], "CONFIRMED");
    let pid = id_of(&participant);

    let resp = server.post(&format!("/api/sessions/{id}/participants/m7")).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = server
        .post(&format!("/api/sessions/{id}/participants/{pid}/attend"))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let attended: Value = resp.json().await.unwrap();
    assert_eq!(attended["status"], "ATTENDED");
    assert!(attended["attendedAt"].is_string());

    let resp = server
        .post(&format!("/api/sessions/{id}/participants/{pid}/cancel"))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let list: Value = server
        .get(&format!("/api/sessions/{id}/participants"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    let resp = server
        .http
        .delete(server.url(&format!("/api/sessions/{id}/participants/{pid}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = server
        .http
        .delete(server.url(&format!("/api/sessions/{id}/participants/{pid}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn personal_session_rejects_participants() {
    let server = start_test_server().await;

    let session: Value = server
        .book(booking("m1", "t1", "2031-01-16T10:00:00Z", "2031-01-16T11:00:00Z"))
        .await
        .json()
        .await
        .unwrap();
    let resp = server
        .post(&format!("/api/sessions/{}/participants/m2", id_of(&session)))
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

// ── Queries ──────────────────────────────────────────────────

#[tokio::test]
async fn list_and_availability() {
    let server = start_test_server().await;

    for (member, trainer, start, end) in [
        ("m1", "t1", "2031-01-17T12:00:00Z", "2031-01-17T13:00:00Z"),
        ("m1", "t2", "2031-01-17T09:00:00Z", "2031-01-17T10:00:00Z"),
        ("m2", "t1", "2031-01-17T15:00:00Z", "2031-01-17T16:00:00Z"),
    ] {
        let resp = server.book(booking(member, trainer, start, end)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
    }

    let all: Value = server.get("/api/sessions").await.json().await.unwrap();
    assert_eq!(all.as_array().unwrap().len(), 3);

    let mine: Value = server
        .get("/api/sessions?memberId=m1")
        .await
        .json()
        .await
        .unwrap();
    let starts: Vec<&str> = mine
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["startTime"].as_str().unwrap())
        .collect();
    assert_eq!(starts, ["2031-01-17T09:00:00Z", "2031-01-17T12:00:00Z"]);

    let theirs: Value = server
        .get("/api/sessions?trainerId=t1")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(theirs.as_array().unwrap().len(), 2);

    let busy: Value = server
        .http
        .get(server.url("/api/sessions/availability"))
        .query(&[
            ("trainerId", "t1"),
            ("startTime", "2031-01-17T12:00:00Z"),
            ("endTime", "2031-01-17T13:00:00Z"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(busy["available"], false);
    assert_eq!(busy["trainerId"], "t1");

    let free: Value = server
        .http
        .get(server.url("/api/sessions/availability"))
        .query(&[
            ("memberId", "m2"),
            ("startTime", "2031-01-17T09:00:00Z"),
            ("endTime", "2031-01-17T10:00:00Z"),
        ])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(free["available"], true);

    let resp = server
        .http
        .get(server.url("/api/sessions/availability"))
        .query(&[("startTime", "2031-01-17T09:00:00Z"), ("endTime", "2031-01-17T10:00:00Z")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn availability_ignores_blank_party_ids() {
    let server = start_test_server().await;
    let resp = server
        .book(booking("m1", "t1", "2031-01-18T10:00:00Z", "2031-01-18T11:00:00Z"))
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let window = [("startTime", "2031-01-18T10:00:00Z"), ("endTime", "2031-01-18T11:00:00Z")];
    let availability = |params: Vec<(&'static str, &'static str)>| {
        server
            .http
            .get(server.url("/api/sessions/availability"))
            .query(&params)
            .query(&window)
            .send()
    };

    for params in [
        vec![("memberId", "")],
        vec![("trainerId", "  ")],
        vec![("memberId", ""), ("trainerId", "")],
    ] {
        let resp = availability(params).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    // A blank member filter falls back to the named trainer.
    let body: Value = availability(vec![("memberId", ""), ("trainerId", "t1")])
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["available"], false);
    assert_eq!(body["trainerId"], "t1");
    assert!(body.get("memberId").is_none());
}

#[tokio::test]
async fn health_reports_up() {
    let server = start_test_server().await;
    let resp = server.get("/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "UP");
}
