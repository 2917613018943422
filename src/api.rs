//! REST surface under `/api/sessions`.
//!
//! Handlers are thin: decode, call the engine, map the result. All error
//! bodies share one shape: `{timestamp, status, error, message}`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::engine::{BookingRequest, Engine, EngineError, RescheduleRequest};
use crate::model::*;
use crate::observability;

// ── Errors ───────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        metrics::counter!(observability::ENGINE_ERRORS_TOTAL, "kind" => observability::error_label(&err))
            .increment(1);
        let status = match &err {
            EngineError::SessionNotFound(_) | EngineError::ParticipantNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            EngineError::Conflict(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::InvalidParticipantState { .. } => StatusCode::CONFLICT,
            EngineError::InvalidInput(_) | EngineError::LimitExceeded(_) => {
                StatusCode::BAD_REQUEST
            }
            EngineError::WalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub timestamp: Instant,
    pub status: u16,
    pub error: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, message = %self.message, "request failed");
        }
        let body = ErrorBody {
            timestamp: Utc::now(),
            status: self.status.as_u16(),
            error: self
                .status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Transport objects ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantView {
    pub id: Ulid,
    pub session_id: Ulid,
    pub member_id: String,
    pub status: ParticipantStatus,
    pub registered_at: Instant,
    pub attended_at: Option<Instant>,
}

impl From<SessionParticipant> for ParticipantView {
    fn from(p: SessionParticipant) -> Self {
        Self {
            id: p.id,
            session_id: p.session_id,
            member_id: p.member_id,
            status: p.status,
            registered_at: p.registered_at,
            attended_at: p.attended_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: Ulid,
    pub member_id: String,
    pub trainer_id: String,
    pub start_time: Instant,
    pub end_time: Instant,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub session_notes: Option<String>,
    pub calories_burned: Option<u32>,
    pub focus_area: Option<String>,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub participants: Vec<ParticipantView>,
}

impl From<Session> for SessionView {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            member_id: s.member_id,
            trainer_id: s.trainer_id,
            start_time: s.span.start,
            end_time: s.span.end,
            session_type: s.session_type,
            status: s.status,
            session_notes: s.session_notes,
            calories_burned: s.calories_burned,
            focus_area: s.focus_area,
            created_at: s.created_at,
            updated_at: s.updated_at,
            participants: s.participants.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookSessionBody {
    #[serde(default)]
    pub member_id: String,
    #[serde(default)]
    pub trainer_id: String,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    #[serde(default)]
    pub session_type: SessionType,
    pub focus_area: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RescheduleBody {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub focus_area: Option<String>,
    pub session_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody {
    pub calories_burned: Option<u32>,
    pub session_notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub member_id: Option<String>,
    pub trainer_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    pub member_id: Option<String>,
    pub trainer_id: Option<String>,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trainer_id: Option<String>,
    pub available: bool,
}

/// An absent or empty body decodes to `T::default()`.
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {e}")))
}

fn session_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw).map_err(|_| ApiError::not_found(format!("session not found: {raw}")))
}

fn participant_id(raw: &str) -> ApiResult<Ulid> {
    Ulid::from_string(raw)
        .map_err(|_| ApiError::not_found(format!("participant not found: {raw}")))
}

// ── Router ───────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

pub fn router(engine: Arc<Engine>, max_in_flight: usize) -> Router {
    let sessions = Router::new()
        .route("/", get(list_sessions))
        .route("/book", post(book_session))
        .route("/availability", get(availability))
        .route("/:id", get(get_session))
        .route("/:id/confirm", post(confirm_session))
        .route("/:id/reschedule", put(reschedule_session))
        .route("/:id/cancel", post(cancel_session))
        .route("/:id/complete", post(complete_session))
        .route("/:id/participants", get(get_participants))
        // POST takes a member id, the rest a participant id.
        .route(
            "/:id/participants/:subject",
            post(add_participant).delete(remove_participant),
        )
        .route("/:id/participants/:subject/attend", post(mark_attended))
        .route("/:id/participants/:subject/absent", post(mark_absent))
        .route("/:id/participants/:subject/cancel", post(cancel_participation));

    Router::new()
        .nest("/api/sessions", sessions)
        .route("/health", get(health))
        .route_layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .with_state(AppState { engine })
}

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().to_string();

    metrics::gauge!(observability::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();
    metrics::gauge!(observability::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16().to_string();
    metrics::counter!(
        observability::HTTP_REQUESTS_TOTAL,
        "method" => method.clone(),
        "route" => route.clone(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        observability::HTTP_REQUEST_DURATION_SECONDS,
        "method" => method,
        "route" => route
    )
    .record(elapsed);
    response
}

// ── Handlers ─────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "UP" }))
}

async fn book_session(
    State(state): State<AppState>,
    body: Result<Json<BookSessionBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SessionView>)> {
    let Json(body) = body?;
    let session = state
        .engine
        .book_session(BookingRequest {
            member_id: body.member_id,
            trainer_id: body.trainer_id,
            start_time: body.start_time,
            end_time: body.end_time,
            session_type: body.session_type,
            focus_area: body.focus_area,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(session.into())))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let session = state.engine.get_session(session_id(&id)?).await?;
    Ok(Json(session.into()))
}

async fn list_sessions(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<SessionView>>> {
    let Query(q) = query?;
    let sessions = state
        .engine
        .list_sessions(q.member_id.as_deref(), q.trainer_id.as_deref())
        .await;
    Ok(Json(sessions.into_iter().map(Into::into).collect()))
}

async fn availability(
    State(state): State<AppState>,
    query: Result<Query<AvailabilityQuery>, QueryRejection>,
) -> ApiResult<Json<AvailabilityView>> {
    let Query(q) = query?;
    let (Some(start), Some(end)) = (q.start_time, q.end_time) else {
        return Err(ApiError::bad_request("startTime and endTime are required"));
    };
    if end <= start {
        return Err(ApiError::bad_request("end time must be after start time"));
    }
    let span = Span::new(start, end);

    let member_id = q.member_id.filter(|m| !m.trim().is_empty());
    let trainer_id = q.trainer_id.filter(|t| !t.trim().is_empty());
    let available = match (member_id.as_deref(), trainer_id.as_deref()) {
        (Some(member), None) => state.engine.is_member_available(member, &span).await,
        (None, Some(trainer)) => state.engine.is_trainer_available(trainer, &span).await,
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of memberId or trainerId is required",
            ));
        }
    };
    Ok(Json(AvailabilityView {
        member_id,
        trainer_id,
        available,
    }))
}

async fn confirm_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let session = state.engine.confirm_session(session_id(&id)?).await?;
    Ok(Json(session.into()))
}

async fn reschedule_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<RescheduleBody>, JsonRejection>,
) -> ApiResult<Json<SessionView>> {
    let id = session_id(&id)?;
    let Json(body) = body?;
    let session = state
        .engine
        .reschedule_session(
            id,
            RescheduleRequest {
                start_time: body.start_time,
                end_time: body.end_time,
                focus_area: body.focus_area,
                session_notes: body.session_notes,
            },
        )
        .await?;
    Ok(Json(session.into()))
}

async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SessionView>> {
    let id = session_id(&id)?;
    let body: CancelBody = optional_json(&body)?;
    let session = state.engine.cancel_session(id, body.reason).await?;
    Ok(Json(session.into()))
}

async fn complete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<SessionView>> {
    let id = session_id(&id)?;
    let body: CompleteBody = optional_json(&body)?;
    let session = state
        .engine
        .complete_session(id, body.calories_burned, body.session_notes)
        .await?;
    Ok(Json(session.into()))
}

async fn get_participants(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ParticipantView>>> {
    let participants = state.engine.get_participants(session_id(&id)?).await?;
    Ok(Json(participants.into_iter().map(Into::into).collect()))
}

async fn add_participant(
    State(state): State<AppState>,
    Path((id, member_id)): Path<(String, String)>,
) -> ApiResult<(StatusCode, Json<ParticipantView>)> {
    let participant = state
        .engine
        .add_participant(session_id(&id)?, member_id)
        .await?;
    Ok((StatusCode::CREATED, Json(participant.into())))
}

async fn remove_participant(
    State(state): State<AppState>,
    Path((id, pid)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .engine
        .remove_participant(session_id(&id)?, participant_id(&pid)?)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_attended(
    State(state): State<AppState>,
    Path((id, pid)): Path<(String, String)>,
) -> ApiResult<Json<ParticipantView>> {
    let p = state
        .engine
        .mark_participant_attended(session_id(&id)?, participant_id(&pid)?)
        .await?;
    Ok(Json(p.into()))
}

async fn mark_absent(
    State(state): State<AppState>,
    Path((id, pid)): Path<(String, String)>,
) -> ApiResult<Json<ParticipantView>> {
    let p = state
        .engine
        .mark_participant_absent(session_id(&id)?, participant_id(&pid)?)
        .await?;
    Ok(Json(p.into()))
}

async fn cancel_participation(
    State(state): State<AppState>,
    Path((id, pid)): Path<(String, String)>,
) -> ApiResult<Json<ParticipantView>> {
    let p = state
        .engine
        .cancel_participation(session_id(&id)?, participant_id(&pid)?)
        .await?;
    Ok(Json(p.into()))
}
