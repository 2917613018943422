//! Remote verification against the Members and Trainers services.
//!
//! [`Directory`] is the raw capability surface (one method per remote
//! lookup). [`VerificationGateway`] turns its answers into pass/fail: an
//! inactive party, a missing party and a failed call all become
//! [`EngineError::Conflict`], so booking fails closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::engine::EngineError;
use crate::model::Span;
use crate::observability;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("{service} service unavailable: {message}")]
    Transport {
        service: &'static str,
        message: String,
    },
    #[error("{service} service call failed with status {status}")]
    Status { service: &'static str, status: u16 },
    #[error("{service} service returned an unreadable body: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
    #[error("{service} id {id:?} cannot be looked up")]
    InvalidId { service: &'static str, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    pub status: Option<String>,
}

/// Body of `GET /api/members/{id}/profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub member: Option<MemberSummary>,
}

/// Body of `GET /api/trainers/{id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerProfile {
    pub status: Option<String>,
}

/// Body of `GET /api/trainers/{id}/available`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerAvailability {
    pub available: bool,
}

/// Raw lookups. `Ok(None)` means the remote answered "not found".
#[async_trait]
pub trait Directory: Send + Sync {
    async fn member_profile(&self, member_id: &str) -> Result<Option<MemberProfile>, RemoteError>;

    async fn trainer_profile(&self, trainer_id: &str)
    -> Result<Option<TrainerProfile>, RemoteError>;

    async fn trainer_availability(
        &self,
        trainer_id: &str,
        span: &Span,
    ) -> Result<Option<TrainerAvailability>, RemoteError>;
}

fn is_active(status: Option<&str>) -> bool {
    status.is_some_and(|s| s.eq_ignore_ascii_case("ACTIVE"))
}

fn conflict(reason: impl Into<String>) -> EngineError {
    EngineError::Conflict(reason.into())
}

fn record_call<T>(service: &'static str, started: std::time::Instant, result: &Result<T, RemoteError>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REMOTE_CALLS_TOTAL, "service" => service, "outcome" => outcome)
        .increment(1);
    metrics::histogram!(observability::REMOTE_CALL_DURATION_SECONDS, "service" => service)
        .record(started.elapsed().as_secs_f64());
}

#[derive(Clone)]
pub struct VerificationGateway {
    directory: Arc<dyn Directory>,
}

impl VerificationGateway {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub async fn require_active_member(&self, member_id: &str) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let result = self.directory.member_profile(member_id).await;
        record_call("members", started, &result);

        let profile = match result {
            Ok(Some(profile)) => profile,
            Ok(None) => return Err(conflict("member not found")),
            Err(e) => {
                tracing::warn!(member_id, error = %e, "member verification failed");
                return Err(conflict(e.to_string()));
            }
        };
        let Some(member) = profile.member else {
            return Err(conflict("member profile not found"));
        };
        if !is_active(member.status.as_deref()) {
            return Err(conflict("member is not active"));
        }
        tracing::debug!(member_id, "member verified active");
        Ok(())
    }

    pub async fn require_active_trainer(&self, trainer_id: &str) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let result = self.directory.trainer_profile(trainer_id).await;
        record_call("trainers", started, &result);

        let trainer = match result {
            Ok(Some(trainer)) => trainer,
            Ok(None) => return Err(conflict("trainer not found")),
            Err(e) => {
                tracing::warn!(trainer_id, error = %e, "trainer verification failed");
                return Err(conflict(e.to_string()));
            }
        };
        if !is_active(trainer.status.as_deref()) {
            return Err(conflict("trainer is not active"));
        }
        tracing::debug!(trainer_id, "trainer verified active");
        Ok(())
    }

    pub async fn require_trainer_available(
        &self,
        trainer_id: &str,
        span: &Span,
    ) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        let result = self.directory.trainer_availability(trainer_id, span).await;
        record_call("trainers", started, &result);

        match result {
            Ok(Some(TrainerAvailability { available: true })) => {
                tracing::debug!(trainer_id, "trainer availability confirmed");
                Ok(())
            }
            Ok(Some(_)) => Err(conflict(
                "trainer is not available for the selected time slot",
            )),
            Ok(None) => Err(conflict("trainer not found")),
            Err(e) => {
                tracing::warn!(trainer_id, error = %e, "trainer availability check failed");
                Err(conflict(e.to_string()))
            }
        }
    }
}

// ── HTTP directory ───────────────────────────────────────

/// Bad `GYMSCHED_MEMBERS_URL` / `GYMSCHED_TRAINERS_URL`, or a client that
/// could not be built.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryConfigError {
    #[error("invalid {service} base URL {url:?}: {reason}")]
    BaseUrl {
        service: &'static str,
        url: String,
        reason: String,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

fn base_url(service: &'static str, raw: &str) -> Result<Url, DirectoryConfigError> {
    let invalid = |reason: String| DirectoryConfigError::BaseUrl {
        service,
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot carry a path".into()));
    }
    Ok(url)
}

/// Append `segments` to `base`. Each segment is percent-encoded on its own,
/// so an id never reshapes the path or adds a query.
fn endpoint(base: &Url, service: &'static str, segments: &[&str]) -> Result<Url, RemoteError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| RemoteError::Transport {
            service,
            message: format!("{base} cannot carry a path"),
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Dot segments are dropped by URL normalisation, so they cannot name a party.
fn party_segment<'a>(service: &'static str, id: &'a str) -> Result<&'a str, RemoteError> {
    if matches!(id, "" | "." | "..") {
        return Err(RemoteError::InvalidId {
            service,
            id: id.to_string(),
        });
    }
    Ok(id)
}

/// Directory backed by the Members and Trainers REST services.
pub struct HttpDirectory {
    client: reqwest::Client,
    members_url: Url,
    trainers_url: Url,
}

impl HttpDirectory {
    pub fn new(config: &RemoteConfig) -> Result<Self, DirectoryConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            members_url: base_url("members", &config.members_url)?,
            trainers_url: base_url("trainers", &config.trainers_url)?,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        service: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<T>, RemoteError> {
        let response = request.send().await.map_err(|e| RemoteError::Transport {
            service,
            message: e.to_string(),
        })?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(RemoteError::Status {
                service,
                status: status.as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| RemoteError::Decode {
                service,
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn member_profile(&self, member_id: &str) -> Result<Option<MemberProfile>, RemoteError> {
        let id = party_segment("members", member_id)?;
        let url = endpoint(&self.members_url, "members", &["api", "members", id, "profile"])?;
        self.get_json("members", self.client.get(url)).await
    }

    async fn trainer_profile(
        &self,
        trainer_id: &str,
    ) -> Result<Option<TrainerProfile>, RemoteError> {
        let id = party_segment("trainers", trainer_id)?;
        let url = endpoint(&self.trainers_url, "trainers", &["api", "trainers", id])?;
        self.get_json("trainers", self.client.get(url)).await
    }

    async fn trainer_availability(
        &self,
        trainer_id: &str,
        span: &Span,
    ) -> Result<Option<TrainerAvailability>, RemoteError> {
        let id = party_segment("trainers", trainer_id)?;
        let url = endpoint(
            &self.trainers_url,
            "trainers",
            &["api", "trainers", id, "available"],
        )?;
        let request = self.client.get(url).query(&[
            ("startTime", span.start.to_rfc3339()),
            ("endTime", span.end.to_rfc3339()),
        ]);
        self.get_json("trainers", request).await
    }
}

// ── Static directory ─────────────────────────────────────

/// In-memory directory with switchable outages. Availability is answered per
/// trainer, ignoring the window.
#[derive(Default)]
pub struct StaticDirectory {
    members: RwLock<HashMap<String, String>>,
    trainers: RwLock<HashMap<String, (String, bool)>>,
    members_down: AtomicBool,
    trainers_down: AtomicBool,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(self, id: &str, status: &str) -> Self {
        self.set_member(id, status);
        self
    }

    pub fn with_trainer(self, id: &str, status: &str, available: bool) -> Self {
        self.set_trainer(id, status, available);
        self
    }

    pub fn set_member(&self, id: &str, status: &str) {
        if let Ok(mut members) = self.members.write() {
            members.insert(id.to_string(), status.to_string());
        }
    }

    pub fn set_trainer(&self, id: &str, status: &str, available: bool) {
        if let Ok(mut trainers) = self.trainers.write() {
            trainers.insert(id.to_string(), (status.to_string(), available));
        }
    }

    pub fn set_members_down(&self, down: bool) {
        self.members_down.store(down, Ordering::SeqCst);
    }

    pub fn set_trainers_down(&self, down: bool) {
        self.trainers_down.store(down, Ordering::SeqCst);
    }

    fn outage(service: &'static str) -> RemoteError {
        RemoteError::Transport {
            service,
            message: "connection refused".into(),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn member_profile(&self, member_id: &str) -> Result<Option<MemberProfile>, RemoteError> {
        if self.members_down.load(Ordering::SeqCst) {
            return Err(Self::outage("members"));
        }
        let members = self.members.read().map_err(|_| Self::outage("members"))?;
        Ok(members.get(member_id).map(|status| MemberProfile {
            member: Some(MemberSummary {
                status: Some(status.clone()),
            }),
        }))
    }

    async fn trainer_profile(
        &self,
        trainer_id: &str,
    ) -> Result<Option<TrainerProfile>, RemoteError> {
        if self.trainers_down.load(Ordering::SeqCst) {
            return Err(Self::outage("trainers"));
        }
        let trainers = self.trainers.read().map_err(|_| Self::outage("trainers"))?;
        Ok(trainers.get(trainer_id).map(|(status, _)| TrainerProfile {
            status: Some(status.clone()),
        }))
    }

    async fn trainer_availability(
        &self,
        trainer_id: &str,
        _span: &Span,
    ) -> Result<Option<TrainerAvailability>, RemoteError> {
        if self.trainers_down.load(Ordering::SeqCst) {
            return Err(Self::outage("trainers"));
        }
        let trainers = self.trainers.read().map_err(|_| Self::outage("trainers"))?;
        Ok(trainers
            .get(trainer_id)
            .map(|(_, available)| TrainerAvailability { available: *available }))
    }
}
