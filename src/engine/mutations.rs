use tokio::sync::oneshot;
use ulid::Ulid;

use crate::events::SessionEvent;
use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{now, validate_notes, validate_request, validate_window, Party};
use super::{Engine, EngineError, WalCommand};

const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

/// Inbound booking. Times are optional so a missing one is reported as
/// invalid input rather than a decode failure.
#[derive(Debug, Clone, Default)]
pub struct BookingRequest {
    pub member_id: String,
    pub trainer_id: String,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub session_type: SessionType,
    pub focus_area: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RescheduleRequest {
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
    pub focus_area: Option<String>,
    pub session_notes: Option<String>,
}

impl Engine {
    pub async fn book_session(&self, req: BookingRequest) -> Result<Session, EngineError> {
        let span = validate_request(
            &req.member_id,
            &req.trainer_id,
            req.start_time,
            req.end_time,
            req.focus_area.as_deref(),
        )?;
        if self.store.len() >= MAX_SESSIONS {
            return Err(EngineError::LimitExceeded("too many sessions"));
        }

        self.gateway.require_active_member(&req.member_id).await?;
        self.gateway.require_active_trainer(&req.trainer_id).await?;
        self.gateway
            .require_trainer_available(&req.trainer_id, &span)
            .await?;

        let now = now();
        let mut session = Session::new(
            req.member_id,
            req.trainer_id,
            span,
            req.session_type,
            req.focus_area,
            now,
        );
        session.validate()?;
        session.schedule(now)?;

        let _serial = if self.options.serialize_bookings {
            Some(self.booking_lock.lock().await)
        } else {
            None
        };
        self.check_party(Party::Member, &session.member_id, &span).await?;
        self.check_party(Party::Trainer, &session.trainer_id, &span).await?;

        {
            let _gate = self.persist_gate.read().await;
            self.wal_append(&session).await?;
            self.store.insert(session.clone());
        }
        drop(_serial);

        metrics::gauge!(observability::SESSIONS_STORED).set(self.store.len() as f64);
        metrics::counter!(observability::SESSIONS_BOOKED_TOTAL).increment(1);
        tracing::info!(
            session_id = %session.id,
            member_id = %session.member_id,
            trainer_id = %session.trainer_id,
            start = %session.span.start,
            end = %session.span.end,
            "session booked"
        );

        self.emit(SessionEvent::scheduled(&session)).await;
        Ok(session)
    }

    /// Move a session to a new window. Parties are re-verified remotely for
    /// the new window; the local conflict detector is not re-run.
    pub async fn reschedule_session(
        &self,
        id: Ulid,
        req: RescheduleRequest,
    ) -> Result<Session, EngineError> {
        validate_notes(req.session_notes.as_deref())?;
        if req.focus_area.as_ref().is_some_and(|f| f.len() > MAX_FOCUS_AREA_LEN) {
            return Err(EngineError::LimitExceeded("focus area too long"));
        }

        let current = self.get_session(id).await?;
        let window = validate_window(
            req.start_time.unwrap_or(current.span.start),
            req.end_time.unwrap_or(current.span.end),
        )?;

        self.gateway.require_active_member(&current.member_id).await?;
        self.gateway.require_active_trainer(&current.trainer_id).await?;
        self.gateway
            .require_trainer_available(&current.trainer_id, &window)
            .await?;

        let now = now();
        let (session, ()) = self
            .persist_with(id, |s| {
                s.update_details(
                    req.start_time,
                    req.end_time,
                    req.focus_area,
                    req.session_notes,
                    now,
                )
            })
            .await?;

        tracing::info!(
            session_id = %id,
            start = %session.span.start,
            end = %session.span.end,
            "session rescheduled"
        );
        self.emit(SessionEvent::rescheduled(&session)).await;
        Ok(session)
    }

    /// SCHEDULED → IN_PROGRESS. Emits nothing.
    pub async fn confirm_session(&self, id: Ulid) -> Result<Session, EngineError> {
        let (session, ()) = self.persist_with(id, |s| s.start(now())).await?;
        tracing::info!(session_id = %id, "session confirmed");
        Ok(session)
    }

    pub async fn cancel_session(
        &self,
        id: Ulid,
        reason: Option<String>,
    ) -> Result<Session, EngineError> {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
        validate_notes(Some(reason.as_str()))?;

        let (session, ()) = self.persist_with(id, |s| s.cancel(reason, now())).await?;

        metrics::counter!(observability::SESSIONS_CANCELLED_TOTAL).increment(1);
        tracing::info!(session_id = %id, "session cancelled");
        self.emit(SessionEvent::cancelled(&session)).await;
        Ok(session)
    }

    /// Complete a session, confirming it first if it is still SCHEDULED.
    pub async fn complete_session(
        &self,
        id: Ulid,
        calories_burned: Option<u32>,
        session_notes: Option<String>,
    ) -> Result<Session, EngineError> {
        validate_notes(session_notes.as_deref())?;

        let (session, ()) = self
            .persist_with(id, |s| {
                let now = now();
                if s.status == SessionStatus::Scheduled {
                    s.start(now)?;
                }
                s.complete(calories_burned, session_notes, now)
            })
            .await?;

        metrics::counter!(observability::SESSIONS_COMPLETED_TOTAL).increment(1);
        tracing::info!(session_id = %id, calories_burned, "session completed");
        self.emit(SessionEvent::completed(&session)).await;
        Ok(session)
    }

    // ── Participants ─────────────────────────────────────────

    pub async fn add_participant(
        &self,
        session_id: Ulid,
        member_id: String,
    ) -> Result<SessionParticipant, EngineError> {
        if member_id.len() > MAX_PARTY_ID_LEN {
            return Err(EngineError::LimitExceeded("party id too long"));
        }
        let (_, participant) = self
            .persist_with(session_id, |s| {
                if s.has_participant(&member_id) {
                    return Err(EngineError::Conflict(
                        "member is already a participant in this session".into(),
                    ));
                }
                if s.participants.len() >= MAX_PARTICIPANTS_PER_SESSION {
                    return Err(EngineError::LimitExceeded("too many participants"));
                }
                let now = now();
                let participant = SessionParticipant::new(s.id, member_id, now);
                participant.validate()?;
                s.add_participant(participant.clone(), now)?;
                Ok(participant)
            })
            .await?;

        tracing::info!(
            session_id = %session_id,
            participant_id = %participant.id,
            member_id = %participant.member_id,
            "participant added"
        );
        Ok(participant)
    }

    pub async fn remove_participant(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<SessionParticipant, EngineError> {
        let (_, removed) = self
            .persist_with(session_id, |s| s.remove_participant(participant_id, now()))
            .await?;
        tracing::info!(session_id = %session_id, participant_id = %participant_id, "participant removed");
        Ok(removed)
    }

    pub async fn mark_participant_attended(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<SessionParticipant, EngineError> {
        self.update_participant(session_id, participant_id, |p, now| p.mark_attended(now))
            .await
    }

    pub async fn mark_participant_absent(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<SessionParticipant, EngineError> {
        self.update_participant(session_id, participant_id, |p, _| p.mark_absent())
            .await
    }

    pub async fn cancel_participation(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
    ) -> Result<SessionParticipant, EngineError> {
        self.update_participant(session_id, participant_id, |p, _| p.cancel_participation())
            .await
    }

    async fn update_participant(
        &self,
        session_id: Ulid,
        participant_id: Ulid,
        change: impl FnOnce(&mut SessionParticipant, Instant) -> Result<(), EngineError>,
    ) -> Result<SessionParticipant, EngineError> {
        let (_, participant) = self
            .persist_with(session_id, |s| {
                let now = now();
                let p = s.participant_mut(participant_id)?;
                change(p, now)?;
                let updated = p.clone();
                s.updated_at = now;
                Ok(updated)
            })
            .await?;
        tracing::info!(
            session_id = %session_id,
            participant_id = %participant_id,
            status = %participant.status,
            "participant updated"
        );
        Ok(participant)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with one snapshot per stored session. Writers are
    /// held off for the duration.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.persist_gate.write().await;

        let mut sessions = Vec::with_capacity(self.store.len());
        for id in self.store.ids() {
            if let Some(row) = self.store.get(&id) {
                sessions.push(row.read().await.clone());
            }
        }
        let count = sessions.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { sessions, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(sessions = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
