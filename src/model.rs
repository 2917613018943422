use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;

/// Wall-clock instant, UTC.
pub type Instant = DateTime<Utc>;

/// Time window `[start, end)` of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Instant,
    pub end: Instant,
}

impl Span {
    pub fn new(start: Instant, end: Instant) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Inclusive on both ends, like SQL `BETWEEN`.
    pub fn contains_instant(&self, t: Instant) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    #[default]
    Personal,
    Group,
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "SCHEDULED",
            SessionStatus::InProgress => "IN_PROGRESS",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantStatus {
    Confirmed,
    Attended,
    Absent,
    Cancelled,
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParticipantStatus::Confirmed => "CONFIRMED",
            ParticipantStatus::Attended => "ATTENDED",
            ParticipantStatus::Absent => "ABSENT",
            ParticipantStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A member registered on a GROUP or CLASS session. Owned by its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParticipant {
    pub id: Ulid,
    pub session_id: Ulid,
    pub member_id: String,
    pub status: ParticipantStatus,
    pub registered_at: Instant,
    pub attended_at: Option<Instant>,
}

impl SessionParticipant {
    pub fn new(session_id: Ulid, member_id: String, now: Instant) -> Self {
        Self {
            id: Ulid::new(),
            session_id,
            member_id,
            status: ParticipantStatus::Confirmed,
            registered_at: now,
            attended_at: None,
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.member_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("member id is required".into()));
        }
        Ok(())
    }

    pub fn mark_attended(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.status == ParticipantStatus::Attended {
            return Err(self.illegal("mark attended"));
        }
        self.status = ParticipantStatus::Attended;
        self.attended_at = Some(now);
        Ok(())
    }

    pub fn mark_absent(&mut self) -> Result<(), EngineError> {
        if self.status == ParticipantStatus::Attended {
            return Err(self.illegal("mark absent"));
        }
        self.status = ParticipantStatus::Absent;
        Ok(())
    }

    pub fn cancel_participation(&mut self) -> Result<(), EngineError> {
        if self.status == ParticipantStatus::Attended {
            return Err(self.illegal("cancel"));
        }
        self.status = ParticipantStatus::Cancelled;
        Ok(())
    }

    fn illegal(&self, op: &'static str) -> EngineError {
        EngineError::InvalidParticipantState {
            op,
            status: self.status,
        }
    }
}

/// The aggregate root: one training engagement between a member and a trainer.
///
/// Mutated only through the transition methods below. Every successful
/// mutation bumps `updated_at`; `COMPLETED` and `CANCELLED` are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Ulid,
    pub member_id: String,
    pub trainer_id: String,
    pub span: Span,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub session_notes: Option<String>,
    pub calories_burned: Option<u32>,
    pub focus_area: Option<String>,
    pub created_at: Instant,
    pub updated_at: Instant,
    pub participants: Vec<SessionParticipant>,
}

impl Session {
    /// Build a fresh `SCHEDULED` session. Nothing is validated here; call
    /// [`Session::validate`] and [`Session::schedule`] before persisting.
    pub fn new(
        member_id: String,
        trainer_id: String,
        span: Span,
        session_type: SessionType,
        focus_area: Option<String>,
        now: Instant,
    ) -> Self {
        Self {
            id: Ulid::new(),
            member_id,
            trainer_id,
            span,
            session_type,
            status: SessionStatus::Scheduled,
            session_notes: None,
            calories_burned: None,
            focus_area,
            created_at: now,
            updated_at: now,
            participants: Vec::new(),
        }
    }

    /// Field-shape check: both parties named and a non-empty window.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.member_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("member id is required".into()));
        }
        if self.trainer_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("trainer id is required".into()));
        }
        if self.span.start >= self.span.end {
            return Err(EngineError::InvalidInput(
                "start time must be before end time".into(),
            ));
        }
        Ok(())
    }

    pub fn schedule(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.status != SessionStatus::Scheduled {
            return Err(self.illegal("schedule"));
        }
        check_window(self.span.start, self.span.end, now)?;
        self.updated_at = now;
        Ok(())
    }

    /// SCHEDULED → IN_PROGRESS.
    pub fn start(&mut self, now: Instant) -> Result<(), EngineError> {
        if self.status != SessionStatus::Scheduled {
            return Err(self.illegal("start"));
        }
        self.status = SessionStatus::InProgress;
        self.updated_at = now;
        Ok(())
    }

    /// IN_PROGRESS → COMPLETED, recording the outcome fields.
    pub fn complete(
        &mut self,
        calories_burned: Option<u32>,
        notes: Option<String>,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.status != SessionStatus::InProgress {
            return Err(self.illegal("complete"));
        }
        self.status = SessionStatus::Completed;
        self.calories_burned = calories_burned;
        self.session_notes = notes;
        self.updated_at = now;
        Ok(())
    }

    /// SCHEDULED | IN_PROGRESS → CANCELLED. The reason lands in the notes.
    pub fn cancel(&mut self, reason: String, now: Instant) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(self.illegal("cancel"));
        }
        self.status = SessionStatus::Cancelled;
        self.session_notes = Some(reason);
        self.updated_at = now;
        Ok(())
    }

    /// Partial update used by reschedule. Only supplied fields are written;
    /// the resulting window must still be in the future and non-empty.
    pub fn update_details(
        &mut self,
        new_start: Option<Instant>,
        new_end: Option<Instant>,
        focus_area: Option<String>,
        notes: Option<String>,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.status.is_terminal() {
            return Err(self.illegal("update"));
        }
        let start = new_start.unwrap_or(self.span.start);
        let end = new_end.unwrap_or(self.span.end);
        if new_start.is_some() && start < now {
            return Err(EngineError::InvalidInput(
                "start time cannot be in the past".into(),
            ));
        }
        if end <= start {
            return Err(EngineError::InvalidInput(
                "end time must be after start time".into(),
            ));
        }

        self.span = Span::new(start, end);
        if let Some(f) = focus_area.filter(|f| !f.trim().is_empty()) {
            self.focus_area = Some(f);
        }
        if let Some(n) = notes.filter(|n| !n.trim().is_empty()) {
            self.session_notes = Some(n);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn add_participant(
        &mut self,
        participant: SessionParticipant,
        now: Instant,
    ) -> Result<(), EngineError> {
        if self.session_type == SessionType::Personal {
            return Err(EngineError::Conflict(
                "cannot add participants to PERSONAL sessions".into(),
            ));
        }
        if self.status.is_terminal() {
            return Err(self.illegal("add participant to"));
        }
        if self.has_participant(&participant.member_id) {
            return Err(EngineError::Conflict(
                "member is already a participant in this session".into(),
            ));
        }
        self.participants.push(participant);
        self.updated_at = now;
        Ok(())
    }

    pub fn remove_participant(
        &mut self,
        participant_id: Ulid,
        now: Instant,
    ) -> Result<SessionParticipant, EngineError> {
        let pos = self
            .participants
            .iter()
            .position(|p| p.id == participant_id)
            .ok_or(EngineError::ParticipantNotFound(participant_id))?;
        if self.status.is_terminal() {
            return Err(self.illegal("remove participant from"));
        }
        let removed = self.participants.remove(pos);
        self.updated_at = now;
        Ok(removed)
    }

    pub fn participant_mut(
        &mut self,
        participant_id: Ulid,
    ) -> Result<&mut SessionParticipant, EngineError> {
        self.participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or(EngineError::ParticipantNotFound(participant_id))
    }

    pub fn has_participant(&self, member_id: &str) -> bool {
        self.participants.iter().any(|p| p.member_id == member_id)
    }

    /// Open for booking changes.
    pub fn is_available(&self) -> bool {
        self.status == SessionStatus::Scheduled
    }

    fn illegal(&self, op: &'static str) -> EngineError {
        EngineError::InvalidTransition {
            op,
            status: self.status,
        }
    }
}

fn check_window(start: Instant, end: Instant, now: Instant) -> Result<(), EngineError> {
    if start < now {
        return Err(EngineError::InvalidInput(
            "start time cannot be in the past".into(),
        ));
    }
    if end <= start {
        return Err(EngineError::InvalidInput(
            "end time must be after start time".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> Instant {
        Utc.with_ymd_and_hms(2031, 1, 10, h, m, 0).unwrap()
    }

    fn now() -> Instant {
        Utc.with_ymd_and_hms(2031, 1, 1, 8, 0, 0).unwrap()
    }

    fn session(kind: SessionType) -> Session {
        Session::new(
            "m1".into(),
            "t1".into(),
            Span::new(at(10, 0), at(11, 0)),
            kind,
            None,
            now(),
        )
    }

    #[test]
    fn span_basics() {
        let s = Span::new(at(10, 0), at(11, 0));
        assert_eq!(s.duration(), Duration::hours(1));
        assert!(s.contains_instant(at(10, 0)));
        assert!(s.contains_instant(at(11, 0))); // inclusive end
        assert!(!s.contains_instant(at(11, 1)));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(at(10, 0), at(11, 0));
        let b = Span::new(at(10, 30), at(11, 30));
        let c = Span::new(at(11, 0), at(12, 0));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(at(10, 0), at(12, 0));
        let inner = Span::new(at(10, 30), at(11, 0));
        let partial = Span::new(at(9, 0), at(10, 30));
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn schedule_accepts_future_window() {
        let mut s = session(SessionType::Personal);
        s.schedule(now()).unwrap();
        assert_eq!(s.status, SessionStatus::Scheduled);
    }

    #[test]
    fn schedule_rejects_past_start() {
        let mut s = session(SessionType::Personal);
        let late = at(10, 30);
        assert!(matches!(s.schedule(late), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn schedule_rejects_after_start() {
        let mut s = session(SessionType::Personal);
        s.start(now()).unwrap();
        assert!(matches!(
            s.schedule(now()),
            Err(EngineError::InvalidTransition { status: SessionStatus::InProgress, .. })
        ));
    }

    #[test]
    fn validate_rejects_blank_parties() {
        let mut s = session(SessionType::Personal);
        s.member_id = "  ".into();
        assert!(matches!(s.validate(), Err(EngineError::InvalidInput(_))));
        let mut s = session(SessionType::Personal);
        s.trainer_id = String::new();
        assert!(matches!(s.validate(), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn forward_path_to_completed() {
        let mut s = session(SessionType::Personal);
        s.start(now()).unwrap();
        assert_eq!(s.status, SessionStatus::InProgress);
        let later = now() + Duration::hours(1);
        s.complete(Some(420), Some("good pace".into()), later).unwrap();
        assert_eq!(s.status, SessionStatus::Completed);
        assert_eq!(s.calories_burned, Some(420));
        assert_eq!(s.session_notes.as_deref(), Some("good pace"));
        assert_eq!(s.updated_at, later);
    }

    #[test]
    fn complete_requires_in_progress() {
        let mut s = session(SessionType::Personal);
        let err = s.complete(None, None, now()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { status: SessionStatus::Scheduled, .. }
        ));
    }

    #[test]
    fn cancel_from_scheduled_and_in_progress() {
        let mut s = session(SessionType::Personal);
        s.cancel("sick".into(), now()).unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
        assert_eq!(s.session_notes.as_deref(), Some("sick"));

        let mut s = session(SessionType::Personal);
        s.start(now()).unwrap();
        s.cancel("gym closed".into(), now()).unwrap();
        assert_eq!(s.status, SessionStatus::Cancelled);
    }

    #[test]
    fn terminal_states_reject_every_transition() {
        let mut done = session(SessionType::Group);
        done.start(now()).unwrap();
        done.complete(None, None, now()).unwrap();

        let mut cancelled = session(SessionType::Group);
        cancelled.cancel("x".into(), now()).unwrap();

        for s in [&mut done, &mut cancelled] {
            let before = s.clone();
            assert!(s.start(now()).is_err());
            assert!(s.complete(None, None, now()).is_err());
            assert!(s.cancel("again".into(), now()).is_err());
            assert!(s.schedule(now()).is_err());
            assert!(s.update_details(Some(at(12, 0)), Some(at(13, 0)), None, None, now()).is_err());
            assert!(s
                .add_participant(SessionParticipant::new(s.id, "m9".into(), now()), now())
                .is_err());
            assert_eq!(*s, before);
        }
    }

    #[test]
    fn update_details_partial() {
        let mut s = session(SessionType::Personal);
        s.focus_area = Some("legs".into());
        s.update_details(None, Some(at(11, 30)), Some("  ".into()), Some("bring towel".into()), now())
            .unwrap();
        assert_eq!(s.span, Span::new(at(10, 0), at(11, 30)));
        assert_eq!(s.focus_area.as_deref(), Some("legs"));
        assert_eq!(s.session_notes.as_deref(), Some("bring towel"));
    }

    #[test]
    fn update_details_keeps_window_ordered() {
        let mut s = session(SessionType::Personal);
        // New start after the current end, no new end supplied.
        let err = s.update_details(Some(at(11, 30)), None, None, None, now()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert_eq!(s.span, Span::new(at(10, 0), at(11, 0)));

        let err = s
            .update_details(Some(at(12, 0)), Some(at(12, 0)), None, None, now())
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn update_details_rejects_past_start() {
        let mut s = session(SessionType::Personal);
        let err = s
            .update_details(Some(at(7, 0)), Some(at(8, 0)), None, None, at(9, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn personal_sessions_take_no_participants() {
        let mut s = session(SessionType::Personal);
        let p = SessionParticipant::new(s.id, "m2".into(), now());
        assert!(matches!(s.add_participant(p, now()), Err(EngineError::Conflict(_))));
        assert!(s.participants.is_empty());
    }

    #[test]
    fn duplicate_participant_rejected() {
        let mut s = session(SessionType::Class);
        s.add_participant(SessionParticipant::new(s.id, "m2".into(), now()), now())
            .unwrap();
        let again = SessionParticipant::new(s.id, "m2".into(), now());
        assert!(matches!(s.add_participant(again, now()), Err(EngineError::Conflict(_))));
        assert_eq!(s.participants.len(), 1);
    }

    #[test]
    fn remove_participant_by_id() {
        let mut s = session(SessionType::Group);
        let p = SessionParticipant::new(s.id, "m2".into(), now());
        let pid = p.id;
        s.add_participant(p, now()).unwrap();
        let removed = s.remove_participant(pid, now()).unwrap();
        assert_eq!(removed.member_id, "m2");
        assert!(matches!(
            s.remove_participant(pid, now()),
            Err(EngineError::ParticipantNotFound(_))
        ));
    }

    #[test]
    fn participant_attendance() {
        let mut p = SessionParticipant::new(Ulid::new(), "m3".into(), now());
        assert_eq!(p.status, ParticipantStatus::Confirmed);
        p.mark_attended(at(10, 5)).unwrap();
        assert_eq!(p.attended_at, Some(at(10, 5)));
        assert!(p.mark_attended(at(10, 6)).is_err());
        assert!(p.mark_absent().is_err());
        assert!(p.cancel_participation().is_err());

        let mut q = SessionParticipant::new(Ulid::new(), "m4".into(), now());
        q.mark_absent().unwrap();
        assert_eq!(q.status, ParticipantStatus::Absent);
        q.cancel_participation().unwrap();
        assert_eq!(q.status, ParticipantStatus::Cancelled);
        assert_eq!(q.attended_at, None);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        let json = serde_json::to_string(&SessionStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        let t: SessionType = serde_json::from_str("\"CLASS\"").unwrap();
        assert_eq!(t, SessionType::Class);
    }

    #[test]
    fn session_bincode_roundtrip() {
        let mut s = session(SessionType::Group);
        s.add_participant(SessionParticipant::new(s.id, "m2".into(), now()), now())
            .unwrap();
        let bytes = bincode::serialize(&s).unwrap();
        let decoded: Session = bincode::deserialize(&bytes).unwrap();
        assert_eq!(s, decoded);
    }
}
