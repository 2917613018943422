//! Outbound lifecycle events consumed by notifications and reporting.
//!
//! One closed enum of payloads; the `eventType` discriminator is carried in
//! the serialized record and selects the routing key.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Instant, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Scheduled,
    Rescheduled,
    Cancelled,
    Completed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Scheduled => "SESSION_SCHEDULED",
            EventKind::Rescheduled => "SESSION_RESCHEDULED",
            EventKind::Cancelled => "SESSION_CANCELLED",
            EventKind::Completed => "SESSION_COMPLETED",
        }
    }
}

/// Destination on the bus for an event kind.
pub fn routing_key(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Scheduled => "schedule.session.scheduled",
        EventKind::Rescheduled => "schedule.session.rescheduled",
        EventKind::Cancelled => "schedule.session.cancelled",
        EventKind::Completed => "schedule.session.completed",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    SessionScheduled {
        member_id: String,
        trainer_id: String,
        start_time: Instant,
        end_time: Instant,
    },
    #[serde(rename_all = "camelCase")]
    SessionRescheduled {
        member_id: String,
        trainer_id: String,
        start_time: Instant,
        end_time: Instant,
    },
    #[serde(rename_all = "camelCase")]
    SessionCancelled {
        member_id: String,
        trainer_id: String,
        reason: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionCompleted {
        member_id: String,
        trainer_id: String,
        calories_burned: Option<u32>,
        session_notes: Option<String>,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionScheduled { .. } => EventKind::Scheduled,
            EventPayload::SessionRescheduled { .. } => EventKind::Rescheduled,
            EventPayload::SessionCancelled { .. } => EventKind::Cancelled,
            EventPayload::SessionCompleted { .. } => EventKind::Completed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEvent {
    pub event_id: Ulid,
    pub session_id: Ulid,
    pub occurred_on: Instant,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SessionEvent {
    fn new(session: &Session, occurred_on: Instant, payload: EventPayload) -> Self {
        Self {
            event_id: Ulid::new(),
            session_id: session.id,
            occurred_on,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn scheduled(session: &Session) -> Self {
        let payload = EventPayload::SessionScheduled {
            member_id: session.member_id.clone(),
            trainer_id: session.trainer_id.clone(),
            start_time: session.span.start,
            end_time: session.span.end,
        };
        Self::new(session, session.created_at, payload)
    }

    pub fn rescheduled(session: &Session) -> Self {
        let payload = EventPayload::SessionRescheduled {
            member_id: session.member_id.clone(),
            trainer_id: session.trainer_id.clone(),
            start_time: session.span.start,
            end_time: session.span.end,
        };
        Self::new(session, session.updated_at, payload)
    }

    pub fn cancelled(session: &Session) -> Self {
        let payload = EventPayload::SessionCancelled {
            member_id: session.member_id.clone(),
            trainer_id: session.trainer_id.clone(),
            reason: session.session_notes.clone(),
        };
        Self::new(session, session.updated_at, payload)
    }

    pub fn completed(session: &Session) -> Self {
        let payload = EventPayload::SessionCompleted {
            member_id: session.member_id.clone(),
            trainer_id: session.trainer_id.clone(),
            calories_burned: session.calories_burned,
            session_notes: session.session_notes.clone(),
        };
        Self::new(session, session.updated_at, payload)
    }
}
