use ulid::Ulid;

use crate::model::{ParticipantStatus, SessionStatus};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(Ulid),
    #[error("participant not found: {0}")]
    ParticipantNotFound(Ulid),
    /// Scheduling conflict. Remote verification failures land here too.
    #[error("scheduling conflict: {0}")]
    Conflict(String),
    #[error("cannot {op} session in status {status}")]
    InvalidTransition {
        op: &'static str,
        status: SessionStatus,
    },
    #[error("cannot {op} participant in status {status}")]
    InvalidParticipantState {
        op: &'static str,
        status: ParticipantStatus,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}
