use std::str::FromStr;

use chrono::Utc;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now() -> Instant {
    Utc::now()
}

/// How an existing session's window is tested against a candidate window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictRule {
    /// Existing session conflicts when its start lies in `[start, end]` of the
    /// candidate. Misses sessions that begin before the candidate window.
    #[default]
    Containment,
    /// Half-open interval intersection.
    Overlap,
}

impl ConflictRule {
    pub fn conflicts(self, existing: &Span, candidate: &Span) -> bool {
        match self {
            ConflictRule::Containment => candidate.contains_instant(existing.start),
            ConflictRule::Overlap => existing.overlaps(candidate),
        }
    }
}

impl FromStr for ConflictRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "containment" => Ok(ConflictRule::Containment),
            "overlap" => Ok(ConflictRule::Overlap),
            other => Err(format!(
                "unknown conflict rule {other}, expected containment or overlap"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Member,
    Trainer,
}

impl Party {
    pub fn as_str(self) -> &'static str {
        match self {
            Party::Member => "member",
            Party::Trainer => "trainer",
        }
    }
}

/// Ids of the sessions in `existing` that block `candidate`. Cancelled
/// sessions and `exclude` are skipped.
pub(crate) fn conflicting_ids<'a>(
    existing: impl IntoIterator<Item = &'a Session>,
    candidate: &Span,
    rule: ConflictRule,
    exclude: Option<Ulid>,
) -> Vec<Ulid> {
    existing
        .into_iter()
        .filter(|s| s.status != SessionStatus::Cancelled)
        .filter(|s| Some(s.id) != exclude)
        .filter(|s| rule.conflicts(&s.span, candidate))
        .map(|s| s.id)
        .collect()
}

pub(crate) fn check_no_conflict<'a>(
    party: Party,
    existing: impl IntoIterator<Item = &'a Session>,
    candidate: &Span,
    rule: ConflictRule,
) -> Result<(), EngineError> {
    let hits = conflicting_ids(existing, candidate, rule, None);
    if hits.is_empty() {
        return Ok(());
    }
    let reason = match party {
        Party::Member => "member is not available for the selected time slot",
        Party::Trainer => "trainer has a conflicting session",
    };
    Err(EngineError::Conflict(reason.into()))
}

/// Shape and size checks on a booking request, run before any remote call.
pub(crate) fn validate_request(
    member_id: &str,
    trainer_id: &str,
    start: Option<Instant>,
    end: Option<Instant>,
    focus_area: Option<&str>,
) -> Result<Span, EngineError> {
    use crate::limits::*;
    if member_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("member id is required".into()));
    }
    if trainer_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("trainer id is required".into()));
    }
    if member_id.len() > MAX_PARTY_ID_LEN || trainer_id.len() > MAX_PARTY_ID_LEN {
        return Err(EngineError::LimitExceeded("party id too long"));
    }
    if focus_area.is_some_and(|f| f.len() > MAX_FOCUS_AREA_LEN) {
        return Err(EngineError::LimitExceeded("focus area too long"));
    }
    let (Some(start), Some(end)) = (start, end) else {
        return Err(EngineError::InvalidInput(
            "start and end times are required".into(),
        ));
    };
    validate_window(start, end)
}

pub(crate) fn validate_window(start: Instant, end: Instant) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInput(
            "end time must be after start time".into(),
        ));
    }
    if end - start > chrono::Duration::hours(crate::limits::MAX_SESSION_HOURS) {
        return Err(EngineError::LimitExceeded("session too long"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_notes(notes: Option<&str>) -> Result<(), EngineError> {
    if notes.is_some_and(|n| n.len() > crate::limits::MAX_NOTES_LEN) {
        return Err(EngineError::LimitExceeded("notes too long"));
    }
    Ok(())
}
