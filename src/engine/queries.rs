use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::{check_no_conflict, conflicting_ids, Party};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_session(&self, id: Ulid) -> Result<Session, EngineError> {
        let row = self.row(id)?;
        let guard = row.read().await;
        Ok(guard.clone())
    }

    /// Filter by member, else by trainer, else everything. Blank filters are
    /// ignored. Ordered by start time.
    pub async fn list_sessions(
        &self,
        member_id: Option<&str>,
        trainer_id: Option<&str>,
    ) -> Vec<Session> {
        let member_id = member_id.filter(|m| !m.trim().is_empty());
        let trainer_id = trainer_id.filter(|t| !t.trim().is_empty());
        let mut sessions = match (member_id, trainer_id) {
            (Some(m), _) => self.party_sessions(Party::Member, m).await,
            (None, Some(t)) => self.party_sessions(Party::Trainer, t).await,
            (None, None) => self.snapshot(self.store.ids()).await,
        };
        sessions.sort_by_key(|s| (s.span.start, s.id));
        sessions
    }

    pub async fn get_participants(
        &self,
        session_id: Ulid,
    ) -> Result<Vec<SessionParticipant>, EngineError> {
        let row = self.row(session_id)?;
        let guard = row.read().await;
        Ok(guard.participants.clone())
    }

    pub async fn is_member_available(&self, member_id: &str, span: &Span) -> bool {
        self.is_party_free(Party::Member, member_id, span).await
    }

    pub async fn is_trainer_available(&self, trainer_id: &str, span: &Span) -> bool {
        self.is_party_free(Party::Trainer, trainer_id, span).await
    }

    async fn is_party_free(&self, party: Party, party_id: &str, span: &Span) -> bool {
        let sessions = self.party_sessions(party, party_id).await;
        conflicting_ids(&sessions, span, self.options.conflict_rule, None).is_empty()
    }

    pub(super) async fn check_party(
        &self,
        party: Party,
        party_id: &str,
        span: &Span,
    ) -> Result<(), EngineError> {
        let sessions = self.party_sessions(party, party_id).await;
        let result = check_no_conflict(party, &sessions, span, self.options.conflict_rule);
        if let Err(e) = &result {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "party" => party.as_str())
                .increment(1);
            tracing::warn!(party = party.as_str(), party_id, error = %e, "booking conflict");
        }
        result
    }

    pub(super) async fn party_sessions(&self, party: Party, party_id: &str) -> Vec<Session> {
        self.snapshot(self.store.ids_for(party, party_id)).await
    }

    async fn snapshot(&self, ids: Vec<Ulid>) -> Vec<Session> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.store.get(&id) {
                out.push(row.read().await.clone());
            }
        }
        out
    }
}
