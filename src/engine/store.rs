use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::Session;

use super::conflict::Party;
use super::SharedSession;

/// Session rows plus the per-party indexes the conflict detector scans.
///
/// Party ids never change after booking, so the indexes are written once
/// per session on insert.
pub struct SessionStore {
    sessions: DashMap<Ulid, SharedSession>,
    by_member: DashMap<String, Vec<Ulid>>,
    by_trainer: DashMap<String, Vec<Ulid>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            by_member: DashMap::new(),
            by_trainer: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedSession> {
        self.sessions.get(id).map(|e| e.value().clone())
    }

    pub fn insert(&self, session: Session) -> SharedSession {
        let id = session.id;
        self.by_member
            .entry(session.member_id.clone())
            .or_default()
            .push(id);
        self.by_trainer
            .entry(session.trainer_id.clone())
            .or_default()
            .push(id);
        let row = Arc::new(RwLock::new(session));
        self.sessions.insert(id, row.clone());
        row
    }

    pub fn ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn ids_for(&self, party: Party, party_id: &str) -> Vec<Ulid> {
        let index = match party {
            Party::Member => &self.by_member,
            Party::Trainer => &self.by_trainer,
        };
        index
            .get(party_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}
