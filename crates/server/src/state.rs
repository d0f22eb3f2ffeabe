//! Session store
//!
//! Keyed collection of tracked sessions. Owned by the manager actor, never
//! shared behind a lock.

use std::collections::{HashMap, HashSet, VecDeque};

use workflowdock_protocol::SessionSummary;

use crate::error::ManagerError;
use crate::session::Session;

/// How many removed session ids are remembered for late-event filtering
const RETIRED_CAPACITY: usize = 1024;

struct Entry {
    seq: u64,
    session: Session,
}

#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<String, Entry>,
    /// placeholder id -> backend id, for host commands that raced a rekey
    aliases: HashMap<String, String>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
    next_seq: u64,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. Ids are unique among tracked sessions.
    pub fn insert(&mut self, session: Session) -> Result<(), ManagerError> {
        let id = session.id().to_string();
        if self.sessions.contains_key(&id) {
            return Err(ManagerError::DuplicateSession(id));
        }
        self.next_seq += 1;
        self.sessions.insert(
            id,
            Entry {
                seq: self.next_seq,
                session,
            },
        );
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Follow a placeholder alias to the id the session is tracked under now
    pub fn canonical_id<'a>(&'a self, id: &'a str) -> &'a str {
        match self.aliases.get(id) {
            Some(current) => current.as_str(),
            None => id,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        let id = self.canonical_id(id);
        self.sessions.get(id).map(|e| &e.session)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        let id = self.aliases.get(id).cloned().unwrap_or_else(|| id.to_string());
        self.sessions.get_mut(&id).map(|e| &mut e.session)
    }

    /// Drop a session and remember its id so late events are not misrouted
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let id = self.canonical_id(id).to_string();
        let entry = self.sessions.remove(&id)?;
        self.aliases.retain(|_, current| current != &id);
        self.retire(id);
        Some(entry.session)
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    fn retire(&mut self, id: String) {
        if self.retired.insert(id.clone()) {
            self.retired_order.push_back(id);
        }
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    /// Move a placeholder session under its backend id. The placeholder key
    /// is gone afterwards; only an alias for host commands remains.
    pub fn rekey(&mut self, placeholder: &str, backend_id: &str) -> Result<(), ManagerError> {
        if self.sessions.contains_key(backend_id) {
            return Err(ManagerError::DuplicateSession(backend_id.to_string()));
        }
        let mut entry = self
            .sessions
            .remove(placeholder)
            .ok_or_else(|| ManagerError::UnknownSession(placeholder.to_string()))?;
        entry.session.rekey(backend_id.to_string());
        self.sessions.insert(backend_id.to_string(), entry);
        self.aliases
            .insert(placeholder.to_string(), backend_id.to_string());
        Ok(())
    }

    /// Sessions in creation order
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        let mut entries: Vec<&Entry> = self.sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.session)
    }

    /// Creation order of a session, higher is newer
    pub fn seq(&self, id: &str) -> Option<u64> {
        self.sessions.get(self.canonical_id(id)).map(|e| e.seq)
    }

    pub fn active(&self) -> impl Iterator<Item = &Session> {
        self.sessions().filter(|s| !s.status().is_terminal())
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions().map(Session::summary).collect()
    }
}
