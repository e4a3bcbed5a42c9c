//! Session tracking
//!
//! Sessions are soft identity (spec.md §9): used for SSE routing and
//! observability, never for authorization. A session is created on the
//! first request lacking `Sbp-Session-Id` and echoed back on every
//! subsequent response.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub session_id: String,
    pub agent_id: Option<String>,
    pub created_at: i64,
    pub last_seen_at: i64,
}

#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the session for a request: reuse the supplied id if known,
    /// otherwise mint a fresh one. Always returns a valid session id.
    pub fn resolve(&self, supplied: Option<&str>, agent_id: Option<&str>, now: i64) -> String {
        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(id) = supplied {
            if let Some(session) = sessions.get_mut(id) {
                session.last_seen_at = now;
                if agent_id.is_some() {
                    session.agent_id = agent_id.map(str::to_string);
                }
                return id.to_string();
            }
        }

        let id = Uuid::new_v4().to_string();
        sessions.insert(
            id.clone(),
            Session {
                session_id: id.clone(),
                agent_id: agent_id.map(str::to_string),
                created_at: now,
                last_seen_at: now,
            },
        );
        id
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    /// Reap sessions inactive for longer than `ttl_ms` (ambient resource
    /// hygiene per SPEC_FULL.md §B — not a documented protocol behavior).
    pub fn reap_expired(&self, now: i64, ttl_ms: i64) -> usize {
        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, s| now - s.last_seen_at < ttl_ms);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
