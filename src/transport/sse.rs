//! SSE subscriber registry and resumable event stream
//!
//! Owned entirely by the transport layer — the core never knows about
//! subscribers (spec.md §3 Ownership); it only exposes a per-scent handler
//! slot that the transport multiplexes out to every matching subscriber.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct SseEvent {
    pub id: u64,
    pub data: serde_json::Value,
}

struct SubscriberEntry {
    session_id: String,
    scents: HashSet<String>,
    sender: mpsc::UnboundedSender<SseEvent>,
}

/// Bounded ring of recently emitted events per scent, for `Last-Event-ID`
/// replay on SSE reconnect (spec.md §4.7, scenario 6).
struct ReplayRing {
    capacity: usize,
    events: Vec<SseEvent>,
}

impl ReplayRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Vec::new(),
        }
    }

    fn push(&mut self, event: SseEvent) {
        self.events.push(event);
        if self.events.len() > self.capacity {
            self.events.remove(0);
        }
    }

    fn since(&self, last_event_id: u64) -> Vec<SseEvent> {
        self.events
            .iter()
            .filter(|e| e.id > last_event_id)
            .cloned()
            .collect()
    }
}

pub struct SseRegistry {
    subscribers: Mutex<HashMap<String, SubscriberEntry>>,
    replay: Mutex<HashMap<String, ReplayRing>>,
    /// Scent bindings survive a single connection (spec.md §4.7: `sbp/subscribe`
    /// binds a `scent_id` to the *session*, not to a transient SSE socket), so
    /// this is tracked independently of `subscribers` and consulted on every
    /// (re)connect rather than only at bind time.
    session_scents: Mutex<HashMap<String, HashSet<String>>>,
    next_event_id: AtomicU64,
    replay_capacity: usize,
}

impl SseRegistry {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            replay: Mutex::new(HashMap::new()),
            session_scents: Mutex::new(HashMap::new()),
            next_event_id: AtomicU64::new(1),
            replay_capacity,
        }
    }

    /// Register a new SSE connection, returning its client id and a
    /// receiver the caller streams to the response body. The subscriber's
    /// scent set is the union of `scents` (explicit, connection-scoped) and
    /// whatever this session previously bound via `sbp/subscribe` — so a
    /// reconnect picks its bindings back up without the caller re-sending
    /// them. Replays any buffered events newer than `last_event_id` for that
    /// combined set before live delivery resumes.
    pub fn subscribe(
        &self,
        session_id: &str,
        scents: HashSet<String>,
        last_event_id: Option<u64>,
    ) -> (String, mpsc::UnboundedReceiver<SseEvent>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut scents = scents;
        if let Some(bound) = self.session_scents.lock().unwrap_or_else(|e| e.into_inner()).get(session_id) {
            scents.extend(bound.iter().cloned());
        }

        if let Some(last_id) = last_event_id {
            let replay = self.replay.lock().unwrap_or_else(|e| e.into_inner());
            let mut pending: Vec<SseEvent> = scents
                .iter()
                .filter_map(|scent_id| replay.get(scent_id))
                .flat_map(|ring| ring.since(last_id))
                .collect();
            pending.sort_by_key(|e| e.id);
            for event in pending {
                let _ = tx.send(event);
            }
        }

        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).insert(
            client_id.clone(),
            SubscriberEntry {
                session_id: session_id.to_string(),
                scents,
                sender: tx,
            },
        );

        (client_id, rx)
    }

    /// Drop a single connection's subscriber record (spec.md §5: cleaned up
    /// on disconnect). Does not touch the session's scent bindings — those
    /// persist across reconnects until explicitly `unbind_scent`'d.
    pub fn unsubscribe(&self, client_id: &str) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).remove(client_id);
    }

    pub fn bind_scent(&self, session_id: &str, scent_id: &str) {
        self.session_scents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .insert(scent_id.to_string());

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for entry in subscribers.values_mut() {
            if entry.session_id == session_id {
                entry.scents.insert(scent_id.to_string());
            }
        }
    }

    pub fn unbind_scent(&self, session_id: &str, scent_id: &str) {
        if let Some(bound) = self.session_scents.lock().unwrap_or_else(|e| e.into_inner()).get_mut(session_id) {
            bound.remove(scent_id);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for entry in subscribers.values_mut() {
            if entry.session_id == session_id {
                entry.scents.remove(scent_id);
            }
        }
    }

    /// Fan out a trigger notification to every subscriber whose session or
    /// explicit scent set matches. Dead senders (disconnected clients) are
    /// pruned as they're found.
    pub fn fan_out(&self, scent_id: &str, notification: serde_json::Value) {
        let event_id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = SseEvent {
            id: event_id,
            data: notification,
        };

        self.replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(scent_id.to_string())
            .or_insert_with(|| ReplayRing::new(self.replay_capacity))
            .push(event.clone());

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let mut dead = Vec::new();
        for (client_id, entry) in subscribers.iter() {
            if entry.scents.contains(scent_id) {
                if entry.sender.send(event.clone()).is_err() {
                    dead.push(client_id.clone());
                }
            }
        }
        for client_id in dead {
            subscribers.remove(&client_id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_since_returns_only_newer_events() {
        let mut ring = ReplayRing::new(10);
        for i in 1..=5 {
            ring.push(SseEvent {
                id: i,
                data: serde_json::json!(i),
            });
        }
        let replayed = ring.since(3);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, 4);
    }

    #[test]
    fn fan_out_reaches_bound_subscriber() {
        let registry = SseRegistry::new(16);
        let mut scents = HashSet::new();
        scents.insert("s1".to_string());
        let (_client_id, mut rx) = registry.subscribe("session-1", scents, None);

        registry.fan_out("s1", serde_json::json!({"hello": "world"}));
        let received = rx.try_recv().expect("event should be delivered");
        assert_eq!(received.id, 1);
    }

    #[test]
    fn reconnect_with_last_event_id_replays_missed_events() {
        let registry = SseRegistry::new(16);
        let mut scents = HashSet::new();
        scents.insert("s1".to_string());

        registry.fan_out("s1", serde_json::json!(1));
        registry.fan_out("s1", serde_json::json!(2));
        registry.fan_out("s1", serde_json::json!(3));

        let (_client_id, mut rx) = registry.subscribe("session-2", scents, Some(1));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.id, 2);
        assert_eq!(second.id, 3);
    }
}
