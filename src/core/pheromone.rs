//! Pheromone store
//!
//! Identity-addressed container with a narrow synchronous interface so
//! alternate backends (disk, Redis, sharded) can sit behind it without the
//! core caring. The default backend is a plain in-memory map guarded by a
//! mutex, the way the teacher's `Blackboard` wraps a single Redis
//! connection manager: one owner, simple locking, no leaked internals.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::decay::DecayModel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pheromone {
    pub id: String,
    pub trail: String,
    pub signal_type: String,
    pub emitted_at: i64,
    pub last_reinforced_at: i64,
    pub initial_intensity: f64,
    pub decay_model: DecayModel,
    pub payload: serde_json::Value,
    pub source_agent: Option<String>,
    pub tags: HashSet<String>,
    pub ttl_floor: f64,
}

impl Pheromone {
    /// `trail+type+payload_hash` identifies a pheromone for merge matching
    /// (spec.md §3). Hash the payload with sorted keys at every structural
    /// level; `serde_json::Value` maps are already `BTreeMap`-ordered once
    /// serialized through `to_string` on a `Value` built from sorted
    /// insertion, so we re-canonicalize defensively rather than trust the
    /// caller's key order.
    pub fn payload_hash(payload: &serde_json::Value) -> String {
        let canonical = canonicalize(payload);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        hex_prefix(&digest, 8)
    }
}

fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes[..n.min(bytes.len())]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Tag filter semantics (spec.md §4.5): `any`/`all`/`none`, each satisfied
/// trivially when empty or absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagFilter {
    #[serde(default)]
    pub any: HashSet<String>,
    #[serde(default)]
    pub all: HashSet<String>,
    #[serde(default)]
    pub none: HashSet<String>,
}

impl TagFilter {
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        if !self.any.is_empty() && tags.is_disjoint(&self.any) {
            return false;
        }
        if !self.all.is_empty() && !self.all.is_subset(tags) {
            return false;
        }
        if !self.none.is_empty() && !tags.is_disjoint(&self.none) {
            return false;
        }
        true
    }
}

/// Minimum store contract (spec.md §4.2). Synchronous by design: even a
/// backend that caches asynchronously MUST present this interface to the
/// core, so the evaluation loop never awaits a lock held across I/O.
pub trait PheromoneStore: Send + Sync {
    fn get(&self, id: &str) -> Option<Pheromone>;
    fn set(&self, id: &str, p: Pheromone);
    fn delete(&self, id: &str) -> bool;
    fn has(&self, id: &str) -> bool;
    fn values(&self) -> Vec<Pheromone>;
    fn entries(&self) -> Vec<(String, Pheromone)>;
    fn size(&self) -> usize;
    fn clear(&self);
}

/// Default in-memory backend.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<HashMap<String, Pheromone>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PheromoneStore for InMemoryStore {
    fn get(&self, id: &str) -> Option<Pheromone> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    fn set(&self, id: &str, p: Pheromone) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), p);
    }

    fn delete(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .is_some()
    }

    fn has(&self, id: &str) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).contains_key(id)
    }

    fn values(&self) -> Vec<Pheromone> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn entries(&self) -> Vec<(String, Pheromone)> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn clear(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(Pheromone::payload_hash(&a), Pheromone::payload_hash(&b));
    }

    #[test]
    fn tag_filter_empty_clauses_match_everything() {
        let f = TagFilter::default();
        assert!(f.matches(&HashSet::new()));
    }

    #[test]
    fn tag_filter_all_requires_subset() {
        let mut f = TagFilter::default();
        f.all.insert("x".into());
        f.all.insert("y".into());
        let mut tags = HashSet::new();
        tags.insert("x".to_string());
        assert!(!f.matches(&tags));
        tags.insert("y".to_string());
        assert!(f.matches(&tags));
    }

    #[test]
    fn store_roundtrip() {
        let store = InMemoryStore::new();
        assert_eq!(store.size(), 0);
        let p = Pheromone {
            id: "1".into(),
            trail: "a".into(),
            signal_type: "t".into(),
            emitted_at: 0,
            last_reinforced_at: 0,
            initial_intensity: 1.0,
            decay_model: DecayModel::Immortal,
            payload: serde_json::json!({}),
            source_agent: None,
            tags: Default::default(),
            ttl_floor: 0.01,
        };
        store.set("1", p);
        assert!(store.has("1"));
        assert_eq!(store.size(), 1);
        assert!(store.delete("1"));
        assert!(!store.has("1"));
    }
}
