//! LRU+TTL cache for idempotent action replay, keyed on
//! `(userId, gameId, action, idempotencyKey)`. Grounded directly on spec
//! §4.15's Idempotency note (no `original_source` counterpart exists for
//! this component); the hand-rolled LRU follows the same "small bounded
//! cache, no external crate" choice the spec's 256-entry cap implies is a
//! process-local concern, not a distributed one.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct CachedAction {
    pub result: Value,
    pub fingerprint: Value,
    pub created_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    user_id: String,
    game_id: String,
    action: String,
    idempotency_key: String,
}

struct Entry {
    value: CachedAction,
}

pub struct IdempotencyCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
    order: Mutex<Vec<CacheKey>>,
    ttl: Duration,
    capacity: usize,
}

pub enum Lookup {
    /// No entry for this key at all.
    Miss,
    /// An entry exists, TTL has not elapsed, and the fingerprint matches —
    /// the caller should return this result without re-running the action.
    Hit(Value),
    /// An entry exists under this key but the fingerprint differs; spec
    /// §4.15 says to ignore (not reuse) it, so the action runs again and
    /// overwrites the stale entry.
    FingerprintMismatch,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), ttl, capacity: capacity.max(1) }
    }

    fn key(user_id: &str, game_id: &str, action: &str, idempotency_key: &str) -> CacheKey {
        CacheKey {
            user_id: user_id.to_string(),
            game_id: game_id.to_string(),
            action: action.to_string(),
            idempotency_key: idempotency_key.to_string(),
        }
    }

    pub async fn lookup(&self, user_id: &str, game_id: &str, action: &str, idempotency_key: &str, fingerprint: &Value) -> Lookup {
        let key = Self::key(user_id, game_id, action, idempotency_key);
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(&key) else { return Lookup::Miss };

        if entry.value.created_at.elapsed() > self.ttl {
            entries.remove(&key);
            drop(entries);
            self.order.lock().await.retain(|k| k != &key);
            return Lookup::Miss;
        }

        if entry.value.fingerprint != *fingerprint {
            return Lookup::FingerprintMismatch;
        }

        Lookup::Hit(entry.value.result.clone())
    }

    /// Inserts/overwrites the entry for this key, evicting the
    /// least-recently-touched entry first if the cache is at capacity.
    pub async fn store(&self, user_id: &str, game_id: &str, action: &str, idempotency_key: &str, fingerprint: Value, result: Value) {
        let key = Self::key(user_id, game_id, action, idempotency_key);
        let now = Instant::now();

        let mut entries = self.entries.lock().await;
        let mut order = self.order.lock().await;

        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            if let Some(oldest) = order.first().cloned() {
                entries.remove(&oldest);
                order.retain(|k| k != &oldest);
            }
        }

        order.retain(|k| k != &key);
        order.push(key.clone());
        entries.insert(key, Entry { value: CachedAction { result, fingerprint, created_at: now } });
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
