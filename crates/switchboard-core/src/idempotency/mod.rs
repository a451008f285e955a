//! IdempotencyLayer (spec §4.C).
//!
//! `read`/`save` go through the [`crate::store::StateStore`]; `tryAcquire`
//! is a purely in-memory reservation (a second concurrent acquire for the
//! same key returns `false` until `release`), matching spec's explicit
//! "in-memory reservation" wording — this is not persisted, so a process
//! restart mid-request simply loses the reservation, which is fine since
//! the request itself didn't complete either.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::model::IdempotencyRecord;
use crate::store::StateStore;

fn request_id_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.:-]{6,180}$").unwrap())
}

pub fn is_valid_request_id(id: &str) -> bool {
    request_id_pattern().is_match(id)
}

pub struct IdempotencyLayer {
    store: Arc<dyn StateStore>,
    ttl_ms: i64,
    inflight: Mutex<HashSet<(i64, String)>>,
}

impl IdempotencyLayer {
    pub fn new(store: Arc<dyn StateStore>, ttl_ms: i64) -> Self {
        Self { store, ttl_ms, inflight: Mutex::new(HashSet::new()) }
    }

    pub fn read(&self, chat_id: i64, request_id: &str, now_ms: i64) -> Result<Option<Value>, StorageError> {
        let record = self.store.get_idempotency_hit(chat_id, request_id, now_ms, self.ttl_ms)?;
        Ok(record.map(|r| r.payload_json))
    }

    /// Returns `true` if the reservation was acquired, `false` if another
    /// in-flight request already holds it.
    pub async fn try_acquire(&self, chat_id: i64, request_id: &str) -> bool {
        let mut guard = self.inflight.lock().await;
        guard.insert((chat_id, request_id.to_string()))
    }

    pub async fn release(&self, chat_id: i64, request_id: &str) {
        let mut guard = self.inflight.lock().await;
        guard.remove(&(chat_id, request_id.to_string()));
    }

    pub fn save(&self, chat_id: i64, request_id: &str, response: Value, now_ms: i64) -> Result<(), StorageError> {
        self.store.save_idempotency_hit(&IdempotencyRecord {
            chat_id,
            request_id: request_id.to_string(),
            payload_json: response,
            created_at_ms: now_ms,
        })
    }

    pub fn prune(&self, now_ms: i64) -> Result<usize, StorageError> {
        self.store.prune_idempotency(now_ms - self.ttl_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStateStore;
    use serde_json::json;

    #[test]
    fn test_request_id_pattern() {
        assert!(is_valid_request_id("req-abc-123"));
        assert!(!is_valid_request_id("ab")); // too short
        assert!(!is_valid_request_id("has a space"));
    }

    #[test]
    fn test_replay_returns_byte_identical_response() {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let layer = IdempotencyLayer::new(store, 86_400_000);
        layer.save(1, "req-abc-123", json!({"ok": true, "replies": ["hi"]}), 1000).unwrap();

        let first = layer.read(1, "req-abc-123", 1010).unwrap().unwrap();
        let second = layer.read(1, "req-abc-123", 1020).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let layer = IdempotencyLayer::new(store, 1000);
        layer.save(1, "req-abc-123", json!({"ok": true}), 1000).unwrap();
        assert!(layer.read(1, "req-abc-123", 1500).unwrap().is_some());
        assert!(layer.read(1, "req-abc-123", 3000).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_acquire() {
        let store = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let layer = IdempotencyLayer::new(store, 86_400_000);
        assert!(layer.try_acquire(1, "req-abc-123").await);
        assert!(!layer.try_acquire(1, "req-abc-123").await);
        layer.release(1, "req-abc-123").await;
        assert!(layer.try_acquire(1, "req-abc-123").await);
    }
}
