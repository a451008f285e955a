//! SessionStore (spec §3 "ChatSession"): process-wide map keyed by
//! `chatId`, plain mutex-guarded the same way `ClarificationStore` and
//! `IdempotencyLayer`'s in-flight set are (spec §5: ambient ephemeral
//! state behind a plain mutex, not the durable store).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::ChatSession;

pub struct SessionStore {
    sessions: Mutex<HashMap<i64, ChatSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Runs `f` against the chat's session, creating a default one on first
    /// use, and returns `f`'s result.
    pub fn with_session<R>(&self, chat_id: i64, f: impl FnOnce(&mut ChatSession) -> R) -> R {
        let mut guard = self.sessions.lock().unwrap();
        let session = guard.entry(chat_id).or_default();
        f(session)
    }

    pub fn snapshot(&self, chat_id: i64) -> ChatSession {
        self.sessions.lock().unwrap().get(&chat_id).cloned().unwrap_or_default()
    }

    pub fn clear(&self, chat_id: i64) {
        self.sessions.lock().unwrap().remove(&chat_id);
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_session_created_lazily() {
        let store = SessionStore::new();
        let safe = store.with_session(1, |s| s.safe_mode);
        assert!(!safe);
    }

    #[test]
    fn test_mutation_persists_across_calls() {
        let store = SessionStore::new();
        store.with_session(1, |s| s.safe_mode = true);
        assert!(store.snapshot(1).safe_mode);
        assert!(!store.snapshot(2).safe_mode);
    }

    #[test]
    fn test_clear_resets_session() {
        let store = SessionStore::new();
        store.with_session(1, |s| s.admin_mode = true);
        store.clear(1);
        assert!(!store.snapshot(1).admin_mode);
    }
}
