//! AdminSecurity (spec §4.K): 4-digit approval IDs, panic mode, and the
//! mutex-guarded fast-lookup cache sitting in front of the durable
//! `approvals` table (see DESIGN.md's resolution of the §3/§5 tension
//! between "persisted" and "plain mutex" for approvals).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::warn;

use crate::error::StorageError;
use crate::model::{ApprovalKind, Capability, PendingApproval};
use crate::store::StateStore;

const MAX_ID_COLLISION_RETRIES: u32 = 20;

pub struct AdminSecurity {
    store: Arc<dyn StateStore>,
    cache: Mutex<HashMap<String, PendingApproval>>,
    panic_mode: AtomicBool,
}

impl AdminSecurity {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store, cache: Mutex::new(HashMap::new()), panic_mode: AtomicBool::new(false) }
    }

    pub fn set_panic_mode(&self, enabled: bool) {
        if enabled {
            warn!("panic mode engaged: all capability execution blocked");
        }
        self.panic_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn panic_mode(&self) -> bool {
        self.panic_mode.load(Ordering::SeqCst)
    }

    /// Registers a new pending approval under a fresh 4-digit ID, retrying
    /// on collision up to [`MAX_ID_COLLISION_RETRIES`] times.
    pub fn request_approval(
        &self,
        kind: ApprovalKind,
        chat_id: i64,
        user_id: i64,
        agent_name: &str,
        command_line: &str,
        note: Option<String>,
        now_ms: i64,
        ttl_ms: i64,
    ) -> Result<PendingApproval, StorageError> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_ID_COLLISION_RETRIES {
            let id = format!("{:04}", rng.gen_range(0..10_000));
            if self.store.get_approval(&id)?.is_some() {
                continue;
            }
            let approval = PendingApproval {
                id: id.clone(),
                kind,
                chat_id,
                user_id,
                agent_name: agent_name.to_string(),
                command_line: command_line.to_string(),
                created_at: now_ms,
                expires_at: now_ms + ttl_ms,
                note,
            };
            self.store.save_approval(&approval)?;
            self.cache.lock().unwrap().insert(id, approval.clone());
            return Ok(approval);
        }
        Err(StorageError::Transient("exhausted approval ID collision retries".into()))
    }

    /// Looks up and consumes an approval. If `chat_id` is provided, the
    /// approval must belong to that chat (cross-chat approval IDs are
    /// rejected even if numerically correct).
    pub fn consume(&self, id: &str, chat_id: Option<i64>, now_ms: i64) -> Result<Option<PendingApproval>, StorageError> {
        let approval = {
            let cached = self.cache.lock().unwrap().get(id).cloned();
            match cached {
                Some(a) => Some(a),
                None => self.store.get_approval(id)?,
            }
        };

        let Some(approval) = approval else { return Ok(None) };
        if approval.expires_at < now_ms {
            return Ok(None);
        }
        if let Some(cid) = chat_id {
            if cid != approval.chat_id {
                return Ok(None);
            }
        }

        self.store.consume_approval(id)?;
        self.cache.lock().unwrap().remove(id);
        Ok(Some(approval))
    }

    /// Whether `capability` is currently blocked, combining safe mode and
    /// panic mode (panic mode additionally ignores chat-level admin mode).
    pub fn is_blocked(&self, capability: Capability, safe_mode: bool, block_in_safe_mode: &[Capability]) -> bool {
        if self.panic_mode() && block_in_safe_mode.contains(&capability) {
            return true;
        }
        safe_mode && block_in_safe_mode.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStateStore;

    fn admin() -> AdminSecurity {
        AdminSecurity::new(Arc::new(SqliteStateStore::open_in_memory().unwrap()))
    }

    #[test]
    fn test_request_and_consume_roundtrip() {
        let a = admin();
        let approval = a.request_approval(ApprovalKind::Exec, 1, 1, "agent", "rm -rf /tmp/x", None, 1000, 60_000).unwrap();
        assert_eq!(approval.id.len(), 4);
        let consumed = a.consume(&approval.id, Some(1), 2000).unwrap();
        assert!(consumed.is_some());
        assert!(a.consume(&approval.id, Some(1), 2000).unwrap().is_none());
    }

    #[test]
    fn test_consume_rejects_wrong_chat() {
        let a = admin();
        let approval = a.request_approval(ApprovalKind::Exec, 1, 1, "agent", "cmd", None, 1000, 60_000).unwrap();
        assert!(a.consume(&approval.id, Some(99), 2000).unwrap().is_none());
    }

    #[test]
    fn test_panic_mode_blocks_regardless_of_safe_mode() {
        let a = admin();
        a.set_panic_mode(true);
        assert!(a.is_blocked(Capability::Exec, false, &[Capability::Exec]));
    }

    #[test]
    fn test_expired_approval_not_consumable() {
        let a = admin();
        let approval = a.request_approval(ApprovalKind::Exec, 1, 1, "agent", "cmd", None, 1000, 500).unwrap();
        assert!(a.consume(&approval.id, Some(1), 2000).unwrap().is_none());
    }
}
