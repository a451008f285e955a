//! StateStore (spec §4.A, §6.3).
//!
//! Backing store is `rusqlite` in WAL mode with `synchronous=NORMAL`, exactly
//! the embedded-SQL posture spec.md calls for. Every mutator takes an
//! explicit `now_ms` — the store itself never reads the clock, so tests can
//! drive it deterministically. All operations are synchronous (`rusqlite`
//! is synchronous by nature); the `StateStore` trait is `Send + Sync` and
//! callers wrap access in `tokio::task::spawn_blocking` or a single-writer
//! mutex as their concurrency model (§5) requires.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::StorageError;
use crate::model::*;

pub trait StateStore: Send + Sync {
    fn append_conversation_turn(&self, turn: &ConversationTurn) -> Result<(), StorageError>;
    fn list_recent_conversation_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<ConversationTurn>, StorageError>;

    fn upsert_indexed_list_context(&self, ctx: &IndexedListContext) -> Result<(), StorageError>;
    fn get_indexed_list_context(&self, chat_id: i64) -> Result<Option<IndexedListContext>, StorageError>;
    fn delete_indexed_list_context(&self, chat_id: i64) -> Result<(), StorageError>;

    fn get_idempotency_hit(&self, chat_id: i64, request_id: &str, now_ms: i64, ttl_ms: i64) -> Result<Option<IdempotencyRecord>, StorageError>;
    fn save_idempotency_hit(&self, record: &IdempotencyRecord) -> Result<(), StorageError>;
    fn prune_idempotency(&self, before_ms: i64) -> Result<usize, StorageError>;

    fn enqueue_outbox(&self, msg: &OutboxMessage) -> Result<i64, StorageError>;
    fn list_due_outbox_messages(&self, now_ms: i64, limit: usize) -> Result<Vec<OutboxMessage>, StorageError>;
    fn mark_outbox_attempt(&self, id: i64, next_attempt_at_ms: i64, last_error: Option<&str>) -> Result<(), StorageError>;
    fn delete_outbox(&self, id: i64) -> Result<(), StorageError>;
    fn move_outbox_to_dead_letter(&self, id: i64) -> Result<(), StorageError>;

    fn create_task(&self, task: &ScheduledTask) -> Result<(), StorageError>;
    fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StorageError>;
    fn list_pending_tasks_for_chat(&self, chat_id: i64) -> Result<Vec<ScheduledTask>, StorageError>;
    fn due_scheduled_tasks(&self, now_ms: i64) -> Result<Vec<ScheduledTask>, StorageError>;
    fn mark_delivered(&self, id: &str, now_ms: i64) -> Result<(), StorageError>;
    fn mark_delivery_failure(&self, id: &str, now_ms: i64, err: &str, retry_after_ms: i64) -> Result<(), StorageError>;
    fn cancel_task(&self, id: &str, now_ms: i64) -> Result<bool, StorageError>;

    fn upsert_recipient(&self, r: &SavedRecipient) -> Result<(), StorageError>;
    fn get_recipient(&self, chat_id: i64, name_key: &str) -> Result<Option<SavedRecipient>, StorageError>;
    fn list_recipients(&self, chat_id: i64) -> Result<Vec<SavedRecipient>, StorageError>;

    fn save_approval(&self, a: &PendingApproval) -> Result<(), StorageError>;
    fn get_approval(&self, id: &str) -> Result<Option<PendingApproval>, StorageError>;
    fn consume_approval(&self, id: &str) -> Result<(), StorageError>;
    fn list_unexpired_approvals(&self, now_ms: i64) -> Result<Vec<PendingApproval>, StorageError>;

    fn save_version_snapshot(&self, snap: &RouterVersionSnapshot) -> Result<(), StorageError>;
    fn list_version_snapshots(&self) -> Result<Vec<RouterVersionSnapshot>, StorageError>;

    /// Drops rows past their retention window across prunable tables.
    /// Returns the number of rows removed.
    fn prune(&self, now_ms: i64, idempotency_ttl_ms: i64) -> Result<usize, StorageError>;
}

/// `rusqlite::Connection` behind a mutex: spec §5 calls for "a single
/// connection with serialized writes; multiple readers allowed" for the
/// store, which in a single-`Connection` model collapses to a mutex around
/// the one handle — simplest posture matching the single-process non-goal.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Mutex::new(conn) };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS conversation_turns (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 chat_id INTEGER NOT NULL,
                 role TEXT NOT NULL,
                 text TEXT NOT NULL,
                 source TEXT NOT NULL,
                 at_ms INTEGER NOT NULL,
                 user_id INTEGER
             );
             CREATE INDEX IF NOT EXISTS idx_turns_chat ON conversation_turns(chat_id, at_ms);

             CREATE TABLE IF NOT EXISTS indexed_list_context (
                 chat_id INTEGER PRIMARY KEY,
                 kind TEXT NOT NULL,
                 items_json TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS idempotency (
                 chat_id INTEGER NOT NULL,
                 request_id TEXT NOT NULL,
                 payload_json TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL,
                 PRIMARY KEY (chat_id, request_id)
             );

             CREATE TABLE IF NOT EXISTS outbox (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 chat_id INTEGER NOT NULL,
                 text TEXT NOT NULL,
                 source TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL,
                 attempts INTEGER NOT NULL DEFAULT 0,
                 last_error TEXT,
                 next_attempt_at_ms INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS outbox_dead_letter (
                 id INTEGER PRIMARY KEY,
                 chat_id INTEGER NOT NULL,
                 text TEXT NOT NULL,
                 source TEXT NOT NULL,
                 created_at_ms INTEGER NOT NULL,
                 attempts INTEGER NOT NULL,
                 last_error TEXT,
                 dead_at_ms INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS scheduled_tasks (
                 id TEXT PRIMARY KEY,
                 chat_id INTEGER NOT NULL,
                 user_id INTEGER,
                 title TEXT NOT NULL,
                 due_at INTEGER NOT NULL,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL,
                 status TEXT NOT NULL,
                 completed_at INTEGER,
                 canceled_at INTEGER,
                 failure_count INTEGER NOT NULL DEFAULT 0,
                 last_error TEXT,
                 retry_after INTEGER,
                 delivery_kind TEXT NOT NULL,
                 delivery_payload TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_tasks_chat ON scheduled_tasks(chat_id, status);

             CREATE TABLE IF NOT EXISTS recipients (
                 chat_id INTEGER NOT NULL,
                 name_key TEXT NOT NULL,
                 name TEXT NOT NULL,
                 email TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL,
                 PRIMARY KEY (chat_id, name_key)
             );

             CREATE TABLE IF NOT EXISTS approvals (
                 id TEXT PRIMARY KEY,
                 kind TEXT NOT NULL,
                 chat_id INTEGER NOT NULL,
                 user_id INTEGER NOT NULL,
                 agent_name TEXT NOT NULL,
                 command_line TEXT NOT NULL,
                 created_at INTEGER NOT NULL,
                 expires_at INTEGER NOT NULL,
                 note TEXT
             );

             CREATE TABLE IF NOT EXISTS router_version_snapshots (
                 id TEXT PRIMARY KEY,
                 created_at INTEGER NOT NULL,
                 label TEXT NOT NULL,
                 body_json TEXT NOT NULL
             );
             ",
        )?;
        Ok(())
    }
}

fn role_str(r: Role) -> &'static str {
    match r {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn role_from_str(s: &str) -> Role {
    match s {
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

fn kind_str(k: IndexedListKind) -> &'static str {
    match k {
        IndexedListKind::WorkspaceList => "workspace-list",
        IndexedListKind::StoredFiles => "stored-files",
        IndexedListKind::WebResults => "web-results",
        IndexedListKind::GmailList => "gmail-list",
    }
}

fn kind_from_str(s: &str) -> IndexedListKind {
    match s {
        "stored-files" => IndexedListKind::StoredFiles,
        "web-results" => IndexedListKind::WebResults,
        "gmail-list" => IndexedListKind::GmailList,
        _ => IndexedListKind::WorkspaceList,
    }
}

fn status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Done => "done",
        TaskStatus::Canceled => "canceled",
    }
}

fn status_from_str(s: &str) -> TaskStatus {
    match s {
        "done" => TaskStatus::Done,
        "canceled" => TaskStatus::Canceled,
        _ => TaskStatus::Pending,
    }
}

fn delivery_kind_str(k: DeliveryKind) -> &'static str {
    match k {
        DeliveryKind::Reminder => "reminder",
        DeliveryKind::GmailSend => "gmail-send",
        DeliveryKind::NaturalIntent => "natural-intent",
    }
}

fn delivery_kind_from_str(s: &str) -> DeliveryKind {
    match s {
        "gmail-send" => DeliveryKind::GmailSend,
        "natural-intent" => DeliveryKind::NaturalIntent,
        _ => DeliveryKind::Reminder,
    }
}

fn approval_kind_str(k: ApprovalKind) -> &'static str {
    match k {
        ApprovalKind::Exec => "exec",
        ApprovalKind::AiShell => "ai-shell",
        ApprovalKind::Reboot => "reboot",
    }
}

fn approval_kind_from_str(s: &str) -> ApprovalKind {
    match s {
        "ai-shell" => ApprovalKind::AiShell,
        "reboot" => ApprovalKind::Reboot,
        _ => ApprovalKind::Exec,
    }
}

fn task_from_row(row: &rusqlite::Row) -> rusqlite::Result<ScheduledTask> {
    let status: String = row.get("status")?;
    let delivery_kind: String = row.get("delivery_kind")?;
    let payload: Option<String> = row.get("delivery_payload")?;
    Ok(ScheduledTask {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        due_at: row.get("due_at")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        status: status_from_str(&status),
        completed_at: row.get("completed_at")?,
        canceled_at: row.get("canceled_at")?,
        failure_count: row.get("failure_count")?,
        last_error: row.get("last_error")?,
        retry_after: row.get("retry_after")?,
        delivery_kind: delivery_kind_from_str(&delivery_kind),
        delivery_payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
    })
}

impl StateStore for SqliteStateStore {
    fn append_conversation_turn(&self, turn: &ConversationTurn) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO conversation_turns (chat_id, role, text, source, at_ms, user_id) VALUES (?1,?2,?3,?4,?5,?6)",
            params![turn.chat_id, role_str(turn.role), turn.text, turn.source, turn.at_ms, turn.user_id],
        )?;
        Ok(())
    }

    fn list_recent_conversation_turns(&self, chat_id: i64, limit: usize) -> Result<Vec<ConversationTurn>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, role, text, source, at_ms, user_id FROM conversation_turns
             WHERE chat_id = ?1 ORDER BY at_ms DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![chat_id, limit as i64], |row| {
            let role: String = row.get(1)?;
            Ok(ConversationTurn {
                chat_id: row.get(0)?,
                role: role_from_str(&role),
                text: row.get(2)?,
                source: row.get(3)?,
                at_ms: row.get(4)?,
                user_id: row.get(5)?,
            })
        })?;
        let mut out: Vec<ConversationTurn> = rows.collect::<Result<_, _>>()?;
        out.reverse();
        Ok(out)
    }

    fn upsert_indexed_list_context(&self, ctx: &IndexedListContext) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO indexed_list_context (chat_id, kind, items_json, created_at_ms) VALUES (?1,?2,?3,?4)
             ON CONFLICT(chat_id) DO UPDATE SET kind=excluded.kind, items_json=excluded.items_json, created_at_ms=excluded.created_at_ms",
            params![ctx.chat_id, kind_str(ctx.kind), ctx.items_json.to_string(), ctx.created_at_ms],
        )?;
        Ok(())
    }

    fn get_indexed_list_context(&self, chat_id: i64) -> Result<Option<IndexedListContext>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT chat_id, kind, items_json, created_at_ms FROM indexed_list_context WHERE chat_id=?1",
                params![chat_id],
                |row| {
                    let kind: String = row.get(1)?;
                    let items: String = row.get(2)?;
                    Ok(IndexedListContext {
                        chat_id: row.get(0)?,
                        kind: kind_from_str(&kind),
                        items_json: serde_json::from_str(&items).unwrap_or(Value::Null),
                        created_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn delete_indexed_list_context(&self, chat_id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM indexed_list_context WHERE chat_id=?1", params![chat_id])?;
        Ok(())
    }

    fn get_idempotency_hit(&self, chat_id: i64, request_id: &str, now_ms: i64, ttl_ms: i64) -> Result<Option<IdempotencyRecord>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT chat_id, request_id, payload_json, created_at_ms FROM idempotency WHERE chat_id=?1 AND request_id=?2",
                params![chat_id, request_id],
                |row| {
                    let payload: String = row.get(2)?;
                    Ok(IdempotencyRecord {
                        chat_id: row.get(0)?,
                        request_id: row.get(1)?,
                        payload_json: serde_json::from_str(&payload).unwrap_or(Value::Null),
                        created_at_ms: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(result.filter(|r| now_ms - r.created_at_ms <= ttl_ms))
    }

    fn save_idempotency_hit(&self, record: &IdempotencyRecord) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO idempotency (chat_id, request_id, payload_json, created_at_ms) VALUES (?1,?2,?3,?4)",
            params![record.chat_id, record.request_id, record.payload_json.to_string(), record.created_at_ms],
        )?;
        Ok(())
    }

    fn prune_idempotency(&self, before_ms: i64) -> Result<usize, StorageError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM idempotency WHERE created_at_ms < ?1", params![before_ms])?;
        Ok(n)
    }

    fn enqueue_outbox(&self, msg: &OutboxMessage) -> Result<i64, StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outbox (chat_id, text, source, created_at_ms, attempts, last_error, next_attempt_at_ms)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![msg.chat_id, msg.text, msg.source, msg.created_at_ms, msg.attempts, msg.last_error, msg.next_attempt_at_ms],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn list_due_outbox_messages(&self, now_ms: i64, limit: usize) -> Result<Vec<OutboxMessage>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, text, source, created_at_ms, attempts, last_error, next_attempt_at_ms
             FROM outbox WHERE next_attempt_at_ms <= ?1 ORDER BY next_attempt_at_ms ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now_ms, limit as i64], |row| {
            Ok(OutboxMessage {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                text: row.get(2)?,
                source: row.get(3)?,
                created_at_ms: row.get(4)?,
                attempts: row.get(5)?,
                last_error: row.get(6)?,
                next_attempt_at_ms: row.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn mark_outbox_attempt(&self, id: i64, next_attempt_at_ms: i64, last_error: Option<&str>) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1, next_attempt_at_ms=?2, last_error=?3 WHERE id=?1",
            params![id, next_attempt_at_ms, last_error],
        )?;
        Ok(())
    }

    fn delete_outbox(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM outbox WHERE id=?1", params![id])?;
        Ok(())
    }

    fn move_outbox_to_dead_letter(&self, id: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO outbox_dead_letter (id, chat_id, text, source, created_at_ms, attempts, last_error, dead_at_ms)
             SELECT id, chat_id, text, source, created_at_ms, attempts, last_error, ?2 FROM outbox WHERE id=?1",
            params![id, chrono::Utc::now().timestamp_millis()],
        )?;
        conn.execute("DELETE FROM outbox WHERE id=?1", params![id])?;
        Ok(())
    }

    fn create_task(&self, task: &ScheduledTask) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scheduled_tasks (id, chat_id, user_id, title, due_at, created_at, updated_at, status,
                completed_at, canceled_at, failure_count, last_error, retry_after, delivery_kind, delivery_payload)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                task.id, task.chat_id, task.user_id, task.title, task.due_at, task.created_at, task.updated_at,
                status_str(task.status), task.completed_at, task.canceled_at, task.failure_count, task.last_error,
                task.retry_after, delivery_kind_str(task.delivery_kind),
                task.delivery_payload.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row("SELECT * FROM scheduled_tasks WHERE id=?1", params![id], task_from_row)
            .optional()?;
        Ok(result)
    }

    fn list_pending_tasks_for_chat(&self, chat_id: i64) -> Result<Vec<ScheduledTask>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE chat_id=?1 AND status='pending' ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], task_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn due_scheduled_tasks(&self, now_ms: i64) -> Result<Vec<ScheduledTask>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM scheduled_tasks WHERE status='pending' AND due_at<=?1
             AND (retry_after IS NULL OR retry_after<=?1)",
        )?;
        let rows = stmt.query_map(params![now_ms], task_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn mark_delivered(&self, id: &str, now_ms: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_tasks SET status='done', completed_at=?2, updated_at=?2 WHERE id=?1 AND status='pending'",
            params![id, now_ms],
        )?;
        Ok(())
    }

    fn mark_delivery_failure(&self, id: &str, now_ms: i64, err: &str, retry_after_ms: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE scheduled_tasks SET failure_count = failure_count + 1, last_error=?3, retry_after=?4, updated_at=?2
             WHERE id=?1 AND status='pending'",
            params![id, now_ms, err, retry_after_ms],
        )?;
        Ok(())
    }

    fn cancel_task(&self, id: &str, now_ms: i64) -> Result<bool, StorageError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE scheduled_tasks SET status='canceled', canceled_at=?2, updated_at=?2 WHERE id=?1 AND status='pending'",
            params![id, now_ms],
        )?;
        Ok(n > 0)
    }

    fn upsert_recipient(&self, r: &SavedRecipient) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO recipients (chat_id, name_key, name, email, created_at, updated_at) VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(chat_id, name_key) DO UPDATE SET name=excluded.name, email=excluded.email, updated_at=excluded.updated_at",
            params![r.chat_id, r.name_key, r.name, r.email, r.created_at, r.updated_at],
        )?;
        Ok(())
    }

    fn get_recipient(&self, chat_id: i64, name_key: &str) -> Result<Option<SavedRecipient>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT chat_id, name_key, name, email, created_at, updated_at FROM recipients WHERE chat_id=?1 AND name_key=?2",
                params![chat_id, name_key],
                |row| {
                    Ok(SavedRecipient {
                        chat_id: row.get(0)?,
                        name_key: row.get(1)?,
                        name: row.get(2)?,
                        email: row.get(3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn list_recipients(&self, chat_id: i64) -> Result<Vec<SavedRecipient>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT chat_id, name_key, name, email, created_at, updated_at FROM recipients WHERE chat_id=?1 ORDER BY name ASC",
        )?;
        let rows = stmt.query_map(params![chat_id], |row| {
            Ok(SavedRecipient {
                chat_id: row.get(0)?,
                name_key: row.get(1)?,
                name: row.get(2)?,
                email: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn save_approval(&self, a: &PendingApproval) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO approvals (id, kind, chat_id, user_id, agent_name, command_line, created_at, expires_at, note)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![a.id, approval_kind_str(a.kind), a.chat_id, a.user_id, a.agent_name, a.command_line, a.created_at, a.expires_at, a.note],
        )?;
        Ok(())
    }

    fn get_approval(&self, id: &str) -> Result<Option<PendingApproval>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .query_row(
                "SELECT id, kind, chat_id, user_id, agent_name, command_line, created_at, expires_at, note FROM approvals WHERE id=?1",
                params![id],
                |row| {
                    let kind: String = row.get(1)?;
                    Ok(PendingApproval {
                        id: row.get(0)?,
                        kind: approval_kind_from_str(&kind),
                        chat_id: row.get(2)?,
                        user_id: row.get(3)?,
                        agent_name: row.get(4)?,
                        command_line: row.get(5)?,
                        created_at: row.get(6)?,
                        expires_at: row.get(7)?,
                        note: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    fn consume_approval(&self, id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM approvals WHERE id=?1", params![id])?;
        Ok(())
    }

    fn list_unexpired_approvals(&self, now_ms: i64) -> Result<Vec<PendingApproval>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, kind, chat_id, user_id, agent_name, command_line, created_at, expires_at, note FROM approvals WHERE expires_at > ?1",
        )?;
        let rows = stmt.query_map(params![now_ms], |row| {
            let kind: String = row.get(1)?;
            Ok(PendingApproval {
                id: row.get(0)?,
                kind: approval_kind_from_str(&kind),
                chat_id: row.get(2)?,
                user_id: row.get(3)?,
                agent_name: row.get(4)?,
                command_line: row.get(5)?,
                created_at: row.get(6)?,
                expires_at: row.get(7)?,
                note: row.get(8)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn save_version_snapshot(&self, snap: &RouterVersionSnapshot) -> Result<(), StorageError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO router_version_snapshots (id, created_at, label, body_json) VALUES (?1,?2,?3,?4)",
            params![snap.id, snap.created_at, snap.label, serde_json::to_string(snap).unwrap_or_default()],
        )?;
        // Keep a bounded ring of at most 50 snapshots (spec §3).
        conn.execute(
            "DELETE FROM router_version_snapshots WHERE id NOT IN
             (SELECT id FROM router_version_snapshots ORDER BY created_at DESC LIMIT 50)",
            [],
        )?;
        Ok(())
    }

    fn list_version_snapshots(&self) -> Result<Vec<RouterVersionSnapshot>, StorageError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT body_json FROM router_version_snapshots ORDER BY created_at DESC")?;
        let rows = stmt.query_map([], |row| {
            let body: String = row.get(0)?;
            Ok(body)
        })?;
        let mut out = Vec::new();
        for body in rows {
            if let Ok(snap) = serde_json::from_str(&body?) {
                out.push(snap);
            }
        }
        Ok(out)
    }

    fn prune(&self, now_ms: i64, idempotency_ttl_ms: i64) -> Result<usize, StorageError> {
        let mut total = self.prune_idempotency(now_ms - idempotency_ttl_ms)?;
        let conn = self.conn.lock().unwrap();
        total += conn.execute("DELETE FROM approvals WHERE expires_at <= ?1", params![now_ms])?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStateStore {
        SqliteStateStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_conversation_turns_ordering() {
        let s = store();
        for i in 0..3 {
            s.append_conversation_turn(&ConversationTurn {
                chat_id: 1,
                role: Role::User,
                text: format!("msg{i}"),
                source: "cli".into(),
                at_ms: 1000 + i,
                user_id: Some(9),
            })
            .unwrap();
        }
        let turns = s.list_recent_conversation_turns(1, 10).unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].text, "msg0");
        assert_eq!(turns[2].text, "msg2");
    }

    #[test]
    fn test_idempotency_ttl() {
        let s = store();
        s.save_idempotency_hit(&IdempotencyRecord {
            chat_id: 1,
            request_id: "req-1".into(),
            payload_json: serde_json::json!({"ok": true}),
            created_at_ms: 1000,
        })
        .unwrap();
        assert!(s.get_idempotency_hit(1, "req-1", 2000, 86_400_000).unwrap().is_some());
        assert!(s.get_idempotency_hit(1, "req-1", 2_000_000_000, 86_400_000).unwrap().is_none());
    }

    #[test]
    fn test_recipient_upsert_roundtrip() {
        let s = store();
        let key = normalize_name_key("Ana María");
        s.upsert_recipient(&SavedRecipient {
            chat_id: 1,
            name_key: key.clone(),
            name: "Ana María".into(),
            email: "ana@empresa.com".into(),
            created_at: 1,
            updated_at: 1,
        })
        .unwrap();
        let found = s.get_recipient(1, &key).unwrap().unwrap();
        assert_eq!(found.email, "ana@empresa.com");
        assert_eq!(found.name_key, key);
    }

    #[test]
    fn test_task_cancel_then_mark_delivered_is_impossible() {
        let s = store();
        let task = ScheduledTask {
            id: "tsk-abc".into(),
            chat_id: 1,
            user_id: None,
            title: "ping".into(),
            due_at: 1000,
            created_at: 1000,
            updated_at: 1000,
            status: TaskStatus::Pending,
            completed_at: None,
            canceled_at: None,
            failure_count: 0,
            last_error: None,
            retry_after: None,
            delivery_kind: DeliveryKind::Reminder,
            delivery_payload: None,
        };
        s.create_task(&task).unwrap();
        assert!(s.cancel_task("tsk-abc", 2000).unwrap());
        s.mark_delivered("tsk-abc", 3000).unwrap();
        let reloaded = s.get_task("tsk-abc").unwrap().unwrap();
        assert_eq!(reloaded.status, TaskStatus::Canceled);
    }

    #[test]
    fn test_due_scheduled_tasks_respects_retry_after() {
        let s = store();
        let task = ScheduledTask {
            id: "tsk-x".into(),
            chat_id: 1,
            user_id: None,
            title: "t".into(),
            due_at: 1000,
            created_at: 1000,
            updated_at: 1000,
            status: TaskStatus::Pending,
            completed_at: None,
            canceled_at: None,
            failure_count: 1,
            last_error: Some("boom".into()),
            retry_after: Some(5000),
            delivery_kind: DeliveryKind::Reminder,
            delivery_payload: None,
        };
        s.create_task(&task).unwrap();
        assert!(s.due_scheduled_tasks(2000).unwrap().is_empty());
        assert_eq!(s.due_scheduled_tasks(5000).unwrap().len(), 1);
    }
}
