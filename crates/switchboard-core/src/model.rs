//! Shared data model (spec §3).
//!
//! All timestamps are absolute UTC milliseconds. Identifiers are opaque
//! strings unless noted otherwise. Nothing in this module touches the
//! clock directly — callers inject `now_ms` so higher layers stay testable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A free-form message arriving from a transport (Telegram, HTTP bridge, CLI).
/// Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
    pub source: String,
    pub request_id: Option<String>,
    pub reply_reference: Option<ReplyRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRef {
    pub thread_ts: Option<String>,
}

/// A reply produced by the pipeline, destined for the egress transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundReply {
    pub chat_id: i64,
    pub text: String,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub chat_id: i64,
    pub role: Role,
    pub text: String,
    pub source: String,
    pub at_ms: i64,
    pub user_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexedListKind {
    WorkspaceList,
    StoredFiles,
    WebResults,
    GmailList,
}

/// The last ordered list shown to a chat. Exactly one per chat, overwritten
/// on each new domain list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedListContext {
    pub chat_id: i64,
    pub kind: IndexedListKind,
    pub items_json: Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingClarification {
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub source: String,
    pub original_text: String,
    pub question: String,
    pub route_hints: Vec<String>,
    pub preferred_route: Option<String>,
    pub preferred_action: Option<String>,
    pub missing: Vec<String>,
    pub requested_at_ms: i64,
    pub expires_at_ms: i64,
}

/// A pending workspace-delete confirmation. Modeled as a typed variant of
/// clarification rather than a separate table: it shares the same TTL and
/// yes/no-reply machinery (spec §4.D, scenario 2 in §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingWorkspaceDelete {
    pub chat_id: i64,
    pub path: String,
    pub requested_at_ms: i64,
    pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalKind {
    Exec,
    AiShell,
    Reboot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub id: String,
    pub kind: ApprovalKind,
    pub chat_id: i64,
    pub user_id: i64,
    pub agent_name: String,
    pub command_line: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Done,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryKind {
    Reminder,
    GmailSend,
    NaturalIntent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub chat_id: i64,
    pub user_id: Option<i64>,
    pub title: String,
    pub due_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub status: TaskStatus,
    pub completed_at: Option<i64>,
    pub canceled_at: Option<i64>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<i64>,
    pub delivery_kind: DeliveryKind,
    pub delivery_payload: Option<Value>,
}

impl ScheduledTask {
    /// `status=pending ∧ dueAt≤now ∧ (retryAfter=∅ ∨ retryAfter≤now)`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.status == TaskStatus::Pending
            && self.due_at <= now_ms
            && self.retry_after.map_or(true, |r| r <= now_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: i64,
    pub chat_id: i64,
    pub text: String,
    pub source: String,
    pub created_at_ms: i64,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub chat_id: i64,
    pub request_id: String,
    pub payload_json: Value,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedRecipient {
    pub chat_id: i64,
    pub name_key: String,
    pub name: String,
    pub email: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Normalizes a display name into its lookup key: lowercase, diacritics
/// stripped, punctuation collapsed to single spaces.
pub fn normalize_name_key(name: &str) -> String {
    let lower = name.to_lowercase();
    let stripped: String = lower
        .chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            c => c,
        })
        .collect();
    let mut out = String::with_capacity(stripped.len());
    let mut last_was_space = false;
    for c in stripped.chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_was_space = false;
        } else if !last_was_space {
            out.push(' ');
            last_was_space = true;
        }
    }
    out.trim().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticRouteConfig {
    pub name: String,
    pub threshold: f64,
    pub utterances: Vec<String>,
    #[serde(default)]
    pub negative_utterances: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterVersionSnapshot {
    pub id: String,
    pub created_at: i64,
    pub label: String,
    pub routes: Vec<SemanticRouteConfig>,
    pub hybrid_alpha: f64,
    pub min_score_gap: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Exec,
    AiShell,
    GmailSend,
    WorkspaceDelete,
    Reboot,
    SelfUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPolicy {
    pub version: u32,
    pub preview_required: Vec<Capability>,
    pub approval_required: Vec<Capability>,
    pub block_in_safe_mode: Vec<Capability>,
}

impl Default for AgentPolicy {
    fn default() -> Self {
        Self {
            version: 1,
            preview_required: vec![Capability::WorkspaceDelete],
            approval_required: vec![Capability::Exec, Capability::AiShell, Capability::Reboot],
            block_in_safe_mode: vec![
                Capability::Exec,
                Capability::AiShell,
                Capability::Reboot,
                Capability::SelfUpdate,
                Capability::WorkspaceDelete,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityProfileName {
    Safe,
    Standard,
    FullControl,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityProfile {
    pub name: SecurityProfileName,
    pub allow_ai_shell: bool,
    pub allow_reboot: bool,
    pub force_approval_mode: bool,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            name: SecurityProfileName::Standard,
            allow_ai_shell: false,
            allow_reboot: false,
            force_approval_mode: true,
        }
    }
}

/// The set of handlers the router can choose from (spec §4.E).
pub const ROUTE_DOMAINS: &[&str] = &[
    "gmail",
    "gmail-recipients",
    "workspace",
    "document",
    "schedule",
    "memory",
    "web",
    "connector",
    "self-maintenance",
    "stoic-smalltalk",
    "ai-shell",
];

/// Chat-scoped mutable session state held in process memory.
#[derive(Debug, Clone, Default)]
pub struct ChatSession {
    pub pending_clarification: Option<PendingClarification>,
    pub pending_workspace_delete: Option<PendingWorkspaceDelete>,
    pub eco_mode: bool,
    pub safe_mode: bool,
    pub admin_mode: bool,
    pub ai_provider_override: Option<String>,
    pub extra: HashMap<String, Value>,
}
