//! ClarificationStore (spec §4.D).
//!
//! At-most-one pending clarification per chat, held in a plain mutex-guarded
//! map (spec §5: "clarification store… plain mutex"). The reply-detection
//! rule set lives alongside the store since it only ever operates on the
//! store's own entries.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;

use crate::model::PendingClarification;

pub struct ClarificationStore {
    ttl_ms: i64,
    entries: Mutex<HashMap<i64, PendingClarification>>,
}

impl ClarificationStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self { ttl_ms, entries: Mutex::new(HashMap::new()) }
    }

    /// Replaces any prior entry for the chat and stamps `expires_at_ms`.
    pub fn register(&self, mut pending: PendingClarification, now_ms: i64) {
        pending.expires_at_ms = now_ms + self.ttl_ms;
        self.entries.lock().unwrap().insert(pending.chat_id, pending);
    }

    /// Looks at a pending entry without consuming it. Entries past
    /// `expires_at_ms`, or whose `user_id` is set and mismatches, are
    /// treated as absent.
    pub fn peek(&self, chat_id: i64, user_id: Option<i64>, now_ms: i64) -> Option<PendingClarification> {
        let guard = self.entries.lock().unwrap();
        guard.get(&chat_id).and_then(|p| visible(p, user_id, now_ms).then(|| p.clone()))
    }

    pub fn consume(&self, chat_id: i64, user_id: Option<i64>, now_ms: i64) -> Option<PendingClarification> {
        let mut guard = self.entries.lock().unwrap();
        let visible_now = guard.get(&chat_id).map_or(false, |p| visible(p, user_id, now_ms));
        if visible_now {
            guard.remove(&chat_id)
        } else {
            None
        }
    }

    pub fn clear(&self, chat_id: i64) {
        self.entries.lock().unwrap().remove(&chat_id);
    }
}

fn visible(p: &PendingClarification, user_id: Option<i64>, now_ms: i64) -> bool {
    if now_ms > p.expires_at_ms {
        return false;
    }
    if let (Some(pending_user), Some(asking_user)) = (p.user_id, user_id) {
        if pending_user != asking_user {
            return false;
        }
    }
    true
}

/// Outcome of checking whether an inbound message answers the pending
/// clarification (spec §4.D rule set).
#[derive(Debug, PartialEq)]
pub enum ReplyDecision {
    /// Treat as a reply; rebuild the text with the clarification context.
    Reply { rebuilt_text: String },
    /// Not a reply — a fresh directive dropped the pending clarification.
    Dropped,
    /// Not a reply, and the pending clarification should stay active.
    NotAReply,
}

const YES_NO_WORDS: &[&str] = &["si", "sí", "no", "yes", "nope", "cancelar", "cancel", "ok", "vale"];

/// Applies the four-rule decision procedure from spec §4.D.
pub fn classify_reply(pending: &PendingClarification, text: &str) -> ReplyDecision {
    let normalized = normalize(text);

    // Rule 1: simple yes/no/cancel words.
    if YES_NO_WORDS.contains(&normalized.as_str()) {
        return ReplyDecision::Reply { rebuilt_text: rebuild(pending, text) };
    }

    // Rule 2: equals/contains preferredRoute or any routeHint.
    if let Some(route) = &pending.preferred_route {
        if normalized.contains(&normalize(route)) {
            return ReplyDecision::Reply { rebuilt_text: rebuild(pending, text) };
        }
    }
    for hint in &pending.route_hints {
        if normalized.contains(&normalize(hint)) {
            return ReplyDecision::Reply { rebuilt_text: rebuild(pending, text) };
        }
    }

    // Rule 3: per-missing-item token tests.
    for missing in &pending.missing {
        if matches_missing_kind(missing, text) {
            return ReplyDecision::Reply { rebuilt_text: rebuild(pending, text) };
        }
    }

    // Rule 4: fresh directive (operational verb + domain noun, >= 10 chars) drops it.
    if text.trim().chars().count() >= 10 && looks_like_fresh_directive(&normalized) {
        return ReplyDecision::Dropped;
    }

    ReplyDecision::NotAReply
}

fn rebuild(pending: &PendingClarification, reply: &str) -> String {
    format!(
        "{}\nContexto previo: {}\nAclaración del usuario: {}",
        pending.original_text, pending.question, reply
    )
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

const OPERATIONAL_VERBS: &[&str] = &[
    "enviar", "envia", "manda", "elimina", "borra", "crea", "agenda", "programa", "busca",
    "muestra", "lista", "abre", "cancela", "recuerda",
];

const DOMAIN_NOUNS: &[&str] = &[
    "correo", "email", "gmail", "workspace", "archivo", "carpeta", "tarea", "recordatorio",
    "web", "internet", "conector", "memoria",
];

fn looks_like_fresh_directive(normalized: &str) -> bool {
    let has_verb = OPERATIONAL_VERBS.iter().any(|v| normalized.contains(v));
    let has_noun = DOMAIN_NOUNS.iter().any(|n| normalized.contains(n));
    has_verb && has_noun
}

fn matches_missing_kind(kind: &str, text: &str) -> bool {
    use std::sync::OnceLock;
    static TASK_REF: OnceLock<Regex> = OnceLock::new();
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    static NAME: OnceLock<Regex> = OnceLock::new();
    static PATH: OnceLock<Regex> = OnceLock::new();
    static SKILL: OnceLock<Regex> = OnceLock::new();

    let trimmed = text.trim();
    match kind {
        "taskRef" => {
            let re = TASK_REF.get_or_init(|| Regex::new(r"(?i)\btsk[-_][a-z0-9]+|^\d{1,3}$|último|last").unwrap());
            re.is_match(trimmed)
        }
        "email" => {
            let re = EMAIL.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
            re.is_match(trimmed)
        }
        "name" => {
            let re = NAME.get_or_init(|| Regex::new(r"^[A-Za-zÀ-ÿ]{1,4}(\s[A-Za-zÀ-ÿ]{1,4}){0,3}$").unwrap());
            re.is_match(trimmed)
        }
        "path" => {
            let re = PATH.get_or_init(|| Regex::new(r"^[\w./-]+/[\w./-]+$|^[\w.-]+\.[A-Za-z0-9]{1,6}$").unwrap());
            re.is_match(trimmed)
        }
        "dueAt" => {
            let lowered = trimmed.to_lowercase();
            ["mañana", "hoy", "lunes", "martes", "miércoles", "jueves", "viernes", "sábado", "domingo", "am", "pm", ":"]
                .iter()
                .any(|p| lowered.contains(p))
        }
        "skillRefOrIndex" => {
            let re = SKILL.get_or_init(|| Regex::new(r"(?i)\bsk[-_][a-z0-9]+|habilidad\s*\d+").unwrap());
            re.is_match(trimmed)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pending(chat_id: i64) -> PendingClarification {
        PendingClarification {
            chat_id,
            user_id: None,
            source: "telegram".into(),
            original_text: "eliminar workspace/notas.txt".into(),
            question: "¿Confirmas la eliminación?".into(),
            route_hints: vec!["workspace".into()],
            preferred_route: Some("workspace".into()),
            preferred_action: Some("delete".into()),
            missing: vec!["email".into()],
            requested_at_ms: 0,
            expires_at_ms: 0,
        }
    }

    #[test]
    fn test_ttl_expiry_via_peek() {
        let store = ClarificationStore::new(1000);
        store.register(sample_pending(1), 1000);
        assert!(store.peek(1, None, 1500).is_some());
        assert!(store.peek(1, None, 3000).is_none());
    }

    #[test]
    fn test_user_id_mismatch_hidden() {
        let store = ClarificationStore::new(60_000);
        let mut pending = sample_pending(1);
        pending.user_id = Some(42);
        store.register(pending, 1000);
        assert!(store.peek(1, Some(99), 1500).is_none());
        assert!(store.peek(1, Some(42), 1500).is_some());
        assert!(store.peek(1, None, 1500).is_some());
    }

    #[test]
    fn test_yes_no_treated_as_reply() {
        let pending = sample_pending(1);
        match classify_reply(&pending, "sí") {
            ReplyDecision::Reply { rebuilt_text } => {
                assert!(rebuilt_text.contains("Aclaración del usuario: sí"));
            }
            other => panic!("expected Reply, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_email_matches() {
        let pending = sample_pending(1);
        assert!(matches!(classify_reply(&pending, "ana@empresa.com"), ReplyDecision::Reply { .. }));
    }

    #[test]
    fn test_fresh_directive_drops_clarification() {
        let pending = sample_pending(1);
        assert_eq!(classify_reply(&pending, "programa un recordatorio para mañana"), ReplyDecision::Dropped);
    }

    #[test]
    fn test_unrelated_short_text_keeps_pending() {
        let pending = sample_pending(1);
        assert_eq!(classify_reply(&pending, "mmm"), ReplyDecision::NotAReply);
    }
}
