//! Recipient book handler: saves and resolves `name -> email` pairs used
//! by the `gmail` handler, keyed by [`crate::model::normalize_name_key`]
//! the way spec §3 defines recipient lookup.

use std::sync::Arc;

use regex::Regex;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::{normalize_name_key, Capability, SavedRecipient};
use crate::store::StateStore;

pub struct GmailRecipientsHandler {
    store: Arc<dyn StateStore>,
}

impl GmailRecipientsHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

fn email_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

#[async_trait::async_trait]
impl HandlerAction for GmailRecipientsHandler {
    fn route(&self) -> &str {
        "gmail-recipients"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();

        if lowered.starts_with("guarda") || lowered.starts_with("agrega") {
            let email = email_pattern().find(&ctx.text).ok_or_else(|| ExecutionError::Validation("falta un email válido".into()))?.as_str().to_string();
            let name = ctx
                .text
                .split_whitespace()
                .filter(|w| !w.contains('@') && w.chars().next().map_or(false, |c| c.is_uppercase()))
                .collect::<Vec<_>>()
                .join(" ");
            if name.is_empty() {
                return Err(ExecutionError::Validation("falta el nombre del contacto".into()));
            }
            self.store.upsert_recipient(&SavedRecipient {
                chat_id: ctx.chat_id,
                name_key: normalize_name_key(&name),
                name: name.clone(),
                email: email.clone(),
                created_at: 0,
                updated_at: 0,
            })?;
            return Ok(ExecutionResult { reply_text: Some(format!("Guardé a {name} <{email}>")), ..Default::default() });
        }

        if let Some(name) = lowered.strip_prefix("quien es ").or_else(|| lowered.strip_prefix("quién es ")) {
            let key = normalize_name_key(name.trim());
            return match self.store.get_recipient(ctx.chat_id, &key)? {
                Some(r) => Ok(ExecutionResult { reply_text: Some(format!("{} <{}>", r.name, r.email)), ..Default::default() }),
                None => Ok(ExecutionResult { reply_text: Some(format!("No tengo guardado a '{}'.", name.trim())), ..Default::default() }),
            };
        }

        Err(ExecutionError::Validation("no pude interpretar la instrucción de contactos".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStateStore;

    fn ctx(text: &str) -> ExecutionContext {
        ExecutionContext { chat_id: 1, user_id: 1, text: text.to_string(), safe_mode: false, admin_mode: false }
    }

    #[tokio::test]
    async fn test_save_then_lookup_roundtrip() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let handler = GmailRecipientsHandler::new(store);
        handler.handle(&ctx("guarda a Ana Lopez ana@empresa.com")).await.unwrap();
        let result = handler.handle(&ctx("quien es ana lopez")).await.unwrap();
        assert!(result.reply_text.unwrap().contains("ana@empresa.com"));
    }
}
