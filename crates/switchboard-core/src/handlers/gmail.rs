//! Gmail send handler. `GmailClient` decouples the handler from a concrete
//! transport the same way the teacher's `LlmProvider` trait decouples
//! `OpenAiProvider` from its callers — tests exercise a fake, production
//! wiring plugs in a real Gmail API client.

use std::sync::Arc;

use regex::Regex;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::{normalize_name_key, Capability};
use crate::store::StateStore;

#[async_trait::async_trait]
pub trait GmailClient: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

pub struct GmailHandler {
    client: Arc<dyn GmailClient>,
    store: Arc<dyn StateStore>,
}

impl GmailHandler {
    pub fn new(client: Arc<dyn GmailClient>, store: Arc<dyn StateStore>) -> Self {
        Self { client, store }
    }

    fn resolve_recipient(&self, chat_id: i64, text: &str) -> Result<String, ExecutionError> {
        if let Some(m) = email_pattern().find(text) {
            return Ok(m.as_str().to_string());
        }
        for word_count in (1..=3).rev() {
            for window in text.split_whitespace().collect::<Vec<_>>().windows(word_count) {
                let candidate = window.join(" ");
                let key = normalize_name_key(&candidate);
                if key.is_empty() {
                    continue;
                }
                if let Some(recipient) = self.store.get_recipient(chat_id, &key)? {
                    return Ok(recipient.email);
                }
            }
        }
        Err(ExecutionError::Validation("no pude identificar al destinatario".into()))
    }
}

/// Placeholder `GmailClient` for deployments that haven't wired a real
/// Gmail API client yet. Concrete Gmail calls are out of scope; this keeps
/// the `gmail` route wired and its failure mode explicit instead of
/// silently omitting the handler from the registry.
pub struct UnconfiguredGmailClient;

#[async_trait::async_trait]
impl GmailClient for UnconfiguredGmailClient {
    async fn send(&self, _to: &str, _subject: &str, _body: &str) -> anyhow::Result<()> {
        anyhow::bail!("no Gmail client configured")
    }
}

fn email_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap())
}

#[async_trait::async_trait]
impl HandlerAction for GmailHandler {
    fn route(&self) -> &str {
        "gmail"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::GmailSend]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let to = self.resolve_recipient(ctx.chat_id, &ctx.text)?;
        let subject = "Mensaje";
        let body = &ctx.text;

        self.client.send(&to, subject, body).await.map_err(ExecutionError::from_anyhow)?;

        Ok(ExecutionResult { reply_text: Some(format!("Correo enviado a {to}")), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SavedRecipient;
    use crate::store::SqliteStateStore;
    use std::sync::Mutex;

    struct RecordingClient {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait::async_trait]
    impl GmailClient for RecordingClient {
        async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((to.to_string(), subject.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn ctx(text: &str) -> ExecutionContext {
        ExecutionContext { chat_id: 1, user_id: 1, text: text.to_string(), safe_mode: false, admin_mode: false }
    }

    #[tokio::test]
    async fn test_sends_to_explicit_email() {
        let client = Arc::new(RecordingClient { sent: Mutex::new(vec![]) });
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let handler = GmailHandler::new(client.clone(), store);
        handler.handle(&ctx("enviar correo a ana@empresa.com diciendo hola")).await.unwrap();
        assert_eq!(client.sent.lock().unwrap()[0].0, "ana@empresa.com");
    }

    #[tokio::test]
    async fn test_resolves_saved_recipient_by_name() {
        let client = Arc::new(RecordingClient { sent: Mutex::new(vec![]) });
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        store
            .upsert_recipient(&SavedRecipient {
                chat_id: 1,
                name_key: normalize_name_key("Ana Lopez"),
                name: "Ana Lopez".into(),
                email: "ana@empresa.com".into(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let handler = GmailHandler::new(client.clone(), store);
        handler.handle(&ctx("enviar correo a Ana Lopez diciendo hola")).await.unwrap();
        assert_eq!(client.sent.lock().unwrap()[0].0, "ana@empresa.com");
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_validation_error() {
        let client = Arc::new(RecordingClient { sent: Mutex::new(vec![]) });
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let handler = GmailHandler::new(client, store);
        let result = handler.handle(&ctx("enviar correo a alguien desconocido")).await;
        assert!(matches!(result, Err(ExecutionError::Validation(_))));
    }
}
