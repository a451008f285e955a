//! Stoic-smalltalk handler: the conversational fallback for chit-chat that
//! doesn't need any capability, expected to actually call the configured
//! AI provider for a reply rather than canned text. `StoicChatProvider`
//! mirrors the teacher's `LlmProvider` trait boundary.

use std::sync::Arc;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;

#[async_trait::async_trait]
pub trait StoicChatProvider: Send + Sync {
    async fn reply(&self, text: &str) -> anyhow::Result<String>;
}

pub struct SmalltalkHandler {
    provider: Arc<dyn StoicChatProvider>,
}

impl SmalltalkHandler {
    pub fn new(provider: Arc<dyn StoicChatProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl HandlerAction for SmalltalkHandler {
    fn route(&self) -> &str {
        "stoic-smalltalk"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let reply = self.provider.reply(&ctx.text).await.map_err(ExecutionError::from_anyhow)?;
        Ok(ExecutionResult { reply_text: Some(reply), ..Default::default() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned;
    #[async_trait::async_trait]
    impl StoicChatProvider for Canned {
        async fn reply(&self, _text: &str) -> anyhow::Result<String> {
            Ok("la calma es una elección".into())
        }
    }

    #[tokio::test]
    async fn test_delegates_to_provider() {
        let handler = SmalltalkHandler::new(Arc::new(Canned));
        let ctx = ExecutionContext { chat_id: 1, user_id: 1, text: "hola".into(), safe_mode: false, admin_mode: false };
        let result = handler.handle(&ctx).await.unwrap();
        assert_eq!(result.reply_text.as_deref(), Some("la calma es una elección"));
    }
}
