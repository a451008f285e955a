//! Memory handler: recalls recent conversation turns matching a cue,
//! backed directly by [`StateStore::list_recent_conversation_turns`].

use std::sync::Arc;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;
use crate::store::StateStore;

const RECALL_WINDOW: usize = 200;

pub struct MemoryHandler {
    store: Arc<dyn StateStore>,
}

impl MemoryHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl HandlerAction for MemoryHandler {
    fn route(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();
        let cue = lowered
            .strip_prefix("recuerdas ")
            .or_else(|| lowered.strip_prefix("te acordás de "))
            .or_else(|| lowered.strip_prefix("recuerda "))
            .unwrap_or(lowered.as_str())
            .trim();

        if cue.is_empty() {
            return Err(ExecutionError::Validation("decime qué querés que recuerde".into()));
        }

        let turns = self.store.list_recent_conversation_turns(ctx.chat_id, RECALL_WINDOW)?;
        let cue_tokens: Vec<&str> = cue.split_whitespace().collect();
        let hit = turns.iter().rev().find(|t| cue_tokens.iter().any(|tok| t.text.to_lowercase().contains(tok)));

        match hit {
            Some(turn) => Ok(ExecutionResult { reply_text: Some(format!("Recuerdo esto: \"{}\"", turn.text)), ..Default::default() }),
            None => Ok(ExecutionResult { reply_text: Some("No encontré nada relacionado en lo que hablamos antes.".into()), ..Default::default() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConversationTurn, Role};
    use crate::store::SqliteStateStore;

    fn ctx(text: &str) -> ExecutionContext {
        ExecutionContext { chat_id: 1, user_id: 1, text: text.to_string(), safe_mode: false, admin_mode: false }
    }

    #[tokio::test]
    async fn test_recalls_matching_turn() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        store
            .append_conversation_turn(&ConversationTurn {
                chat_id: 1,
                role: Role::User,
                text: "mi perro se llama Rocco".into(),
                source: "telegram".into(),
                at_ms: 1,
                user_id: Some(1),
            })
            .unwrap();
        let handler = MemoryHandler::new(store);
        let result = handler.handle(&ctx("recuerdas cómo se llama mi perro")).await.unwrap();
        assert!(result.reply_text.unwrap().contains("Rocco"));
    }
}
