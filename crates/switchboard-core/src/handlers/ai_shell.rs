//! AiShellHandler: asks the configured AI provider to plan a shell command
//! from free text (`AIChatProvider::planShellAction`) and reports the plan
//! back instead of running it. Actual process execution is out of scope
//! (spec's Non-goals list shell execution alongside the other concrete
//! domain actions) — this handler's `Capability::AiShell` routes every
//! request through `AdminSecurity`'s approval flow before it even gets
//! here, and the handler itself only ever simulates, the same way
//! `ConnectorHandler` acknowledges `/lim` without truly running anything.

use std::sync::Arc;

use tracing::warn;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;
use crate::provider::AiChatProvider;

pub struct AiShellHandler {
    provider: Arc<dyn AiChatProvider>,
}

impl AiShellHandler {
    pub fn new(provider: Arc<dyn AiChatProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl HandlerAction for AiShellHandler {
    fn route(&self) -> &str {
        "ai-shell"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::AiShell]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let plan = self.provider.plan_shell_action(&ctx.text).await.map_err(|e| {
            warn!(error = %e, "ai-shell plan request failed");
            ExecutionError::from_anyhow(e)
        })?;

        Ok(ExecutionResult {
            reply_text: Some(format!("Comando planificado (no ejecutado): `{}` — {}", plan.command_line, plan.reason)),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::{RouteSuggestion, ShellActionPlan};

    struct StubProvider;

    #[async_trait::async_trait]
    impl AiChatProvider for StubProvider {
        async fn ask(&self, _prompt: &str) -> anyhow::Result<String> {
            Ok("ok".into())
        }
        async fn plan_shell_action(&self, _text: &str) -> anyhow::Result<ShellActionPlan> {
            Ok(ShellActionPlan { command_line: "ls -la".into(), reason: "listar el directorio actual".into() })
        }
        async fn classify_sequence_steps(&self, _text: &str) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn suggest_route(&self, _text: &str, _candidates: &[String]) -> anyhow::Result<RouteSuggestion> {
            Ok(RouteSuggestion { handler: "ai-shell".into(), reason: "stub".into() })
        }
        fn default_model(&self) -> &str {
            "stub"
        }
    }

    #[tokio::test]
    async fn test_ai_shell_reports_plan_without_executing() {
        let handler = AiShellHandler::new(Arc::new(StubProvider));
        let ctx = ExecutionContext { chat_id: 1, user_id: 1, text: "ejecutar ls -la".into(), safe_mode: false, admin_mode: true };
        let result = handler.handle(&ctx).await.unwrap();
        let reply = result.reply_text.unwrap();
        assert!(reply.contains("ls -la"));
        assert!(reply.contains("no ejecutado"));
    }
}
