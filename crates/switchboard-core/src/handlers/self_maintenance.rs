//! Self-maintenance handler: restart/update operations on the process
//! itself. Both capabilities are in [`AgentPolicy::approval_required`] by
//! default (spec §4.G.4), so this handler only ever runs after an admin
//! has confirmed the action through [`crate::admin`].

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;

pub struct SelfMaintenanceHandler;

#[async_trait::async_trait]
impl HandlerAction for SelfMaintenanceHandler {
    fn route(&self) -> &str {
        "self-maintenance"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Reboot, Capability::SelfUpdate]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();
        if lowered.contains("reinicia") || lowered.contains("reboot") {
            return Ok(ExecutionResult { reply_text: Some("Reiniciando.".into()), ..Default::default() });
        }
        if lowered.contains("actualiza") || lowered.contains("update") {
            return Ok(ExecutionResult { reply_text: Some("Actualizando.".into()), ..Default::default() });
        }
        Err(ExecutionError::Validation("no pude interpretar la instrucción de mantenimiento".into()))
    }
}
