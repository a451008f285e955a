//! Schedule handler: create/list/cancel [`ScheduledTask`] rows, adapted
//! from the teacher's `ScheduleTaskTool`/`ListSchedulesTool`/
//! `CancelScheduleTool` trio — one handler here instead of three tools,
//! since the router already disambiguates intent before dispatch.

use std::sync::Arc;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::{Capability, DeliveryKind, ScheduledTask, TaskStatus};
use crate::store::StateStore;

pub struct ScheduleHandler {
    store: Arc<dyn StateStore>,
}

impl ScheduleHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

/// `"tsk-" + base36(random u64)`, the non-UUID ID shape spec.md calls for,
/// generalized from the reference workspace's `uuid_simple()` timestamp
/// helper into a pure base36 encoding (no clock dependency reaches this
/// handler — `ExecutionContext` carries no `now_ms`).
fn new_task_id() -> String {
    use rand::Rng;
    let value: u64 = rand::thread_rng().gen();
    format!("tsk-{}", to_base36(value))
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

#[async_trait::async_trait]
impl HandlerAction for ScheduleHandler {
    fn route(&self) -> &str {
        "schedule"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();

        if lowered.starts_with("lista tareas") || lowered.starts_with("mis tareas") {
            let tasks = self.store.list_pending_tasks_for_chat(ctx.chat_id)?;
            if tasks.is_empty() {
                return Ok(ExecutionResult { reply_text: Some("No tenés tareas programadas.".into()), ..Default::default() });
            }
            let reply = tasks.iter().map(|t| format!("{} — {}", t.id, t.title)).collect::<Vec<_>>().join("\n");
            return Ok(ExecutionResult { reply_text: Some(reply), ..Default::default() });
        }

        if let Some(reference) = lowered.strip_prefix("cancela ").or_else(|| lowered.strip_prefix("cancelar ")) {
            let id = resolve_task_reference(&self.store, ctx.chat_id, reference.trim())?;
            let canceled = self.store.cancel_task(&id, 0)?;
            let reply = if canceled { format!("Cancelé la tarea {id}.") } else { format!("La tarea {id} ya no estaba pendiente.") };
            return Ok(ExecutionResult { reply_text: Some(reply), ..Default::default() });
        }

        let task = ScheduledTask {
            id: new_task_id(),
            chat_id: ctx.chat_id,
            user_id: Some(ctx.user_id),
            title: ctx.text.clone(),
            due_at: 0,
            created_at: 0,
            updated_at: 0,
            status: TaskStatus::Pending,
            completed_at: None,
            canceled_at: None,
            failure_count: 0,
            last_error: None,
            retry_after: None,
            delivery_kind: DeliveryKind::Reminder,
            delivery_payload: None,
        };
        self.store.create_task(&task)?;

        Ok(ExecutionResult { reply_text: Some(format!("Programé la tarea {}.", task.id)), scheduled_task: Some(task), ..Default::default() })
    }
}

/// Resolves `tsk-xxxx` exact IDs, unambiguous prefixes, ordinals (`1`, `2`,
/// …), or `"último"`/`"last"` against the chat's pending tasks (spec §4.H
/// task-reference resolution).
fn resolve_task_reference(store: &Arc<dyn StateStore>, chat_id: i64, reference: &str) -> Result<String, ExecutionError> {
    if reference.starts_with("tsk-") || reference.starts_with("tsk_") {
        if store.get_task(reference)?.is_some() {
            return Ok(reference.to_string());
        }
    }

    let pending = store.list_pending_tasks_for_chat(chat_id)?;
    if pending.is_empty() {
        return Err(ExecutionError::Validation("no tenés tareas pendientes".into()));
    }

    if reference == "último" || reference == "ultimo" || reference == "last" {
        return Ok(pending.last().unwrap().id.clone());
    }

    if let Ok(ordinal) = reference.parse::<usize>() {
        if ordinal >= 1 && ordinal <= pending.len() {
            return Ok(pending[ordinal - 1].id.clone());
        }
        return Err(ExecutionError::Validation("índice de tarea fuera de rango".into()));
    }

    let matches: Vec<&ScheduledTask> = pending.iter().filter(|t| t.id.starts_with(reference)).collect();
    match matches.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(ExecutionError::Validation(format!("no encontré la tarea '{reference}'"))),
        _ => Err(ExecutionError::Validation(format!("'{reference}' es ambiguo entre varias tareas"))),
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
    async fn test_create_then_cancel_by_ordinal() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let handler = ScheduleHandler::new(store.clone());
        handler.handle(&ctx("recuérdame tomar agua")).await.unwrap();
        let result = handler.handle(&ctx("cancela 1")).await.unwrap();
        assert!(result.reply_text.unwrap().starts_with("Cancelé"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_reference_errors() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let handler = ScheduleHandler::new(store);
        let result = handler.handle(&ctx("cancela tsk-doesnotexist")).await;
        assert!(result.is_err());
    }
}
