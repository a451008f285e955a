//! Workspace handler: list/read/write/delete files under a sandboxed
//! workspace directory. Delete requires [`Capability::WorkspaceDelete`],
//! which the executor only grants once a prior
//! [`crate::model::PendingWorkspaceDelete`] has been confirmed by the
//! dispatcher (spec §4.G.4's preview-then-confirm flow) — this handler
//! itself never asks for confirmation, it trusts the caller already got it.

use std::path::{Path, PathBuf};

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;

pub struct WorkspaceHandler {
    root: PathBuf,
}

impl WorkspaceHandler {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolves a user-supplied relative path against the workspace root,
    /// rejecting anything that would escape it.
    fn resolve(&self, relative: &str) -> Result<PathBuf, ExecutionError> {
        let candidate = self.root.join(relative.trim_start_matches('/'));
        let normalized = normalize(&candidate);
        if !normalized.starts_with(&self.root) {
            return Err(ExecutionError::Validation("path escapes workspace root".into()));
        }
        Ok(normalized)
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait::async_trait]
impl HandlerAction for WorkspaceHandler {
    fn route(&self) -> &str {
        "workspace"
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::WorkspaceDelete]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();

        if lowered.starts_with("listar") || lowered.starts_with("lista") {
            let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| ExecutionError::Transient(e.to_string()))?;
            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await.map_err(|e| ExecutionError::Transient(e.to_string()))? {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
            names.sort();
            let reply = if names.is_empty() { "El workspace está vacío.".to_string() } else { names.join("\n") };
            return Ok(ExecutionResult { reply_text: Some(reply), ..Default::default() });
        }

        if let Some(target) = lowered.strip_prefix("eliminar ").or_else(|| lowered.strip_prefix("borrar ")) {
            let path = self.resolve(target.trim())?;
            tokio::fs::remove_file(&path).await.map_err(|e| ExecutionError::Permanent(e.to_string()))?;
            return Ok(ExecutionResult { reply_text: Some(format!("Eliminado: {target}")), ..Default::default() });
        }

        if let Some(target) = lowered.strip_prefix("leer ") {
            let path = self.resolve(target.trim())?;
            let content = tokio::fs::read_to_string(&path).await.map_err(|e| ExecutionError::Permanent(e.to_string()))?;
            return Ok(ExecutionResult { reply_text: Some(content), ..Default::default() });
        }

        Err(ExecutionError::Validation("no pude interpretar la instrucción de workspace".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rejects_path_escape() {
        let handler = WorkspaceHandler::new(PathBuf::from("/tmp/ws"));
        assert!(handler.resolve("../../etc/passwd").is_err());
    }

    #[test]
    fn test_resolve_allows_nested_path() {
        let handler = WorkspaceHandler::new(PathBuf::from("/tmp/ws"));
        let resolved = handler.resolve("notes/todo.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/tmp/ws/notes/todo.txt"));
    }
}
