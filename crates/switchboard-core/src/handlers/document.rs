//! Document handler: stores and retrieves short text snippets the user
//! asks to keep, backed by the same workspace directory as
//! [`super::workspace`] but addressed by title rather than path.

use std::path::PathBuf;

use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, ExecutionResult, HandlerAction};
use crate::model::Capability;

pub struct DocumentHandler {
    documents_dir: PathBuf,
}

impl DocumentHandler {
    pub fn new(documents_dir: PathBuf) -> Self {
        Self { documents_dir }
    }

    fn slug(title: &str) -> String {
        title
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>()
    }
}

#[async_trait::async_trait]
impl HandlerAction for DocumentHandler {
    fn route(&self) -> &str {
        "document"
    }

    fn capabilities(&self) -> &[Capability] {
        &[]
    }

    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        let lowered = ctx.text.to_lowercase();

        if let Some(rest) = lowered.strip_prefix("guarda documento ") {
            let (title, body) = rest.split_once(':').ok_or_else(|| ExecutionError::Validation("formato esperado: 'guarda documento <titulo>: <texto>'".into()))?;
            tokio::fs::create_dir_all(&self.documents_dir).await.map_err(|e| ExecutionError::Transient(e.to_string()))?;
            let path = self.documents_dir.join(format!("{}.txt", Self::slug(title.trim())));
            tokio::fs::write(&path, body.trim()).await.map_err(|e| ExecutionError::Permanent(e.to_string()))?;
            return Ok(ExecutionResult { reply_text: Some(format!("Documento guardado: {}", title.trim())), ..Default::default() });
        }

        if let Some(title) = lowered.strip_prefix("muestra documento ") {
            let path = self.documents_dir.join(format!("{}.txt", Self::slug(title.trim())));
            let content = tokio::fs::read_to_string(&path).await.map_err(|_| ExecutionError::Permanent(format!("no encontré el documento '{}'", title.trim())))?;
            return Ok(ExecutionResult { reply_text: Some(content), ..Default::default() });
        }

        Err(ExecutionError::Validation("no pude interpretar la instrucción de documento".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_replaces_non_alphanumeric() {
        assert_eq!(DocumentHandler::slug("Notas de Viaje!"), "notas-de-viaje-");
    }
}
