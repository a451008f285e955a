//! HandlerAction registry (spec §6.2), generalizing the teacher's
//! `Tool`/`ToolRegistry` pattern from a single agent-facing function-call
//! surface into the fixed set of domain handlers the router dispatches to.

pub mod ai_shell;
pub mod connector;
pub mod document;
pub mod gmail;
pub mod gmail_recipients;
pub mod memory;
pub mod schedule;
pub mod self_maintenance;
pub mod smalltalk;
pub mod web;
pub mod workspace;

use std::collections::HashMap;

use tracing::{debug, error};

use crate::executor::HandlerAction;

/// Dynamic registry mapping route names to their [`HandlerAction`].
/// Registration replaces any existing handler under the same route, same
/// as the teacher's `ToolRegistry::register`.
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn HandlerAction>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register(&mut self, handler: Box<dyn HandlerAction>) {
        debug!(route = handler.route(), "registered handler");
        self.handlers.insert(handler.route().to_string(), handler);
    }

    pub fn get(&self, route: &str) -> Option<&dyn HandlerAction> {
        self.handlers.get(route).map(|h| h.as_ref())
    }

    pub fn has(&self, route: &str) -> bool {
        self.handlers.contains_key(route)
    }

    pub fn routes(&self) -> Vec<&str> {
        self.handlers.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn missing_field_error(field: &str) -> crate::error::ExecutionError {
    error!(field, "handler invoked without required field");
    crate::error::ExecutionError::Validation(format!("missing required field '{field}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::executor::{ExecutionContext, ExecutionResult};
    use crate::model::Capability;

    struct DummyHandler;

    #[async_trait::async_trait]
    impl HandlerAction for DummyHandler {
        fn route(&self) -> &str {
            "dummy"
        }
        fn capabilities(&self) -> &[Capability] {
            &[]
        }
        async fn handle(&self, _ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
            Ok(ExecutionResult { reply_text: Some("ok".into()), ..Default::default() })
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(DummyHandler));
        assert!(registry.has("dummy"));
        assert!(registry.get("missing").is_none());
    }
}
