//! Wire types shared by [`super::AiChatProvider`] implementations.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// `AIChatProvider::planShellAction`'s strict-JSON answer shape, gated
/// behind `Capability::AiShell` by the executor/admin layers before any
/// concrete handler would act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellActionPlan {
    pub command_line: String,
    pub reason: String,
}

/// `IntentRouter`'s AI fallback answer shape (spec §4.E.3): `{handler,
/// reason}`, picked from the router's remaining candidates only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSuggestion {
    pub handler: String,
    pub reason: String,
}
