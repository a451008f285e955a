//! AI provider trait and registry (spec §2 Non-goals list concrete Gmail/
//! web/filesystem/shell actions as out of scope, but the `AIChatProvider`
//! boundary itself — `ask`, `planShellAction`, `classifySequence` — is the
//! ambient interface the router's AI fallback and the sequencer depend on,
//! so it stays in scope).
//!
//! Generalizes the teacher's `LlmProvider`/`FallbackProvider` pair: same
//! quarantine-by-transient-error failover shape, widened from a single
//! `chat` method to the three narrower operations spec.md names.

pub mod openai;
pub mod types;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::router::AiRouteFallback;
use crate::sequencer::SequenceClassifier;
use types::{RouteSuggestion, ShellActionPlan};

/// Trait for AI chat backends. Any backend capable of chat completions
/// must implement all three operations — `switchboard` never needs raw
/// tool-calling loops the way the teacher's agent runtime did, since every
/// domain action routes through [`crate::handlers::HandlerAction`] instead.
#[async_trait]
pub trait AiChatProvider: Send + Sync {
    /// Free-form question/answer, used for `stoic-smalltalk` and anywhere
    /// else a plain reply (not a structured decision) is needed.
    async fn ask(&self, prompt: &str) -> anyhow::Result<String>;

    /// Strict JSON `{commandLine, reason}` plan for an `ai-shell` capable
    /// action. Callers are responsible for routing the result through
    /// `AdminSecurity`/`AgentPolicy` before anything executes it.
    async fn plan_shell_action(&self, text: &str) -> anyhow::Result<ShellActionPlan>;

    /// Strict JSON array of ordered sub-step strings (spec §2 row L).
    async fn classify_sequence_steps(&self, text: &str) -> anyhow::Result<Vec<String>>;

    /// Strict JSON `{handler, reason}` route suggestion restricted to
    /// `candidates` (spec §4.E.3).
    async fn suggest_route(&self, text: &str, candidates: &[String]) -> anyhow::Result<RouteSuggestion>;

    fn default_model(&self) -> &str;
}

/// A provider that wraps multiple other providers and implements failover
/// logic. If a provider returns a retryable error (like a 429), the
/// `FallbackProvider` automatically tries the next provider in its list.
pub struct FallbackProvider {
    providers: Vec<(String, Box<dyn AiChatProvider>)>,
    health: Mutex<HashMap<String, Instant>>,
}

const QUARANTINE_DURATION: Duration = Duration::from_secs(60);

impl FallbackProvider {
    pub fn new(providers: Vec<(String, Box<dyn AiChatProvider>)>) -> Self {
        Self { providers, health: Mutex::new(HashMap::new()) }
    }

    fn is_quarantined(&self, name: &str, now: Instant) -> bool {
        let health = self.health.lock().unwrap();
        health.get(name).map_or(false, |&last_err| now.duration_since(last_err) < QUARANTINE_DURATION)
    }

    fn quarantine(&self, name: &str) {
        self.health.lock().unwrap().insert(name.to_string(), Instant::now());
    }

    fn is_transient(err: &anyhow::Error) -> bool {
        let s = err.to_string();
        s.contains("429") || s.contains("quota") || s.contains("rate limit")
    }

    async fn try_each<'a, T>(
        &'a self,
        op: impl Fn(&'a dyn AiChatProvider) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<T>> + Send + 'a>>,
    ) -> anyhow::Result<T> {
        let mut last_error = None;
        let now = Instant::now();

        for (name, provider) in &self.providers {
            if self.is_quarantined(name, now) {
                debug!(provider = %name, "provider is in quarantine, skipping");
                continue;
            }

            match op(provider.as_ref()).await {
                Ok(res) => return Ok(res),
                Err(e) if Self::is_transient(&e) => {
                    warn!(provider = %name, error = %e, "provider failed with quota error, entering quarantine");
                    self.quarantine(name);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("all providers are exhausted or in quarantine")))
    }
}

#[async_trait]
impl AiChatProvider for FallbackProvider {
    async fn ask(&self, prompt: &str) -> anyhow::Result<String> {
        self.try_each(|p| Box::pin(p.ask(prompt))).await
    }

    async fn plan_shell_action(&self, text: &str) -> anyhow::Result<ShellActionPlan> {
        self.try_each(|p| Box::pin(p.plan_shell_action(text))).await
    }

    async fn classify_sequence_steps(&self, text: &str) -> anyhow::Result<Vec<String>> {
        self.try_each(|p| Box::pin(p.classify_sequence_steps(text))).await
    }

    async fn suggest_route(&self, text: &str, candidates: &[String]) -> anyhow::Result<RouteSuggestion> {
        self.try_each(|p| Box::pin(p.suggest_route(text, candidates))).await
    }

    fn default_model(&self) -> &str {
        self.providers.first().map(|(_, p)| p.default_model()).unwrap_or("")
    }
}

/// Adapts any `AiChatProvider` to the narrower traits `router/mod.rs` and
/// `sequencer/mod.rs` depend on, so neither module needs to know about
/// `ask`/`planShellAction`.
pub struct ProviderAdapter<P>(pub std::sync::Arc<P>);

#[async_trait]
impl<P: AiChatProvider> AiRouteFallback for ProviderAdapter<P> {
    async fn classify(&self, text: &str, candidates: &[String]) -> Option<String> {
        match self.0.suggest_route(text, candidates).await {
            Ok(suggestion) if candidates.iter().any(|c| c == &suggestion.handler) => Some(suggestion.handler),
            Ok(suggestion) => {
                warn!(handler = %suggestion.handler, "AI suggested a route outside the candidate set, ignoring");
                None
            }
            Err(e) => {
                warn!(error = %e, "AI route fallback failed");
                None
            }
        }
    }
}

#[async_trait]
impl<P: AiChatProvider> SequenceClassifier for ProviderAdapter<P> {
    async fn classify_sequence(&self, text: &str) -> anyhow::Result<Vec<String>> {
        self.0.classify_sequence_steps(text).await
    }
}

#[async_trait]
impl<P: AiChatProvider> crate::handlers::smalltalk::StoicChatProvider for ProviderAdapter<P> {
    async fn reply(&self, text: &str) -> anyhow::Result<String> {
        self.0.ask(text).await
    }
}
