//! PipelineBridge: wires every pipeline component into the single flow
//! spec §2 describes — Ingress → `IncomingQueue` → `ClarificationStore` →
//! `IntentRouter` → `Executor`/`HandlerRegistry` — with `Scheduler`/
//! `OutboxWorker`/`AdminSecurity` hooked in around it.
//!
//! Structurally this is the teacher's `AgentBridge`: a struct holding the
//! shared components behind `Arc`, a `run` loop draining an inbound
//! receiver, one `tokio::spawn`'d task per message so different chats never
//! block each other. The per-chat *ordering* guarantee the teacher's raw
//! spawn loop didn't have is supplied by routing each message through
//! [`crate::queue::IncomingQueue`] instead of spawning directly.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::admin::AdminSecurity;
use crate::bus::events::{InboundMessage, OutboundReply};
use crate::bus::MessageBus;
use crate::clarification::{classify_reply, ClarificationStore, ReplyDecision};
use crate::error::ExecutionError;
use crate::executor::{ExecutionContext, Executor, HandlerAction};
use crate::handlers::HandlerRegistry;
use crate::idempotency::IdempotencyLayer;
use crate::model::{ConversationTurn, PendingClarification, Role};
use crate::queue::IncomingQueue;
use crate::router::{AiRouteFallback, IntentRouter, RouteOutcome, RoutingContext};
use crate::session::SessionStore;
use crate::store::StateStore;

const CLARIFICATION_TTL_MS: i64 = 300_000;

pub struct PipelineBridge {
    store: Arc<dyn StateStore>,
    sessions: Arc<SessionStore>,
    clarifications: Arc<ClarificationStore>,
    idempotency: Arc<IdempotencyLayer>,
    router: Arc<IntentRouter>,
    handlers: Arc<HandlerRegistry>,
    executor: Arc<Executor>,
    admin: Arc<AdminSecurity>,
    ai_fallback: Option<Arc<dyn AiRouteFallback>>,
    bus: Arc<MessageBus>,
    allowed_user_ids: Vec<i64>,
}

impl PipelineBridge {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        sessions: Arc<SessionStore>,
        clarifications: Arc<ClarificationStore>,
        idempotency: Arc<IdempotencyLayer>,
        router: Arc<IntentRouter>,
        handlers: Arc<HandlerRegistry>,
        executor: Arc<Executor>,
        admin: Arc<AdminSecurity>,
        ai_fallback: Option<Arc<dyn AiRouteFallback>>,
        bus: Arc<MessageBus>,
        allowed_user_ids: Vec<i64>,
    ) -> Self {
        Self { store, sessions, clarifications, idempotency, router, handlers, executor, admin, ai_fallback, bus, allowed_user_ids }
    }

    fn is_allowed(&self, user_id: i64) -> bool {
        self.allowed_user_ids.is_empty() || self.allowed_user_ids.contains(&user_id)
    }

    /// Drains `queue`, dispatching each message to `Self::handle_one` on its
    /// own task. Per-chat ordering comes from `IncomingQueue` itself; this
    /// loop just feeds it.
    pub async fn run(self: Arc<Self>, queue: Arc<IncomingQueue<InboundMessage>>, mut inbound_rx: tokio::sync::mpsc::Receiver<InboundMessage>) {
        info!("pipeline bridge started, waiting for inbound messages");

        while let Some(msg) = inbound_rx.recv().await {
            let bridge = Arc::clone(&self);
            let chat_id = msg.chat_id;
            let source = msg.source.clone();
            if let Err(e) = queue
                .enqueue(chat_id, &source, msg, move |payload| {
                    let bridge = Arc::clone(&bridge);
                    async move { bridge.handle_one(payload).await }
                })
                .await
            {
                warn!(chat_id, error = %e, "dropping inbound message, queue rejected it");
            }
        }

        info!("pipeline bridge shutting down, inbound channel closed");
    }

    async fn handle_one(&self, msg: InboundMessage) {
        let now_ms = now_ms();
        let reply_text = self.process(&msg, now_ms).await;
        if let Some(text) = reply_text {
            self.bus.publish_outbound(OutboundReply { chat_id: msg.chat_id, text, source: msg.source.clone() }).await;
        }
    }

    /// Runs the same pipeline as [`Self::handle_one`] but hands the reply
    /// back to the caller instead of publishing it on the bus, for
    /// synchronous callers like the HTTP bridge (spec §6.1) that need the
    /// reply in the response body.
    pub async fn process_for_reply(&self, msg: &InboundMessage) -> Option<String> {
        self.process(msg, now_ms()).await
    }

    /// Runs one inbound message through idempotency, clarification,
    /// routing, and execution, returning the reply text (if any).
    async fn process(&self, msg: &InboundMessage, now_ms: i64) -> Option<String> {
        if !self.is_allowed(msg.user_id) {
            debug!(user_id = msg.user_id, "rejecting message from unauthorized user");
            return None;
        }

        if let Some(request_id) = &msg.request_id {
            match self.idempotency.read(msg.chat_id, request_id, now_ms) {
                Ok(Some(cached)) => {
                    return cached.get("reply").and_then(|v| v.as_str()).map(String::from);
                }
                Ok(None) => {}
                Err(e) => error!(error = %e, "idempotency read failed, proceeding without cache"),
            }
            if !self.idempotency.try_acquire(msg.chat_id, request_id).await {
                return None;
            }
        }

        let reply = self.route_and_execute(msg, now_ms).await;

        if let Some(request_id) = &msg.request_id {
            if let Some(text) = &reply {
                let payload = serde_json::json!({"reply": text});
                if let Err(e) = self.idempotency.save(msg.chat_id, request_id, payload, now_ms) {
                    error!(error = %e, "failed to persist idempotency record");
                }
            }
            self.idempotency.release(msg.chat_id, request_id).await;
        }

        reply
    }

    async fn route_and_execute(&self, msg: &InboundMessage, now_ms: i64) -> Option<String> {
        if let Err(e) = self.store.append_conversation_turn(&ConversationTurn {
            chat_id: msg.chat_id,
            role: Role::User,
            text: msg.text.clone(),
            source: msg.source.clone(),
            at_ms: now_ms,
            user_id: Some(msg.user_id),
        }) {
            error!(error = %e, "failed to persist inbound conversation turn");
        }

        if let Some(id) = parse_approve_command(&msg.text) {
            let reply = self.handle_approval_command(msg, id, now_ms).await;
            if let Err(e) = self.store.append_conversation_turn(&ConversationTurn {
                chat_id: msg.chat_id,
                role: Role::Assistant,
                text: reply.clone(),
                source: msg.source.clone(),
                at_ms: now_ms,
                user_id: None,
            }) {
                error!(error = %e, "failed to persist outbound conversation turn");
            }
            return Some(reply);
        }

        let effective_text = match self.clarifications.peek(msg.chat_id, Some(msg.user_id), now_ms) {
            Some(pending) => match classify_reply(&pending, &msg.text) {
                ReplyDecision::Reply { rebuilt_text } => {
                    self.clarifications.consume(msg.chat_id, Some(msg.user_id), now_ms);
                    rebuilt_text
                }
                ReplyDecision::Dropped => {
                    self.clarifications.clear(msg.chat_id);
                    msg.text.clone()
                }
                ReplyDecision::NotAReply => msg.text.clone(),
            },
            None => msg.text.clone(),
        };

        let (safe_mode, admin_mode, pending_workspace_delete) =
            self.sessions.with_session(msg.chat_id, |s| (s.safe_mode, s.admin_mode, s.pending_workspace_delete.is_some()));

        let indexed_list = self.store.get_indexed_list_context(msg.chat_id).unwrap_or_else(|e| {
            error!(error = %e, "failed to fetch indexed list context");
            None
        });
        let narrow_ctx = RoutingContext { pending_workspace_delete, indexed_list, ..Default::default() };

        let outcome = self.router.route(&effective_text, msg.chat_id, &narrow_ctx, self.ai_fallback.as_deref(), now_ms).await;

        let reply = match outcome {
            RouteOutcome::NeedsClarification { candidates } => {
                let question = if candidates.is_empty() {
                    "No entendí bien tu pedido. ¿Podés darme más detalle?".to_string()
                } else {
                    format!("No estoy seguro si te referís a: {}. ¿Cuál de estas opciones?", candidates.join(", "))
                };
                self.clarifications.register(
                    PendingClarification {
                        chat_id: msg.chat_id,
                        user_id: Some(msg.user_id),
                        source: msg.source.clone(),
                        original_text: effective_text.clone(),
                        question: question.clone(),
                        route_hints: candidates,
                        preferred_route: None,
                        preferred_action: None,
                        missing: vec![],
                        requested_at_ms: now_ms,
                        expires_at_ms: 0,
                    },
                    now_ms,
                );
                question
            }
            RouteOutcome::Matched { route, .. } => self.dispatch_to_handler(&route, msg, &effective_text, safe_mode, admin_mode).await,
        };

        if let Err(e) = self.store.append_conversation_turn(&ConversationTurn {
            chat_id: msg.chat_id,
            role: Role::Assistant,
            text: reply.clone(),
            source: msg.source.clone(),
            at_ms: now_ms,
            user_id: None,
        }) {
            error!(error = %e, "failed to persist outbound conversation turn");
        }

        Some(reply)
    }

    async fn dispatch_to_handler(&self, route: &str, msg: &InboundMessage, text: &str, safe_mode: bool, admin_mode: bool) -> String {
        let Some(handler) = self.handlers.get(route) else {
            error!(route, "router selected a route with no registered handler");
            return "No puedo procesar ese pedido en este momento.".to_string();
        };

        if self.is_panic_blocked(handler) {
            return "El bot está en modo pánico: acciones sensibles bloqueadas.".to_string();
        }

        let ctx = ExecutionContext { chat_id: msg.chat_id, user_id: msg.user_id, text: text.to_string(), safe_mode, admin_mode };
        self.run_handler(handler, route, ctx).await
    }

    /// Spec's panic mode (§4.K) blocks `Exec`/`AiShell` capability handlers
    /// regardless of admin mode, so both the normal routed path and the
    /// `/approve` replay path check it before running anything.
    fn is_panic_blocked(&self, handler: &dyn HandlerAction) -> bool {
        self.admin.panic_mode() && handler.capabilities().iter().any(|c| *c == crate::model::Capability::Exec || *c == crate::model::Capability::AiShell)
    }

    /// Consumes a pending approval by its 4-digit ID (spec §8 scenario 5)
    /// and, if still valid, replays the approved command through its
    /// original handler with `admin_mode` set so policy lets it through.
    async fn handle_approval_command(&self, msg: &InboundMessage, id: &str, now_ms: i64) -> String {
        let approval = match self.admin.consume(id, Some(msg.chat_id), now_ms) {
            Ok(Some(approval)) => approval,
            Ok(None) => return "Aprobación inexistente o vencida".to_string(),
            Err(e) => {
                error!(error = %e, "failed to consume approval");
                return "Aprobación inexistente o vencida".to_string();
            }
        };

        let Some(handler) = self.handlers.get(&approval.agent_name) else {
            error!(route = approval.agent_name, "approved action references an unregistered handler");
            return "No puedo procesar ese pedido en este momento.".to_string();
        };

        if self.is_panic_blocked(handler) {
            return "El bot está en modo pánico: acciones sensibles bloqueadas.".to_string();
        }

        let ctx = ExecutionContext {
            chat_id: approval.chat_id,
            user_id: approval.user_id,
            text: approval.command_line.clone(),
            safe_mode: false,
            admin_mode: true,
        };
        info!(id, route = approval.agent_name, "approval consumed, replaying command");
        self.run_handler(handler, &approval.agent_name, ctx).await
    }

    /// Shared tail of both the normal routed path and the post-`/approve`
    /// replay: runs the handler through the executor and turns its outcome
    /// into user-facing reply text.
    async fn run_handler(&self, handler: &dyn HandlerAction, route: &str, ctx: ExecutionContext) -> String {
        let chat_id = ctx.chat_id;
        match self.executor.execute(handler, ctx).await {
            Ok(result) => {
                if let Some(list_ctx) = result.indexed_list_update {
                    if let Err(e) = self.store.upsert_indexed_list_context(&list_ctx) {
                        error!(error = %e, "failed to persist indexed list context");
                    }
                }
                if let Some((text, source)) = result.outbox_enqueue {
                    let outbox_msg = crate::model::OutboxMessage {
                        id: 0,
                        chat_id,
                        text,
                        source,
                        created_at_ms: now_ms(),
                        attempts: 0,
                        last_error: None,
                        next_attempt_at_ms: now_ms(),
                    };
                    if let Err(e) = self.store.enqueue_outbox(&outbox_msg) {
                        error!(error = %e, "failed to enqueue outbox message");
                    }
                }
                result.reply_text.unwrap_or_default()
            }
            Err(ExecutionError::Policy(reason)) => {
                warn!(route, reason, "handler blocked by policy");
                format!("Esa acción está bloqueada por política ({reason}).")
            }
            Err(ExecutionError::ApprovalRequired { id }) => {
                info!(route, id, "handler requires approval");
                format!("Aprobación requerida: {id}")
            }
            Err(ExecutionError::CircuitOpen { retry_after_ms, .. }) => {
                format!("Ese servicio está temporalmente deshabilitado, probá de nuevo en {}s.", retry_after_ms / 1000)
            }
            Err(ExecutionError::Validation(msg)) => msg,
            Err(e) => {
                error!(route, error = %e, "handler failed");
                "Ocurrió un error procesando tu pedido.".to_string()
            }
        }
    }
}

/// Recognizes `/approve <id>`/`/aprobar <id>` (spec §8 scenario 5).
fn parse_approve_command(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix("/approve").or_else(|| trimmed.strip_prefix("/aprobar"))?;
    let id = rest.trim();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError as EE;
    use crate::executor::{ExecutionResult, HandlerAction};
    use crate::model::{AgentPolicy, Capability, SemanticRouteConfig};
    use crate::router::{IntentRouterConfig, RouterVersion};
    use crate::store::SqliteStateStore;
    use std::collections::HashMap;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl HandlerAction for EchoHandler {
        fn route(&self) -> &str {
            "web"
        }
        fn capabilities(&self) -> &[Capability] {
            &[]
        }
        async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EE> {
            Ok(ExecutionResult { reply_text: Some(format!("echo: {}", ctx.text)), ..Default::default() })
        }
    }

    struct ExecHandler;

    #[async_trait::async_trait]
    impl HandlerAction for ExecHandler {
        fn route(&self) -> &str {
            "self-maintenance"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Exec]
        }
        async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, EE> {
            Ok(ExecutionResult { reply_text: Some(format!("ejecutado: {}", ctx.text)), ..Default::default() })
        }
    }

    fn bridge() -> PipelineBridge {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(EchoHandler));
        registry.register(Box::new(ExecHandler));

        let web_route = SemanticRouteConfig { name: "web".into(), threshold: 0.01, utterances: vec!["buscar en internet algo".into()], negative_utterances: vec![] };
        let version = RouterVersion { id: "v1".into(), label: "stable".into(), routes: [("web".to_string(), web_route)].into_iter().collect(), hybrid_alpha: 0.5, min_score_gap: 0.0 };
        let router = IntentRouter::new(
            version,
            IntentRouterConfig {
                per_route_alpha: HashMap::new(),
                min_score_gap: 0.0,
                ab_split_percent: 0,
                ab_variant_b_alpha: None,
                ab_variant_b_min_gap: None,
                ab_variant_b_threshold_shift: 0.0,
                canary_split_percent: 0,
                shadow_sample_percent: 0,
            },
        );

        let (bus, _receivers) = MessageBus::new(16);
        let admin = Arc::new(AdminSecurity::new(Arc::new(SqliteStateStore::open_in_memory().unwrap())));

        PipelineBridge::new(
            store.clone(),
            Arc::new(SessionStore::new()),
            Arc::new(ClarificationStore::new(CLARIFICATION_TTL_MS)),
            Arc::new(IdempotencyLayer::new(store, 86_400_000)),
            Arc::new(router),
            Arc::new(registry),
            Arc::new(Executor::new(AgentPolicy::default(), 0, Arc::clone(&admin), 60_000)),
            admin,
            None,
            Arc::new(bus),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_matched_route_dispatches_to_handler() {
        let bridge = bridge();
        let msg = InboundMessage { chat_id: 1, user_id: 1, text: "buscar en internet algo".into(), source: "cli".into(), request_id: None, reply_reference: None };
        let reply = bridge.process(&msg, 1000).await.unwrap();
        assert!(reply.starts_with("echo:"));
    }

    #[tokio::test]
    async fn test_idempotent_request_id_returns_cached_reply() {
        let bridge = bridge();
        let msg = InboundMessage { chat_id: 1, user_id: 1, text: "buscar en internet algo".into(), source: "cli".into(), request_id: Some("req-abc123".into()), reply_reference: None };
        let first = bridge.process(&msg, 1000).await.unwrap();
        let second = bridge.process(&msg, 2000).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unauthorized_user_gets_no_reply() {
        let mut b = bridge();
        b.allowed_user_ids = vec![42];
        let msg = InboundMessage { chat_id: 1, user_id: 1, text: "hola".into(), source: "cli".into(), request_id: None, reply_reference: None };
        assert!(b.process(&msg, 1000).await.is_none());
    }

    #[tokio::test]
    async fn test_approval_flow_creates_id_then_approve_runs_and_second_approve_fails() {
        let bridge = bridge();
        let msg = InboundMessage { chat_id: 1, user_id: 1, text: "ejecutar ls -la".into(), source: "cli".into(), request_id: None, reply_reference: None };
        let reply = bridge.dispatch_to_handler("self-maintenance", &msg, &msg.text, false, false).await;
        assert!(reply.starts_with("Aprobación requerida: "));
        let id = reply.trim_start_matches("Aprobación requerida: ").to_string();
        assert_eq!(id.len(), 4);

        let approve_msg = InboundMessage { chat_id: 1, user_id: 1, text: format!("/approve {id}"), source: "cli".into(), request_id: None, reply_reference: None };
        let approved_reply = bridge.process(&approve_msg, 2000).await.unwrap();
        assert!(approved_reply.starts_with("ejecutado:"));

        let second_reply = bridge.process(&approve_msg, 3000).await.unwrap();
        assert_eq!(second_reply, "Aprobación inexistente o vencida");
    }
}
