//! switchboard CLI — interactive chat, background bot mode, and
//! operational status commands.
//!
//! Usage:
//!   switchboard chat             — interactive chat session against the pipeline
//!   switchboard bot              — run transports, scheduler, outbox, HTTP bridge
//!   switchboard status           — show configuration and health
//!   switchboard schedule list    — list pending scheduled tasks
//!   switchboard schedule cancel  — cancel a scheduled task
//!   switchboard router           — print the active router version's routes

use std::future::IntoFuture;
use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use switchboard_core::admin::AdminSecurity;
use switchboard_core::bus::events::InboundMessage;
use switchboard_core::bus::MessageBus;
use switchboard_core::clarification::ClarificationStore;
use switchboard_core::config::Config;
use switchboard_core::error::ExecutionError;
use switchboard_core::executor::Executor;
use switchboard_core::gateway::bridge::PipelineBridge;
use switchboard_core::gateway::http::{self, HttpBridgeState};
use switchboard_core::handlers::ai_shell::AiShellHandler;
use switchboard_core::handlers::connector::ConnectorHandler;
use switchboard_core::handlers::document::DocumentHandler;
use switchboard_core::handlers::gmail::{GmailHandler, UnconfiguredGmailClient};
use switchboard_core::handlers::gmail_recipients::GmailRecipientsHandler;
use switchboard_core::handlers::memory::MemoryHandler;
use switchboard_core::handlers::schedule::ScheduleHandler;
use switchboard_core::handlers::self_maintenance::SelfMaintenanceHandler;
use switchboard_core::handlers::smalltalk::{SmalltalkHandler, StoicChatProvider};
use switchboard_core::handlers::web::WebHandler;
use switchboard_core::handlers::workspace::WorkspaceHandler;
use switchboard_core::handlers::HandlerRegistry;
use switchboard_core::idempotency::IdempotencyLayer;
use switchboard_core::model::{AgentPolicy, DeliveryKind, OutboxMessage, ScheduledTask};
use switchboard_core::observability::{AuditEvent, AuditLog, MetricsRegistry};
use switchboard_core::outbox::{EgressTransport, OutboxWorker};
use switchboard_core::provider::openai::OpenAiProvider;
use switchboard_core::provider::{AiChatProvider, FallbackProvider, ProviderAdapter};
use switchboard_core::queue::IncomingQueue;
use switchboard_core::router::dataset::CanaryGuard;
use switchboard_core::router::maintenance::{load_canary_version, RouterMaintenance};
use switchboard_core::router::{self, AiRouteFallback, IntentRouter, IntentRouterConfig};
use switchboard_core::session::SessionStore;
use switchboard_core::store::{SqliteStateStore, StateStore};

#[cfg(feature = "telegram")]
use switchboard_core::gateway::channels::telegram::{TelegramEgress, TelegramTransport};

/// No provider entry carries a model name (spec §6.5's `ProviderEntry` only
/// holds credentials), so every backend shares this single default.
const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Parser)]
#[command(
    name = "switchboard",
    version,
    about = "Multi-user conversational agent orchestration pipeline",
    long_about = "switchboard — routes chat messages from Telegram and the HTTP bridge through a shared intent router, executor, and handler registry."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat session against the pipeline
    Chat,
    /// Run transports, scheduler, outbox worker, and the HTTP bridge
    Bot,
    /// Show configuration and health
    Status,
    /// Manage scheduled tasks
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
    /// Print the active router version's routes and thresholds
    Router,
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List pending scheduled tasks for the CLI's direct chat
    List,
    /// Cancel a scheduled task by ID
    Cancel {
        /// Task ID (e.g. `tsk-abc123`)
        id: String,
    },
}

const CLI_CHAT_ID: i64 = 0;
const CLI_USER_ID: i64 = 0;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Chat) | None => cmd_chat().await?,
        Some(Commands::Bot) => cmd_bot().await?,
        Some(Commands::Status) => cmd_status().await?,
        Some(Commands::Schedule { action }) => cmd_schedule(action).await?,
        Some(Commands::Router) => cmd_router()?,
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        eprintln!("\n  Configuration errors:");
        for e in &errors {
            eprintln!("     - {e}");
        }
        eprintln!();
        anyhow::bail!("fix the above {} error(s) in config.json", errors.len());
    }
    Ok(())
}

/// Loads the config, writing a default template on first run, then
/// validates it before handing it back.
fn load_config() -> Result<Config> {
    let path = Config::default_path();
    if !path.exists() {
        Config::write_default_template(&path).context("failed to write default config template")?;
        println!("  Wrote a default configuration to {}", path.display());
        println!("  Edit it to set gateway.bridge_token and at least one provider's api_key.\n");
    }
    let config = Config::load_from(&path).unwrap_or_default();
    validate_config(&config)?;
    Ok(config)
}

fn build_ai_adapter(config: &Config) -> Option<Arc<ProviderAdapter<FallbackProvider>>> {
    let active = config.providers.find_all_active();
    if active.is_empty() {
        return None;
    }
    let client = reqwest::Client::new();
    let providers: Vec<(String, Box<dyn AiChatProvider>)> = active
        .into_iter()
        .map(|(name, entry)| {
            let provider = OpenAiProvider::new(name, &entry.api_key, entry.api_base.as_deref(), DEFAULT_MODEL, client.clone());
            (name.to_string(), Box::new(provider) as Box<dyn AiChatProvider>)
        })
        .collect();
    Some(Arc::new(ProviderAdapter(Arc::new(FallbackProvider::new(providers)))))
}

fn build_handlers(
    config: &Config,
    store: Arc<dyn StateStore>,
    smalltalk_provider: Arc<dyn StoicChatProvider>,
    ai_provider: Option<Arc<dyn AiChatProvider>>,
) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let workspace = config.workspace_path();

    registry.register(Box::new(GmailHandler::new(Arc::new(UnconfiguredGmailClient), Arc::clone(&store))));
    registry.register(Box::new(GmailRecipientsHandler::new(Arc::clone(&store))));
    registry.register(Box::new(WorkspaceHandler::new(workspace.clone())));
    registry.register(Box::new(DocumentHandler::new(workspace.join("documents"))));
    registry.register(Box::new(ScheduleHandler::new(Arc::clone(&store))));
    registry.register(Box::new(MemoryHandler::new(Arc::clone(&store))));

    let brave_key = std::env::var("BRAVE_SEARCH_API_KEY").unwrap_or_default();
    registry.register(Box::new(WebHandler::new(brave_key, 5)));

    registry.register(Box::new(ConnectorHandler));
    registry.register(Box::new(SelfMaintenanceHandler));
    registry.register(Box::new(SmalltalkHandler::new(smalltalk_provider)));

    if let Some(provider) = ai_provider {
        registry.register(Box::new(AiShellHandler::new(provider)));
    }

    registry
}

fn build_router(config: &Config) -> IntentRouter {
    let router_config = IntentRouterConfig {
        per_route_alpha: config.router.per_route_alpha.clone(),
        min_score_gap: if config.router.min_score_gap > 0.0 { config.router.min_score_gap } else { 0.05 },
        ab_split_percent: config.router.ab.split_percent,
        ab_variant_b_alpha: if config.router.ab.split_percent > 0 { Some(config.router.ab.variant_b_alpha) } else { None },
        ab_variant_b_min_gap: if config.router.ab.split_percent > 0 { Some(config.router.ab.variant_b_min_gap) } else { None },
        ab_variant_b_threshold_shift: config.router.ab.variant_b_threshold_shift,
        canary_split_percent: config.router.canary.split_percent,
        shadow_sample_percent: config.router.shadow.sample_percent,
    };
    IntentRouter::new(router::default_version(), router_config)
}

struct Pipeline {
    config: Config,
    store: Arc<dyn StateStore>,
    bridge: Arc<PipelineBridge>,
    bus: Arc<MessageBus>,
    metrics: Arc<MetricsRegistry>,
    router: Arc<IntentRouter>,
}

fn build_pipeline(config: Config) -> Result<Pipeline> {
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&config.state_db_path_resolved()).context("failed to open state database")?);

    let sessions = Arc::new(SessionStore::new());
    let clarifications = Arc::new(ClarificationStore::new(config.clarification_ttl_secs * 1000));
    let idempotency = Arc::new(IdempotencyLayer::new(Arc::clone(&store), config.idempotency_ttl_secs * 1000));
    let admin = Arc::new(AdminSecurity::new(Arc::clone(&store)));
    let executor = Arc::new(Executor::new(AgentPolicy::default(), config.executor.retry_attempts, Arc::clone(&admin), config.approval_ttl_secs * 1000));

    let ai_adapter = build_ai_adapter(&config);
    let smalltalk_provider: Arc<dyn StoicChatProvider> = match &ai_adapter {
        Some(adapter) => adapter.clone(),
        None => Arc::new(NoProviderConfigured),
    };
    let ai_fallback: Option<Arc<dyn AiRouteFallback>> = ai_adapter.as_ref().map(|a| a.clone() as Arc<dyn AiRouteFallback>);
    let ai_shell_provider: Option<Arc<dyn AiChatProvider>> = ai_adapter.as_ref().map(|a| a.0.clone() as Arc<dyn AiChatProvider>);

    let handlers = Arc::new(build_handlers(&config, Arc::clone(&store), smalltalk_provider, ai_shell_provider));
    let router = Arc::new(build_router(&config));
    if config.router.canary.enabled {
        if let Some(version_id) = config.router.canary.version_id.as_deref() {
            if let Some(version) = load_canary_version(store.as_ref(), version_id) {
                router.set_canary(Some(version));
            }
        }
    }

    let (bus, _receivers) = MessageBus::new(256);
    let bus = Arc::new(bus);

    let bridge = Arc::new(PipelineBridge::new(
        Arc::clone(&store),
        sessions,
        clarifications,
        idempotency,
        Arc::clone(&router),
        handlers,
        executor,
        admin,
        ai_fallback,
        Arc::clone(&bus),
        config.allowed_user_ids.clone(),
    ));

    let metrics = Arc::new(MetricsRegistry::new());

    Ok(Pipeline { config, store, bridge, bus, metrics, router })
}

/// `StoicChatProvider` stub for deployments with no AI provider configured,
/// so `stoic-smalltalk` stays wired instead of being left out of the
/// registry entirely.
struct NoProviderConfigured;

#[async_trait::async_trait]
impl StoicChatProvider for NoProviderConfigured {
    async fn reply(&self, _text: &str) -> anyhow::Result<String> {
        anyhow::bail!("no AI provider configured")
    }
}

/// Delivers due scheduled tasks by re-running them through the pipeline
/// (`GmailSend`/`NaturalIntent`) or sending their title directly (`Reminder`).
struct BridgeTaskDelivery {
    store: Arc<dyn StateStore>,
    bridge: Arc<PipelineBridge>,
}

#[async_trait::async_trait]
impl switchboard_core::scheduler::TaskDelivery for BridgeTaskDelivery {
    async fn deliver(&self, task: &ScheduledTask, _depth: u32) -> Result<(), ExecutionError> {
        let text = match task.delivery_kind {
            DeliveryKind::Reminder => task.title.clone(),
            DeliveryKind::GmailSend | DeliveryKind::NaturalIntent => {
                let msg = InboundMessage {
                    chat_id: task.chat_id,
                    user_id: task.user_id.unwrap_or(0),
                    text: task.title.clone(),
                    source: "scheduler".into(),
                    request_id: None,
                    reply_reference: None,
                };
                match self.bridge.process_for_reply(&msg).await {
                    Some(reply) => reply,
                    None => return Ok(()),
                }
            }
        };

        let outbox_msg = OutboxMessage {
            id: 0,
            chat_id: task.chat_id,
            text,
            source: "scheduler".into(),
            created_at_ms: now_ms(),
            attempts: 0,
            last_error: None,
            next_attempt_at_ms: now_ms(),
        };
        self.store.enqueue_outbox(&outbox_msg)?;
        Ok(())
    }
}

/// Delivery sink for deployments without Telegram configured: prints to
/// stdout instead of dropping outbox messages silently.
struct ConsoleEgress;

#[async_trait::async_trait]
impl EgressTransport for ConsoleEgress {
    async fn send(&self, chat_id: i64, text: &str, source: &str) -> anyhow::Result<()> {
        println!("  [{source} -> chat {chat_id}] {text}");
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

async fn cmd_chat() -> Result<()> {
    let config = load_config()?;
    let pipeline = build_pipeline(config)?;

    println!();
    println!("  switchboard v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Providers: {}",
        pipeline.config.providers.find_all_active().into_iter().map(|(n, _)| n).collect::<Vec<_>>().join(", ")
    );
    println!("  Workspace: {}", pipeline.config.workspace_path().display());
    println!();
    println!("  Type your message, or /quit to exit.");
    println!("  ---------------------------------------");
    println!();

    let stdin = io::stdin();
    loop {
        print!("  > ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        if matches!(input, "/quit" | "/exit" | "/q") {
            println!("  Goodbye.");
            break;
        }

        let msg = InboundMessage { chat_id: CLI_CHAT_ID, user_id: CLI_USER_ID, text: input.to_string(), source: "cli".into(), request_id: None, reply_reference: None };

        match pipeline.bridge.process_for_reply(&msg).await {
            Some(reply) => println!("\n  {reply}\n"),
            None => println!("\n  (no reply)\n"),
        }
    }

    Ok(())
}

async fn cmd_bot() -> Result<()> {
    let config = load_config()?;
    let bridge_token_set = !config.gateway.bridge_token.is_empty();
    let audit_path = config.audit_log_path_resolved();
    let gateway_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let gateway_path = config.gateway.bridge_path.clone();
    let bridge_token = config.gateway.bridge_token.clone();
    let security_profile = config.security.profile;
    let poll_secs = config.scheduler.poll_secs;
    let queue_cfg = config.queue.clone();
    let telegram_config = config.channels.telegram.clone();
    let hard_negative_cfg = config.router.hard_negative.clone();
    let canary_cfg = config.router.canary.clone();

    let pipeline = build_pipeline(config)?;
    let cancel = CancellationToken::new();
    let audit = Arc::new(AuditLog::open(&audit_path).await.context("failed to open audit log")?);
    let mut tasks = Vec::new();

    let (bus, receivers) = MessageBus::new(256);
    let bus = Arc::new(bus);
    // The pipeline built its own internal bus for process_for_reply; the
    // bot's live transports and outbound dispatch use this second bus
    // whose inbound receiver feeds PipelineBridge::run directly.
    let _ = &pipeline.bus;

    #[cfg(feature = "telegram")]
    {
        if let Some(tel) = telegram_config.as_ref() {
            if tel.enabled && !tel.token.is_empty() {
                let transport = TelegramTransport::new(tel.token.clone(), Arc::clone(&bus), tel.allow_from.clone());
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = transport.run().await {
                        tracing::error!(error = %e, "telegram transport stopped");
                    }
                }));
                tracing::info!("telegram transport enabled");
            }
        }
    }

    let subs = bus.subscribers();
    tasks.push(tokio::spawn(switchboard_core::bus::dispatch_outbound(subs, receivers.outbound_rx)));

    let queue_cancel = cancel.clone();
    let queue = IncomingQueue::<InboundMessage>::new(
        queue_cfg.max_per_chat,
        queue_cfg.max_total,
        std::time::Duration::from_secs(queue_cfg.drain_timeout_secs),
        queue_cancel,
    );
    let bridge_for_run = Arc::clone(&pipeline.bridge);
    tasks.push(tokio::spawn(async move {
        bridge_for_run.run(queue, receivers.inbound_rx).await;
    }));

    let egress: Arc<dyn EgressTransport> = {
        #[cfg(feature = "telegram")]
        {
            if let Some(tel) = telegram_config.as_ref().filter(|t| t.enabled && !t.token.is_empty()) {
                Arc::new(TelegramEgress::new(tel.token.clone()))
            } else {
                Arc::new(ConsoleEgress)
            }
        }
        #[cfg(not(feature = "telegram"))]
        {
            Arc::new(ConsoleEgress)
        }
    };
    let outbox = Arc::new(OutboxWorker::new(Arc::clone(&pipeline.store), egress, std::time::Duration::from_secs(10), 5, cancel.clone()));
    tasks.push(outbox.spawn());

    let delivery = Arc::new(BridgeTaskDelivery { store: Arc::clone(&pipeline.store), bridge: Arc::clone(&pipeline.bridge) });
    let scheduler = Arc::new(switchboard_core::scheduler::Scheduler::new(
        Arc::clone(&pipeline.store),
        delivery,
        std::time::Duration::from_secs(poll_secs),
        cancel.clone(),
    ));
    tasks.push(scheduler.spawn());

    // `min_accuracy` doubles as the guard's baseline: halt as soon as live
    // accuracy falls to or below it (zero additional regression margin).
    let canary_guard = if canary_cfg.enabled && canary_cfg.version_id.is_some() {
        Some(CanaryGuard::new(canary_cfg.min_accuracy, 1, 0.0))
    } else {
        None
    };
    let maintenance = Arc::new(RouterMaintenance::new(
        Arc::clone(&pipeline.router),
        3,
        hard_negative_cfg.max_per_route,
        canary_guard,
        canary_cfg.breaches_to_disable,
        std::time::Duration::from_secs(hard_negative_cfg.interval_secs),
        cancel.clone(),
    ));
    tasks.push(maintenance.spawn());

    if bridge_token_set {
        let http_queue = IncomingQueue::new(queue_cfg.max_per_chat, queue_cfg.max_total, std::time::Duration::from_secs(queue_cfg.drain_timeout_secs), cancel.clone());
        let http_state = Arc::new(HttpBridgeState::new(Arc::clone(&pipeline.bridge), http_queue, Arc::clone(&pipeline.metrics), bridge_token, gateway_path, security_profile));
        let router = http::router(http_state);
        let listener = tokio::net::TcpListener::bind(&gateway_addr).await.context("failed to bind HTTP bridge address")?;
        tracing::info!(addr = %gateway_addr, "HTTP bridge listening");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).into_future().await {
                tracing::error!(error = %e, "HTTP bridge stopped");
            }
        }));
    } else {
        tracing::warn!("gateway.bridge_token is empty, HTTP bridge disabled");
    }

    audit.append(&AuditEvent { at_ms: now_ms(), kind: "bot.start", chat_id: None, detail: serde_json::json!({}) }).await;

    println!("  switchboard bot mode starting...");
    println!("  Press Ctrl+C for graceful shutdown.");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            println!("\n  Shutting down gracefully...");
            cancel.cancel();
        }
        _ = futures::future::join_all(tasks) => {}
    }

    audit.append(&AuditEvent { at_ms: now_ms(), kind: "bot.stop", chat_id: None, detail: serde_json::json!({}) }).await;
    println!("  Shutdown complete.");
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let config = load_config()?;
    let config_path = Config::default_path();

    println!();
    println!("  switchboard status");
    println!("  ---------------------------------------");
    println!("  Config:    {}", config_path.display());

    match config.providers.find_active() {
        Some((name, _)) => println!("  Provider:  configured ({name})"),
        None => println!("  Provider:  none configured"),
    }

    let ws = config.workspace_path();
    println!("  Workspace: {} {}", ws.display(), if ws.exists() { "" } else { "(will be created)" });

    println!("  Gateway:   {}:{}{}", config.gateway.host, config.gateway.port, config.gateway.bridge_path);
    println!("  Telegram:  {}", config.channels.telegram.as_ref().map_or(false, |t| t.enabled));

    let store = SqliteStateStore::open(&config.state_db_path_resolved())?;
    let pending = store.list_pending_tasks_for_chat(CLI_CHAT_ID)?;
    println!("  Tasks:     {} pending for the direct chat", pending.len());
    println!();

    Ok(())
}

async fn cmd_schedule(action: ScheduleAction) -> Result<()> {
    let config = load_config()?;
    let store = SqliteStateStore::open(&config.state_db_path_resolved())?;

    match action {
        ScheduleAction::List => {
            let tasks = store.list_pending_tasks_for_chat(CLI_CHAT_ID)?;
            if tasks.is_empty() {
                println!("  No pending tasks.");
            } else {
                for t in tasks {
                    println!("  {} - {}", t.id, t.title);
                }
            }
        }
        ScheduleAction::Cancel { id } => {
            if store.cancel_task(&id, now_ms())? {
                println!("  Canceled {id}.");
            } else {
                println!("  Task {id} was not pending.");
            }
        }
    }

    Ok(())
}

fn cmd_router() -> Result<()> {
    let version = router::default_version();
    println!("  Router version: {} ({})", version.id, version.label);
    println!("  hybrid_alpha={} min_score_gap={}", version.hybrid_alpha, version.min_score_gap);
    let mut routes: Vec<&String> = version.routes.keys().collect();
    routes.sort();
    for name in routes {
        let route = &version.routes[name];
        println!("  - {:<20} threshold={:.2} utterances={}", name, route.threshold, route.utterances.len());
    }
    Ok(())
}
