//! Executor (spec §4.G): per-route circuit breaker, transient retry,
//! handler timeout, and policy enforcement.
//!
//! The breaker follows the quarantine pattern the fallback provider uses
//! for AI providers (instant of last failure, time-boxed cooldown) but adds
//! the closed/open/half-open states and failure-count threshold the
//! reference only needed a single timestamp for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::{debug, warn};

use crate::admin::AdminSecurity;
use crate::error::ExecutionError;
use crate::model::{AgentPolicy, ApprovalKind, Capability};

const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
const DEFAULT_OPEN_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(45);
const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct RouteBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl RouteBreaker {
    fn new() -> Self {
        Self { state: BreakerState::Closed, consecutive_failures: 0, opened_at: None }
    }
}

/// Per-route circuit breaker registry (spec §4.G.2): `closed` allows calls
/// through, `open` rejects immediately until the cooldown elapses, then one
/// probe call is allowed through in `half-open` to decide recovery.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, RouteBreaker>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self { breakers: Mutex::new(HashMap::new()), failure_threshold, open_duration }
    }

    /// Returns `Err(retry_after_ms)` if the route's breaker is open.
    fn admit(&self, route: &str) -> Result<(), i64> {
        let mut guard = self.breakers.lock().unwrap();
        let breaker = guard.entry(route.to_string()).or_insert_with(RouteBreaker::new);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let opened_at = breaker.opened_at.expect("open breaker always has opened_at");
                let elapsed = opened_at.elapsed();
                if elapsed >= self.open_duration {
                    breaker.state = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err((self.open_duration - elapsed).as_millis() as i64)
                }
            }
        }
    }

    fn record_success(&self, route: &str) {
        let mut guard = self.breakers.lock().unwrap();
        if let Some(breaker) = guard.get_mut(route) {
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
        }
    }

    fn record_failure(&self, route: &str) {
        let mut guard = self.breakers.lock().unwrap();
        let breaker = guard.entry(route.to_string()).or_insert_with(RouteBreaker::new);
        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.consecutive_failures += 1;
            }
            BreakerState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.failure_threshold {
                    warn!(route, failures = breaker.consecutive_failures, "opening circuit breaker");
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}

/// What a handler produces on success (spec §4.G.4 post-success side
/// effects are applied by the caller, keyed off these fields).
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    pub reply_text: Option<String>,
    pub indexed_list_update: Option<crate::model::IndexedListContext>,
    pub outbox_enqueue: Option<(String, String)>, // (chat text, source)
    pub scheduled_task: Option<crate::model::ScheduledTask>,
}

#[async_trait::async_trait]
pub trait HandlerAction: Send + Sync {
    fn route(&self) -> &str;
    fn capabilities(&self) -> &[Capability];
    async fn handle(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError>;
}

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
    pub safe_mode: bool,
    pub admin_mode: bool,
}

/// Runs a routed request through policy enforcement, the circuit breaker,
/// transient retry with jittered backoff, and a cooperative timeout.
pub struct Executor {
    breakers: CircuitBreakerRegistry,
    policy: AgentPolicy,
    retry_attempts: u32,
    handler_timeout: Duration,
    admin: Arc<AdminSecurity>,
    approval_ttl_ms: i64,
}

fn approval_kind_for(cap: Capability) -> ApprovalKind {
    match cap {
        Capability::Reboot => ApprovalKind::Reboot,
        Capability::AiShell => ApprovalKind::AiShell,
        _ => ApprovalKind::Exec,
    }
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_millis() as i64
}

impl Executor {
    pub fn new(policy: AgentPolicy, retry_attempts: u32, admin: Arc<AdminSecurity>, approval_ttl_ms: i64) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_DURATION),
            policy,
            retry_attempts,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            admin,
            approval_ttl_ms,
        }
    }

    /// Consults the policy (spec §4.G.3): rejects capabilities blocked in
    /// safe mode, then for anything requiring approval without an already
    /// admin-mode context, creates a `PendingApproval` and surfaces its
    /// 4-digit ID rather than hard-rejecting.
    fn check_policy(&self, ctx: &ExecutionContext, handler: &dyn HandlerAction) -> Result<(), ExecutionError> {
        if ctx.safe_mode {
            for cap in handler.capabilities() {
                if self.policy.block_in_safe_mode.contains(cap) {
                    return Err(ExecutionError::Policy(format!("{:?} blocked in safe mode", cap)));
                }
            }
        }
        for cap in handler.capabilities() {
            if self.policy.approval_required.contains(cap) && !ctx.admin_mode {
                let approval = self.admin.request_approval(
                    approval_kind_for(*cap),
                    ctx.chat_id,
                    ctx.user_id,
                    handler.route(),
                    &ctx.text,
                    None,
                    now_ms(),
                    self.approval_ttl_ms,
                )?;
                return Err(ExecutionError::ApprovalRequired { id: approval.id });
            }
        }
        Ok(())
    }

    pub async fn execute(&self, handler: &dyn HandlerAction, ctx: ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
        self.check_policy(&ctx, handler)?;

        let route = handler.route().to_string();
        if let Err(retry_after_ms) = self.breakers.admit(&route) {
            return Err(ExecutionError::CircuitOpen { route, retry_after_ms });
        }

        let mut last_err = None;
        for attempt in 0..=self.retry_attempts {
            if attempt > 0 {
                let backoff = full_jitter_backoff(attempt, DEFAULT_RETRY_BASE);
                tokio::time::sleep(backoff).await;
            }

            let timed = tokio::time::timeout(self.handler_timeout, handler.handle(&ctx)).await;
            match timed {
                Ok(Ok(result)) => {
                    self.breakers.record_success(&route);
                    return Ok(result);
                }
                Ok(Err(e)) => {
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        self.breakers.record_failure(&route);
                        return Err(last_err.unwrap());
                    }
                    debug!(route = %route, attempt, "transient handler error, retrying");
                }
                Err(_) => {
                    self.breakers.record_failure(&route);
                    return Err(ExecutionError::Transient(format!("handler timed out after {:?}", self.handler_timeout)));
                }
            }
        }

        self.breakers.record_failure(&route);
        Err(last_err.unwrap_or_else(|| ExecutionError::Transient("exhausted retries".into())))
    }
}

fn full_jitter_backoff(attempt: u32, base: Duration) -> Duration {
    let max = base.as_millis() as u64 * 2u64.saturating_pow(attempt.min(10));
    let jittered = rand::thread_rng().gen_range(0..=max.max(1));
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyHandler {
        route: String,
        caps: Vec<Capability>,
        fail_times: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl HandlerAction for FlakyHandler {
        fn route(&self) -> &str {
            &self.route
        }
        fn capabilities(&self) -> &[Capability] {
            &self.caps
        }
        async fn handle(&self, _ctx: &ExecutionContext) -> Result<ExecutionResult, ExecutionError> {
            let mut guard = self.fail_times.lock().unwrap();
            if *guard > 0 {
                *guard -= 1;
                Err(ExecutionError::Transient("flaky".into()))
            } else {
                Ok(ExecutionResult { reply_text: Some("ok".into()), ..Default::default() })
            }
        }
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext { chat_id: 1, user_id: 1, text: "hi".into(), safe_mode: false, admin_mode: false }
    }

    fn admin() -> Arc<AdminSecurity> {
        Arc::new(AdminSecurity::new(Arc::new(crate::store::SqliteStateStore::open_in_memory().unwrap())))
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let handler = FlakyHandler { route: "web".into(), caps: vec![], fail_times: Mutex::new(2) };
        let executor = Executor::new(AgentPolicy::default(), 3, admin(), 60_000);
        let result = executor.execute(&handler, ctx()).await.unwrap();
        assert_eq!(result.reply_text.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn test_circuit_opens_after_threshold_failures() {
        let handler = FlakyHandler { route: "web".into(), caps: vec![], fail_times: Mutex::new(999) };
        let executor = Executor::new(AgentPolicy::default(), 0, admin(), 60_000);
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            let _ = executor.execute(&handler, ctx()).await;
        }
        let outcome = executor.execute(&handler, ctx()).await;
        assert!(matches!(outcome, Err(ExecutionError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_safe_mode_blocks_capability() {
        let handler = FlakyHandler { route: "workspace".into(), caps: vec![Capability::WorkspaceDelete], fail_times: Mutex::new(0) };
        let executor = Executor::new(AgentPolicy::default(), 0, admin(), 60_000);
        let mut c = ctx();
        c.safe_mode = true;
        let outcome = executor.execute(&handler, c).await;
        assert!(matches!(outcome, Err(ExecutionError::Policy(_))));
    }

    #[tokio::test]
    async fn test_approval_required_creates_pending_approval() {
        let handler = FlakyHandler { route: "self-maintenance".into(), caps: vec![Capability::Exec], fail_times: Mutex::new(0) };
        let a = admin();
        let executor = Executor::new(AgentPolicy::default(), 0, Arc::clone(&a), 60_000);
        let outcome = executor.execute(&handler, ctx()).await;
        let id = match outcome {
            Err(ExecutionError::ApprovalRequired { id }) => id,
            other => panic!("expected ApprovalRequired, got {other:?}"),
        };
        assert_eq!(id.len(), 4);
        assert!(a.consume(&id, Some(1), 1000).unwrap().is_some());
    }
}
