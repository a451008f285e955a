//! Scheduler (spec §4.H): polls due [`ScheduledTask`] rows and dispatches
//! them by [`DeliveryKind`]. Adapted from the teacher's `CronService`
//! polling loop (`tools/schedule.rs` drives it via `Arc<Mutex<CronService>>`
//! from tool calls) generalized to a standalone polling task with explicit
//! delivery-kind dispatch instead of a single fire-a-message callback.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::ExecutionError;
use crate::model::{DeliveryKind, ScheduledTask};
use crate::store::StateStore;

/// Maximum depth a `natural-intent` delivery is allowed to re-enter the
/// scheduler (spec §4.H / SPEC_FULL.md §5 recursion guard).
const MAX_NATURAL_INTENT_DEPTH: u32 = 2;

/// Computes `retryAfter = now + min(30, 2^min(5, failureCount))` minutes,
/// spec §4.H's exact backoff formula.
pub fn next_retry_after_ms(now_ms: i64, failure_count: u32) -> i64 {
    let minutes = 2u64.saturating_pow(failure_count.min(5)).min(30);
    now_ms + (minutes as i64) * 60_000
}

#[async_trait::async_trait]
pub trait TaskDelivery: Send + Sync {
    /// Attempts delivery. `depth` tracks natural-intent recursion so the
    /// dispatcher can refuse to re-enter past [`MAX_NATURAL_INTENT_DEPTH`].
    async fn deliver(&self, task: &ScheduledTask, depth: u32) -> Result<(), ExecutionError>;
}

pub struct Scheduler {
    store: Arc<dyn StateStore>,
    delivery: Arc<dyn TaskDelivery>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(store: Arc<dyn StateStore>, delivery: Arc<dyn TaskDelivery>, poll_interval: Duration, cancel: CancellationToken) -> Self {
        Self { store, delivery, poll_interval, cancel }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("scheduler stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.poll_once(now_ms()).await {
                            error!(error = %e, "scheduler poll failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn poll_once(&self, now_ms: i64) -> Result<(), ExecutionError> {
        let due = self.store.due_scheduled_tasks(now_ms)?;
        for task in due {
            let depth = match task.delivery_kind {
                DeliveryKind::NaturalIntent => natural_intent_depth(&task),
                _ => 0,
            };
            if task.delivery_kind == DeliveryKind::NaturalIntent && depth >= MAX_NATURAL_INTENT_DEPTH {
                warn!(task_id = %task.id, depth, "natural-intent recursion limit reached, marking failed");
                self.store.mark_delivery_failure(&task.id, now_ms, "recursion limit reached", now_ms + 86_400_000)?;
                continue;
            }

            match self.delivery.deliver(&task, depth).await {
                Ok(()) => {
                    self.store.mark_delivered(&task.id, now_ms)?;
                }
                Err(e) => {
                    let retry_after = next_retry_after_ms(now_ms, task.failure_count + 1);
                    self.store.mark_delivery_failure(&task.id, now_ms, &e.to_string(), retry_after)?;
                }
            }
        }
        Ok(())
    }
}

fn natural_intent_depth(task: &ScheduledTask) -> u32 {
    task.delivery_payload.as_ref().and_then(|v| v.get("depth")).and_then(|d| d.as_u64()).unwrap_or(0) as u32
}

fn now_ms() -> i64 {
    // Callers that need deterministic time inject it via `poll_once`
    // directly; the spawned loop uses wall-clock time since it drives a
    // live process, not a test.
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use crate::store::SqliteStateStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingDelivery {
        calls: AtomicU32,
        fail_until: u32,
    }

    #[async_trait::async_trait]
    impl TaskDelivery for CountingDelivery {
        async fn deliver(&self, _task: &ScheduledTask, _depth: u32) -> Result<(), ExecutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_until {
                Err(ExecutionError::Transient("simulated".into()))
            } else {
                Ok(())
            }
        }
    }

    fn sample_task(id: &str, due_at: i64) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            chat_id: 1,
            user_id: None,
            title: "test".into(),
            due_at,
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
        }
    }

    #[test]
    fn test_backoff_formula_caps_at_thirty_minutes() {
        assert_eq!(next_retry_after_ms(0, 0), 60_000);
        assert_eq!(next_retry_after_ms(0, 5), 30 * 60_000);
        assert_eq!(next_retry_after_ms(0, 10), 30 * 60_000);
    }

    #[tokio::test]
    async fn test_due_task_delivers_and_marks_done() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        store.create_task(&sample_task("tsk-1", 1000)).unwrap();
        let delivery = Arc::new(CountingDelivery { calls: AtomicU32::new(0), fail_until: 0 });
        let scheduler = Scheduler::new(store.clone(), delivery, Duration::from_secs(1), CancellationToken::new());
        scheduler.poll_once(2000).await.unwrap();
        let task = store.get_task("tsk-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_failed_delivery_sets_retry_after() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        store.create_task(&sample_task("tsk-1", 1000)).unwrap();
        let delivery = Arc::new(CountingDelivery { calls: AtomicU32::new(0), fail_until: 10 });
        let scheduler = Scheduler::new(store.clone(), delivery, Duration::from_secs(1), CancellationToken::new());
        scheduler.poll_once(2000).await.unwrap();
        let task = store.get_task("tsk-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.retry_after.unwrap() > 2000);
    }
}
