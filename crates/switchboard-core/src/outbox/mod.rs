//! Outbox worker (spec §4.I): polls due [`OutboxMessage`] rows, delivers
//! through the egress transport, and retries with exponential backoff up
//! to a max attempt count before moving a row to the dead letter table.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::model::OutboxMessage;
use crate::store::StateStore;

const BASE_BACKOFF_MS: i64 = 2_000;

fn next_attempt_backoff_ms(attempts: u32) -> i64 {
    BASE_BACKOFF_MS * 2i64.saturating_pow(attempts.min(8))
}

#[async_trait::async_trait]
pub trait EgressTransport: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str, source: &str) -> anyhow::Result<()>;
}

pub struct OutboxWorker {
    store: Arc<dyn StateStore>,
    transport: Arc<dyn EgressTransport>,
    poll_interval: Duration,
    max_attempts: u32,
    cancel: CancellationToken,
}

impl OutboxWorker {
    pub fn new(store: Arc<dyn StateStore>, transport: Arc<dyn EgressTransport>, poll_interval: Duration, max_attempts: u32, cancel: CancellationToken) -> Self {
        Self { store, transport, poll_interval, max_attempts, cancel }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("outbox worker stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.drain_once(now_ms()).await {
                            error!(error = %e, "outbox drain failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn drain_once(&self, now_ms: i64) -> Result<(), StorageError> {
        let due = self.store.list_due_outbox_messages(now_ms, 50)?;
        for msg in due {
            match self.transport.send(msg.chat_id, &msg.text, &msg.source).await {
                Ok(()) => {
                    self.store.delete_outbox(msg.id)?;
                }
                Err(e) => {
                    let attempts = msg.attempts + 1;
                    if attempts >= self.max_attempts {
                        warn!(id = msg.id, attempts, "outbox message exhausted retries, moving to dead letter");
                        self.store.move_outbox_to_dead_letter(msg.id)?;
                    } else {
                        let next_attempt_at_ms = now_ms + next_attempt_backoff_ms(attempts);
                        self.store.mark_outbox_attempt(msg.id, next_attempt_at_ms, Some(&e.to_string()))?;
                    }
                }
            }
        }
        Ok(())
    }

}

fn now_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStateStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(i64, String)>>,
        fail_times: AtomicU32,
    }

    #[async_trait::async_trait]
    impl EgressTransport for RecordingTransport {
        async fn send(&self, chat_id: i64, text: &str, _source: &str) -> anyhow::Result<()> {
            if self.fail_times.load(Ordering::SeqCst) > 0 {
                self.fail_times.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("simulated failure");
            }
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    fn sample(id: i64) -> OutboxMessage {
        OutboxMessage { id, chat_id: 1, text: "hola".into(), source: "telegram".into(), created_at_ms: 0, attempts: 0, last_error: None, next_attempt_at_ms: 0 }
    }

    #[tokio::test]
    async fn test_successful_send_removes_row() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        let id = store.enqueue_outbox(&sample(0)).unwrap();
        let transport = Arc::new(RecordingTransport { sent: Mutex::new(vec![]), fail_times: AtomicU32::new(0) });
        let worker = OutboxWorker::new(store.clone(), transport.clone(), Duration::from_secs(1), 3, CancellationToken::new());
        worker.drain_once(1000).await.unwrap();
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        let _ = id;
        assert!(store.list_due_outbox_messages(1000, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_moves_to_dead_letter() {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        store.enqueue_outbox(&sample(0)).unwrap();
        let transport = Arc::new(RecordingTransport { sent: Mutex::new(vec![]), fail_times: AtomicU32::new(10) });
        let worker = OutboxWorker::new(store.clone(), transport, Duration::from_secs(1), 1, CancellationToken::new());
        worker.drain_once(1000).await.unwrap();
        assert!(store.list_due_outbox_messages(1_000_000, 10).unwrap().is_empty());
    }
}
