//! Ambient observability (SPEC_FULL.md §5 "supplemented features"):
//! counter/timing registry, newline-delimited-JSON audit log sink, and a
//! doctor report summarizing both for `/health` and an admin diagnostics
//! command.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::RwLock;
use tracing::error;

/// A single counter plus a fixed-boundary duration histogram, mirroring the
/// teacher's preference for plain `Arc<RwLock<HashMap>>` shared state over
/// a dedicated metrics crate.
#[derive(Debug, Clone, Default)]
struct Counter {
    count: u64,
    bucket_counts: [u64; BUCKET_BOUNDS_MS.len() + 1],
}

const BUCKET_BOUNDS_MS: [u64; 6] = [10, 50, 100, 500, 1_000, 5_000];

pub struct MetricsRegistry {
    counters: RwLock<HashMap<String, Counter>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self { counters: RwLock::new(HashMap::new()) }
    }

    pub async fn incr(&self, name: &str) {
        let mut guard = self.counters.write().await;
        guard.entry(name.to_string()).or_default().count += 1;
    }

    pub async fn observe_duration_ms(&self, name: &str, duration_ms: u64) {
        let mut guard = self.counters.write().await;
        let counter = guard.entry(name.to_string()).or_default();
        let bucket = BUCKET_BOUNDS_MS.iter().position(|b| duration_ms <= *b).unwrap_or(BUCKET_BOUNDS_MS.len());
        counter.bucket_counts[bucket] += 1;
    }

    pub async fn snapshot(&self) -> HashMap<String, u64> {
        self.counters.read().await.iter().map(|(k, v)| (k.clone(), v.count)).collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One newline-delimited-JSON audit row. `kind` follows the
/// `"<module>.<verb>.<outcome>"` naming spec §5 (via SPEC_FULL.md's
/// expansion) implies, e.g. `"intent.execution.result"`.
#[derive(Debug, Serialize)]
pub struct AuditEvent<'a> {
    pub at_ms: i64,
    pub kind: &'a str,
    pub chat_id: Option<i64>,
    pub detail: Value,
}

pub struct AuditLog {
    file: AsyncMutex<tokio::fs::File>,
}

impl AuditLog {
    pub async fn open(path: &std::path::Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: AsyncMutex::new(file) })
    }

    pub async fn append(&self, event: &AuditEvent<'_>) {
        let Ok(mut line) = serde_json::to_vec(event) else {
            error!("failed to serialize audit event");
            return;
        };
        line.push(b'\n');
        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(&line).await {
            error!(error = %e, "failed to append audit event");
        }
    }
}

/// A health summary combining metrics and gateway state, used by the HTTP
/// bridge's `/health` endpoint (spec §6.1).
#[derive(Debug, Serialize)]
pub struct DoctorReport {
    pub uptime_secs: u64,
    pub metrics: HashMap<String, u64>,
    pub queue_depth: usize,
    pub circuit_breakers_open: Vec<String>,
}

pub async fn build_doctor_report(metrics: &Arc<MetricsRegistry>, uptime_secs: u64, queue_depth: usize, circuit_breakers_open: Vec<String>) -> DoctorReport {
    DoctorReport { uptime_secs, metrics: metrics.snapshot().await, queue_depth, circuit_breakers_open }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_increments() {
        let registry = MetricsRegistry::new();
        registry.incr("router.route.matched").await;
        registry.incr("router.route.matched").await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot["router.route.matched"], 2);
    }

    #[tokio::test]
    async fn test_audit_log_appends_newline_delimited_json() {
        let dir = std::env::temp_dir().join(format!("switchboard-audit-test-{}", std::process::id()));
        let path = dir.join("audit.ndjson");
        let log = AuditLog::open(&path).await.unwrap();
        log.append(&AuditEvent { at_ms: 1000, kind: "intent.execution.result", chat_id: Some(1), detail: serde_json::json!({"ok": true}) }).await;
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.trim_end().lines().count() == 1);
        assert!(content.contains("intent.execution.result"));
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
