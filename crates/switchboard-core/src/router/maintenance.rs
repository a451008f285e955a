//! Background router maintenance (spec §4.E.6/§4.E.8): hard-negative
//! mining off the dataset log, and a canary guard that polls accuracy and
//! auto-disables a regressing canary. Spawned the same way
//! `scheduler::Scheduler`/`outbox::OutboxWorker` run their poll loops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::store::StateStore;

use super::dataset::{CanaryGuard, HardNegativeMiner};
use super::{IntentRouter, RouterVersion};

/// Loads a stored `RouterVersionSnapshot` by id for use as the active
/// canary, called once at startup (not part of the poll loop itself, since
/// canary activation is an operator decision read from config).
pub fn load_canary_version(store: &dyn StateStore, version_id: &str) -> Option<RouterVersion> {
    match store.list_version_snapshots() {
        Ok(snapshots) => {
            let found = snapshots.into_iter().find(|s| s.id == version_id);
            if found.is_none() {
                warn!(version_id, "configured canary version_id not found among stored snapshots");
            }
            found.map(RouterVersion::from_snapshot)
        }
        Err(e) => {
            warn!(error = %e, "failed to load router version snapshots");
            None
        }
    }
}

pub struct RouterMaintenance {
    router: Arc<IntentRouter>,
    miner: HardNegativeMiner,
    max_per_route: usize,
    guard: Mutex<Option<CanaryGuard>>,
    breaches_to_disable: u32,
    consecutive_breaches: Mutex<u32>,
    last_seen_len: Mutex<usize>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl RouterMaintenance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<IntentRouter>,
        min_occurrences: usize,
        max_per_route: usize,
        guard: Option<CanaryGuard>,
        breaches_to_disable: u32,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            router,
            miner: HardNegativeMiner::new(min_occurrences),
            max_per_route,
            guard: Mutex::new(guard),
            breaches_to_disable,
            consecutive_breaches: Mutex::new(0),
            last_seen_len: Mutex::new(0),
            poll_interval,
            cancel,
        }
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        info!("router maintenance stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        self.poll_once();
                    }
                }
            }
        })
    }

    /// One maintenance pass: mines hard negatives from dataset rows
    /// appended since the last pass, folds their outcomes into the canary
    /// guard, and disables the canary once `breaches_to_disable` consecutive
    /// windows have regressed past its baseline.
    pub fn poll_once(&self) {
        let rows = self.router.dataset().snapshot();

        let mined = self.miner.mine(&rows);
        for (route, text, count) in &mined {
            self.router.add_negative_utterance(route, text, self.max_per_route);
            warn!(route, text, count, "hard negative mined and added to route config");
        }

        let mut last_seen_len = self.last_seen_len.lock().unwrap();
        let window = if rows.len() > *last_seen_len { &rows[*last_seen_len..] } else { &[][..] };
        *last_seen_len = rows.len();

        let mut guard = self.guard.lock().unwrap();
        let Some(g) = guard.as_mut() else { return };

        let labeled = window.iter().filter(|r| r.was_correct.is_some());
        let mut window_guard = CanaryGuard::new(g.baseline_accuracy(), 1, g.max_regression());
        for row in labeled {
            g.observe(row.was_correct.unwrap());
            window_guard.observe(row.was_correct.unwrap());
        }

        if window_guard.should_halt() {
            let mut consecutive = self.consecutive_breaches.lock().unwrap();
            *consecutive += 1;
            if *consecutive >= self.breaches_to_disable {
                warn!(consecutive = *consecutive, "canary accuracy breached for consecutive windows, disabling");
                self.router.set_canary(None);
                *guard = None;
                *consecutive = 0;
            }
        } else {
            *self.consecutive_breaches.lock().unwrap() = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SemanticRouteConfig;
    use crate::router::dataset::DatasetRow;
    use crate::router::IntentRouterConfig;
    use std::collections::HashMap;

    fn stable_version() -> RouterVersion {
        let route = SemanticRouteConfig { name: "gmail".into(), threshold: 0.3, utterances: vec!["enviar correo".into()], negative_utterances: vec![] };
        RouterVersion { id: "v1".into(), label: "stable".into(), routes: [("gmail".to_string(), route)].into_iter().collect(), hybrid_alpha: 0.5, min_score_gap: 0.05 }
    }

    fn router() -> Arc<IntentRouter> {
        Arc::new(IntentRouter::new(
            stable_version(),
            IntentRouterConfig {
                per_route_alpha: HashMap::new(),
                min_score_gap: 0.05,
                ab_split_percent: 0,
                ab_variant_b_alpha: None,
                ab_variant_b_min_gap: None,
                ab_variant_b_threshold_shift: 0.0,
                canary_split_percent: 0,
                shadow_sample_percent: 0,
            },
        ))
    }

    #[test]
    fn test_mined_hard_negative_is_added_to_route_config() {
        let r = router();
        for _ in 0..3 {
            r.dataset().append(DatasetRow {
                chat_id: 1,
                text: "buscar en internet algo".into(),
                chosen_route: "gmail".into(),
                score: 0.5,
                router_version: "v1".into(),
                was_correct: Some(false),
                recorded_at_ms: 0,
                shadow: false,
            });
        }

        let maintenance = RouterMaintenance::new(Arc::clone(&r), 2, 50, None, 3, Duration::from_secs(3600), CancellationToken::new());
        maintenance.poll_once();

        assert!(r.route_negative_utterances("gmail").iter().any(|u| u == "buscar en internet algo"));
    }

    #[test]
    fn test_canary_disabled_after_consecutive_breaching_windows() {
        let r = router();
        r.set_canary(Some(stable_version()));
        let guard = CanaryGuard::new(0.9, 1, 0.1);
        let maintenance = RouterMaintenance::new(Arc::clone(&r), 2, 50, Some(guard), 2, Duration::from_secs(3600), CancellationToken::new());

        for _ in 0..2 {
            r.dataset().append(DatasetRow {
                chat_id: 1,
                text: "x".into(),
                chosen_route: "gmail".into(),
                score: 0.5,
                router_version: "v1".into(),
                was_correct: Some(false),
                recorded_at_ms: 0,
                shadow: false,
            });
            maintenance.poll_once();
        }

        assert!(r.canary_version().is_none());
    }
}
