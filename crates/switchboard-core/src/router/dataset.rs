//! Dataset log, hard-negative mining, and canary guard (spec §4.E.6, §4.E.8).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One append-only row: what the router decided and (eventually) whether it
/// was right, fed back from execution outcomes or admin correction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRow {
    pub chat_id: i64,
    pub text: String,
    pub chosen_route: String,
    pub score: f64,
    pub router_version: String,
    pub was_correct: Option<bool>,
    pub recorded_at_ms: i64,
    /// `true` for a parallel shadow-mode decision (spec §4.E.7) recorded
    /// alongside the live one, never the served decision itself.
    #[serde(default)]
    pub shadow: bool,
}

/// Append-only in-process log. Persistence to disk/DB is the caller's
/// responsibility (the store layer owns durable writes); this type only
/// keeps the working set used for hard-negative mining within a process
/// lifetime.
pub struct DatasetLog {
    rows: Mutex<Vec<DatasetRow>>,
}

impl DatasetLog {
    pub fn new() -> Self {
        Self { rows: Mutex::new(Vec::new()) }
    }

    pub fn append(&self, row: DatasetRow) {
        self.rows.lock().unwrap().push(row);
    }

    pub fn mark_outcome(&self, chat_id: i64, text: &str, was_correct: bool) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().rev().find(|r| r.chat_id == chat_id && r.text == text) {
            row.was_correct = Some(was_correct);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DatasetRow> {
        self.rows.lock().unwrap().clone()
    }
}

impl Default for DatasetLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Surfaces routes that are frequently scored high but marked incorrect —
/// candidates for new negative utterances on that route's config.
pub struct HardNegativeMiner {
    min_occurrences: usize,
}

impl HardNegativeMiner {
    pub fn new(min_occurrences: usize) -> Self {
        Self { min_occurrences }
    }

    pub fn mine(&self, rows: &[DatasetRow]) -> Vec<(String, String, usize)> {
        let mut counts: HashMap<(String, String), usize> = HashMap::new();
        for row in rows {
            if row.was_correct == Some(false) {
                *counts.entry((row.chosen_route.clone(), row.text.clone())).or_insert(0) += 1;
            }
        }
        let mut hard_negatives: Vec<(String, String, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= self.min_occurrences)
            .map(|((route, text), count)| (route, text, count))
            .collect();
        hard_negatives.sort_by(|a, b| b.2.cmp(&a.2));
        hard_negatives
    }
}

/// Tracks a canary router version's live accuracy against its snapshot's
/// pre-registered baseline, and decides whether the canary should be halted.
pub struct CanaryGuard {
    baseline_accuracy: f64,
    min_samples: usize,
    max_regression: f64,
    hits: u64,
    total: u64,
}

impl CanaryGuard {
    pub fn new(baseline_accuracy: f64, min_samples: usize, max_regression: f64) -> Self {
        Self { baseline_accuracy, min_samples, max_regression, hits: 0, total: 0 }
    }

    pub fn observe(&mut self, was_correct: bool) {
        self.total += 1;
        if was_correct {
            self.hits += 1;
        }
    }

    pub fn baseline_accuracy(&self) -> f64 {
        self.baseline_accuracy
    }

    pub fn max_regression(&self) -> f64 {
        self.max_regression
    }

    /// `true` once enough samples have accumulated and live accuracy has
    /// regressed past `max_regression` below baseline.
    pub fn should_halt(&self) -> bool {
        if (self.total as usize) < self.min_samples {
            return false;
        }
        let live_accuracy = self.hits as f64 / self.total as f64;
        (self.baseline_accuracy - live_accuracy) >= self.max_regression
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(route: &str, text: &str, correct: Option<bool>) -> DatasetRow {
        DatasetRow {
            chat_id: 1,
            text: text.to_string(),
            chosen_route: route.to_string(),
            score: 0.8,
            router_version: "v1".to_string(),
            was_correct: correct,
            recorded_at_ms: 0,
            shadow: false,
        }
    }

    #[test]
    fn test_append_and_mark_outcome() {
        let log = DatasetLog::new();
        log.append(row("gmail", "enviar correo", None));
        log.mark_outcome(1, "enviar correo", false);
        let snapshot = log.snapshot();
        assert_eq!(snapshot[0].was_correct, Some(false));
    }

    #[test]
    fn test_hard_negative_miner_threshold() {
        let miner = HardNegativeMiner::new(2);
        let rows = vec![
            row("gmail", "buscar en internet", Some(false)),
            row("gmail", "buscar en internet", Some(false)),
            row("web", "enviar correo", Some(false)),
        ];
        let mined = miner.mine(&rows);
        assert_eq!(mined.len(), 1);
        assert_eq!(mined[0].0, "gmail");
    }

    #[test]
    fn test_canary_guard_halts_on_regression() {
        let mut guard = CanaryGuard::new(0.9, 10, 0.2);
        for _ in 0..10 {
            guard.observe(false);
        }
        assert!(guard.should_halt());
    }

    #[test]
    fn test_canary_guard_waits_for_min_samples() {
        let mut guard = CanaryGuard::new(0.9, 10, 0.2);
        for _ in 0..3 {
            guard.observe(false);
        }
        assert!(!guard.should_halt());
    }
}
