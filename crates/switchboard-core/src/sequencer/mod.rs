//! SequencePlanner (spec §2 row L, §9): AI-driven splitting of one request
//! into ordered sub-steps, each re-fed through the pipeline as a
//! `natural-intent` scheduled delivery tagged with a depth counter,
//! reusing the exact depth-2 recursion bound [`crate::scheduler`] enforces
//! for `natural-intent` deliveries (SPEC_FULL.md §5) rather than inventing
//! a second guard.

use serde_json::Value;

use crate::error::ExecutionError;

pub const MAX_SEQUENCE_DEPTH: u32 = 2;

#[async_trait::async_trait]
pub trait SequenceClassifier: Send + Sync {
    /// Asks the configured AI provider for a strict JSON array of
    /// sub-step strings.
    async fn classify_sequence(&self, text: &str) -> anyhow::Result<Vec<String>>;
}

pub struct SequencePlanner {
    classifier: Box<dyn SequenceClassifier>,
}

/// A sub-step ready to be enqueued as a scheduled `natural-intent` task,
/// tagged with the `seq:<n>` source marker SPEC_FULL.md describes.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedStep {
    pub text: String,
    pub depth: u32,
    pub source_tag: String,
}

impl SequencePlanner {
    pub fn new(classifier: Box<dyn SequenceClassifier>) -> Self {
        Self { classifier }
    }

    /// Splits `text` into ordered sub-steps at `current_depth`. Refuses to
    /// plan further once `current_depth` has reached [`MAX_SEQUENCE_DEPTH`],
    /// matching the scheduler's own recursion guard for natural-intent
    /// deliveries.
    pub async fn plan(&self, text: &str, current_depth: u32) -> Result<Vec<PlannedStep>, ExecutionError> {
        if current_depth >= MAX_SEQUENCE_DEPTH {
            return Err(ExecutionError::Policy("sequence recursion depth limit reached".into()));
        }

        let steps = self.classifier.classify_sequence(text).await.map_err(ExecutionError::from_anyhow)?;
        if steps.is_empty() {
            return Err(ExecutionError::Validation("planner returned no sub-steps".into()));
        }

        let next_depth = current_depth + 1;
        Ok(steps.into_iter().map(|s| PlannedStep { text: s, depth: next_depth, source_tag: format!("seq:{next_depth}") }).collect())
    }
}

pub fn depth_from_delivery_payload(payload: &Option<Value>) -> u32 {
    payload.as_ref().and_then(|v| v.get("depth")).and_then(|d| d.as_u64()).unwrap_or(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Vec<String>);

    #[async_trait::async_trait]
    impl SequenceClassifier for Fixed {
        async fn classify_sequence(&self, _text: &str) -> anyhow::Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_plan_tags_depth_and_source() {
        let planner = SequencePlanner::new(Box::new(Fixed(vec!["paso uno".into(), "paso dos".into()])));
        let steps = planner.plan("hace dos cosas", 0).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].depth, 1);
        assert_eq!(steps[0].source_tag, "seq:1");
    }

    #[tokio::test]
    async fn test_plan_refuses_past_depth_limit() {
        let planner = SequencePlanner::new(Box::new(Fixed(vec!["paso".into()])));
        let result = planner.plan("texto", MAX_SEQUENCE_DEPTH).await;
        assert!(matches!(result, Err(ExecutionError::Policy(_))));
    }

    #[tokio::test]
    async fn test_empty_plan_is_validation_error() {
        let planner = SequencePlanner::new(Box::new(Fixed(vec![])));
        let result = planner.plan("texto", 0).await;
        assert!(matches!(result, Err(ExecutionError::Validation(_))));
    }
}
