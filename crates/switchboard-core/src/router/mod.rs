//! IntentRouter (spec §4.E): candidate narrowing, hybrid lexical/semantic
//! ranking, an additive ensemble decision, AI fallback, and the A/B,
//! canary, and shadow-mode overlays.

pub mod calibration;
pub mod dataset;
pub mod maintenance;
pub mod narrowing;
pub mod score;

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::model::{RouterVersionSnapshot, SemanticRouteConfig};

pub use narrowing::RoutingContext;

/// What `route()` decided, and why, for audit and dataset logging.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Matched { route: String, score: f64, via: MatchSource },
    NeedsClarification { candidates: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchSource {
    Hybrid,
    AiFallback,
}

/// An AI fallback classifier, invoked when narrowing + hybrid scoring fail
/// to clear the confidence gap. Implemented by the provider adapter so the
/// router stays decoupled from any specific LLM.
#[async_trait::async_trait]
pub trait AiRouteFallback: Send + Sync {
    async fn classify(&self, text: &str, candidates: &[String]) -> Option<String>;
}

/// A router version: a named, immutable set of route configs plus the
/// scoring knobs active when it was snapshotted (spec §4.E.7).
#[derive(Debug, Clone)]
pub struct RouterVersion {
    pub id: String,
    pub label: String,
    pub routes: HashMap<String, SemanticRouteConfig>,
    pub hybrid_alpha: f64,
    pub min_score_gap: f64,
}

impl RouterVersion {
    pub fn from_snapshot(snapshot: RouterVersionSnapshot) -> Self {
        let routes = snapshot.routes.into_iter().map(|r| (r.name.clone(), r)).collect();
        Self { id: snapshot.id, label: snapshot.label, routes, hybrid_alpha: snapshot.hybrid_alpha, min_score_gap: snapshot.min_score_gap }
    }
}

/// A minimal seed version covering every built-in handler with a handful
/// of example utterances each, for first-run bootstrapping before an
/// operator has trained real routing data (spec §4.E.7 versions are
/// otherwise expected to come from `RouterVersionSnapshot` rows).
pub fn default_version() -> RouterVersion {
    let routes: &[(&str, &[&str])] = &[
        ("gmail", &["enviar correo a", "mandame un mail a", "envia un email a"]),
        ("gmail-recipients", &["guardar contacto de correo", "recordá el mail de", "agregar destinatario"]),
        ("workspace", &["listar archivos", "borrar el archivo", "mostrame la carpeta"]),
        ("document", &["resumí el documento", "leé el archivo", "qué dice el pdf"]),
        ("schedule", &["recordame mañana", "agendá una tarea", "avisame en una hora"]),
        ("memory", &["acordate que", "qué sabés sobre mí", "guardá este dato"]),
        ("web", &["buscá en internet", "qué pasó hoy con", "noticias sobre"]),
        ("connector", &["conectá con", "estado de la integración", "sincronizá"]),
        ("self-maintenance", &["reiniciá el bot", "actualizate", "revisá tu estado"]),
        ("stoic-smalltalk", &["hola como estas", "contame un chiste", "qué opinás de la vida"]),
        ("ai-shell", &["ejecutá ls -la", "corré este comando", "ejecutar comando en la terminal"]),
    ];
    let routes = routes
        .iter()
        .map(|(name, utterances)| {
            (
                name.to_string(),
                SemanticRouteConfig {
                    name: name.to_string(),
                    threshold: 0.3,
                    utterances: utterances.iter().map(|s| s.to_string()).collect(),
                    negative_utterances: vec![],
                },
            )
        })
        .collect();
    RouterVersion { id: "seed-v1".into(), label: "seed".into(), routes, hybrid_alpha: 0.5, min_score_gap: 0.05 }
}

/// `resolveVariant(chatId) = |chatId| mod 100 < splitPercent` (spec §4.E.7).
pub fn resolve_variant(chat_id: i64, split_percent: u32) -> bool {
    (chat_id.unsigned_abs() % 100) < split_percent as u64
}

pub struct IntentRouterConfig {
    pub per_route_alpha: HashMap<String, f64>,
    pub min_score_gap: f64,
    pub ab_split_percent: u32,
    pub ab_variant_b_alpha: Option<f64>,
    pub ab_variant_b_min_gap: Option<f64>,
    pub ab_variant_b_threshold_shift: f64,
    pub canary_split_percent: u32,
    pub shadow_sample_percent: u32,
}

/// One narrowed route scored against a resolved version: its raw lexical,
/// semantic, and hybrid components, kept around so the ensemble step can
/// reuse them without re-scoring.
#[derive(Debug, Clone)]
struct Candidate {
    route: String,
    sem: f64,
    hyb: f64,
}

/// Which version, alpha, and gap a given chat's request is served under
/// (spec §4.E.6): the live stable version, an A/B variant with its alpha/gap
/// knobs applied in place, or a canary version wholesale.
struct ServingPlan {
    version: RouterVersion,
    alpha_override: Option<f64>,
    min_gap: f64,
    threshold_shift: f64,
    via_canary: bool,
}

fn build_candidates(
    text: &str,
    route_names: &HashSet<String>,
    version: &RouterVersion,
    alpha_override: Option<f64>,
    per_route_alpha: &HashMap<String, f64>,
) -> Vec<Candidate> {
    route_names
        .iter()
        .filter_map(|route| {
            let cfg = version.routes.get(route)?;
            let lex = score::lexical_score(text, cfg);
            let sem = score::semantic_score(text, cfg);
            let alpha = alpha_override.unwrap_or_else(|| per_route_alpha.get(route).copied().unwrap_or(version.hybrid_alpha));
            let hyb = alpha * sem + (1.0 - alpha) * lex;
            Some(Candidate { route: route.clone(), sem, hyb })
        })
        .collect()
}

fn threshold_survivors(candidates: &[Candidate], version: &RouterVersion, threshold_shift: f64) -> Vec<Candidate> {
    candidates
        .iter()
        .filter(|c| version.routes.get(&c.route).is_some_and(|r| c.hyb >= r.threshold + threshold_shift))
        .cloned()
        .collect()
}

/// A plain threshold + min-gap decision with no ensemble terms, used for the
/// shadow-mode pass (spec §4.E.7), which records an independent decision
/// without affecting the served one.
fn simple_decision(candidates: &[Candidate], version: &RouterVersion, min_gap: f64, threshold_shift: f64) -> Option<(String, f64)> {
    let mut survivors = threshold_survivors(candidates, version, threshold_shift);
    survivors.sort_by(|a, b| b.hyb.partial_cmp(&a.hyb).unwrap());
    match survivors.as_slice() {
        [] => None,
        [only] => Some((only.route.clone(), only.hyb)),
        [top, second, ..] => {
            if (top.hyb - second.hyb) >= min_gap {
                Some((top.route.clone(), top.hyb))
            } else {
                None
            }
        }
    }
}

/// Additive ensemble score for one candidate (spec §4.E.4): semantic
/// strength, whether the AI fallback picked it, whether route-layer
/// narrowing still allowed it, contextual boosts, and calibrated confidence
/// for the single top-semantic candidate.
#[allow(clippy::too_many_arguments)]
fn ensemble_score(
    candidate: &Candidate,
    top_semantic_route: &str,
    ai_selected: Option<&str>,
    layer_allowed: &HashSet<String>,
    narrow_ctx: &RoutingContext,
    normalized: &str,
    calibration: &calibration::CalibrationTable,
) -> f64 {
    let mut s = 0.65 * candidate.sem;
    if ai_selected == Some(candidate.route.as_str()) {
        s += 0.35;
    }
    if layer_allowed.contains(&candidate.route) {
        s += 0.08;
    }
    s += 0.9 * narrowing::contextual_boost(&candidate.route, narrow_ctx, normalized);
    if candidate.route == top_semantic_route && calibration.is_calibrated(&candidate.route) {
        s += 0.25 * calibration.calibrate(&candidate.route, candidate.hyb);
    }
    s
}

/// Holds the active (stable) router version plus optional A/B variant and
/// canary version, and orchestrates a single routing decision end to end.
pub struct IntentRouter {
    stable: RwLock<RouterVersion>,
    variant_b: RwLock<Option<RouterVersion>>,
    canary: RwLock<Option<RouterVersion>>,
    calibration: RwLock<calibration::CalibrationTable>,
    dataset: dataset::DatasetLog,
    config: IntentRouterConfig,
}

impl IntentRouter {
    pub fn new(stable: RouterVersion, config: IntentRouterConfig) -> Self {
        Self {
            stable: RwLock::new(stable),
            variant_b: RwLock::new(None),
            canary: RwLock::new(None),
            calibration: RwLock::new(calibration::CalibrationTable::new()),
            dataset: dataset::DatasetLog::new(),
            config,
        }
    }

    /// Swaps the A/B variant-B version wholesale. Most variant-B behavior
    /// comes from `ab_variant_b_alpha`/`ab_variant_b_min_gap` applied over
    /// the stable version (no separate version required); this exists for
    /// operators who do want a distinct route table for variant B.
    pub fn set_variant_b(&self, version: Option<RouterVersion>) {
        *self.variant_b.write().unwrap() = version;
    }

    pub fn set_canary(&self, version: Option<RouterVersion>) {
        *self.canary.write().unwrap() = version;
    }

    pub fn canary_version(&self) -> Option<RouterVersion> {
        self.canary.read().unwrap().clone()
    }

    pub fn dataset(&self) -> &dataset::DatasetLog {
        &self.dataset
    }

    /// Adds `utterance` as a negative example for `route` on the live
    /// stable version (spec §4.E.8 `HardNegativeMiner`), capped to
    /// `max_per_route` by dropping the oldest entry first.
    pub fn add_negative_utterance(&self, route: &str, utterance: &str, max_per_route: usize) {
        let mut stable = self.stable.write().unwrap();
        if let Some(cfg) = stable.routes.get_mut(route) {
            if cfg.negative_utterances.iter().any(|u| u == utterance) {
                return;
            }
            cfg.negative_utterances.push(utterance.to_string());
            if cfg.negative_utterances.len() > max_per_route {
                cfg.negative_utterances.remove(0);
            }
        }
    }

    pub fn route_negative_utterances(&self, route: &str) -> Vec<String> {
        self.stable.read().unwrap().routes.get(route).map(|c| c.negative_utterances.clone()).unwrap_or_default()
    }

    /// Which version/alpha/gap this chat's request is served under (spec
    /// §4.E.6): canary takes priority as a full live-routes replacement,
    /// then the A/B variant with its alpha/gap/threshold-shift knobs, then
    /// the stable version with no overrides.
    fn resolve_serving_plan(&self, chat_id: i64) -> ServingPlan {
        if resolve_variant(chat_id, self.config.canary_split_percent) {
            if let Some(canary) = self.canary.read().unwrap().clone() {
                return ServingPlan {
                    min_gap: canary.min_score_gap,
                    alpha_override: Some(canary.hybrid_alpha),
                    threshold_shift: 0.0,
                    version: canary,
                    via_canary: true,
                };
            }
        }

        if resolve_variant(chat_id, self.config.ab_split_percent) {
            let version = self.variant_b.read().unwrap().clone().unwrap_or_else(|| self.stable.read().unwrap().clone());
            return ServingPlan {
                min_gap: self.config.ab_variant_b_min_gap.unwrap_or(self.config.min_score_gap),
                alpha_override: self.config.ab_variant_b_alpha,
                threshold_shift: self.config.ab_variant_b_threshold_shift,
                version,
                via_canary: false,
            };
        }

        ServingPlan {
            version: self.stable.read().unwrap().clone(),
            alpha_override: None,
            min_gap: self.config.min_score_gap,
            threshold_shift: 0.0,
            via_canary: false,
        }
    }

    /// Full routing pipeline: narrow, score every surviving candidate under
    /// the resolved serving plan, fall back to AI classification when no
    /// candidate clears threshold, and decide via the additive ensemble.
    /// Never errors — an unresolvable request always degrades to
    /// `NeedsClarification` (spec §4.E.9).
    pub async fn route(
        &self,
        text: &str,
        chat_id: i64,
        narrow_ctx: &RoutingContext,
        ai_fallback: Option<&dyn AiRouteFallback>,
        now_ms: i64,
    ) -> RouteOutcome {
        let normalized = text.to_lowercase();

        let filtered = narrowing::context_filter(text, narrow_ctx);
        let layered = narrowing::route_layers(text, filtered, narrow_ctx);
        let layer_allowed: HashSet<String> = layered.candidates.clone();
        let narrowed = narrowing::hierarchy(text, layered, narrow_ctx);

        if narrowed.candidates.is_empty() {
            return RouteOutcome::NeedsClarification { candidates: vec![] };
        }

        let plan = self.resolve_serving_plan(chat_id);
        let all_candidates = build_candidates(text, &narrowed.candidates, &plan.version, plan.alpha_override, &self.config.per_route_alpha);
        let mut survivors = threshold_survivors(&all_candidates, &plan.version, plan.threshold_shift);
        survivors.sort_by(|a, b| b.hyb.partial_cmp(&a.hyb).unwrap());

        let candidate_names: Vec<String> = narrowed.candidates.iter().cloned().collect();

        let mut ai_selected: Option<String> = None;
        let ensemble_pool: Vec<Candidate> = if !survivors.is_empty() {
            survivors
        } else {
            if let Some(fallback) = ai_fallback {
                ai_selected = fallback.classify(text, &candidate_names).await.filter(|r| narrowed.candidates.contains(r));
            }
            if ai_selected.is_none() {
                return RouteOutcome::NeedsClarification { candidates: candidate_names };
            }
            all_candidates
        };

        if ensemble_pool.is_empty() {
            return RouteOutcome::NeedsClarification { candidates: candidate_names };
        }

        let top_semantic_route = ensemble_pool
            .iter()
            .max_by(|a, b| a.sem.partial_cmp(&b.sem).unwrap())
            .map(|c| c.route.clone())
            .unwrap_or_default();

        let calibration = self.calibration.read().unwrap();
        let mut scored: Vec<(Candidate, f64)> = ensemble_pool
            .into_iter()
            .map(|c| {
                let s = ensemble_score(&c, &top_semantic_route, ai_selected.as_deref(), &layer_allowed, narrow_ctx, &normalized, &calibration);
                (c, s)
            })
            .collect();
        drop(calibration);

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());

        let decision = match scored.as_slice() {
            [] => None,
            [(only, s)] => Some((only.route.clone(), *s)),
            [(top, top_score), (_, second_score), ..] => {
                if (top_score - second_score) >= plan.min_gap {
                    Some((top.route.clone(), *top_score))
                } else {
                    None
                }
            }
        };

        let outcome = match decision {
            Some((route, s)) => {
                let via = if ai_selected.as_deref() == Some(route.as_str()) { MatchSource::AiFallback } else { MatchSource::Hybrid };
                RouteOutcome::Matched { route, score: s, via }
            }
            None => {
                let hints: Vec<String> = scored.iter().take(2).map(|(c, _)| c.route.clone()).collect();
                RouteOutcome::NeedsClarification { candidates: hints }
            }
        };

        if let RouteOutcome::Matched { route, score: s, .. } = &outcome {
            self.dataset.append(dataset::DatasetRow {
                chat_id,
                text: text.to_string(),
                chosen_route: route.clone(),
                score: *s,
                router_version: plan.version.id.clone(),
                was_correct: None,
                recorded_at_ms: now_ms,
                shadow: false,
            });
        }

        // Shadow-mode parallel recording (spec §4.E.7): a sampled fraction
        // of requests not already served by the canary get an independent
        // decision under the canary's own alpha/gap, recorded alongside the
        // live decision without influencing it. Skipped when no canary is
        // configured, since shadow has no knobs of its own to run with.
        if !plan.via_canary && resolve_variant(chat_id, self.config.shadow_sample_percent) {
            if let Some(shadow_version) = self.canary.read().unwrap().clone() {
                let shadow_candidates =
                    build_candidates(text, &narrowed.candidates, &shadow_version, Some(shadow_version.hybrid_alpha), &HashMap::new());
                if let Some((route, s)) = simple_decision(&shadow_candidates, &shadow_version, shadow_version.min_score_gap, 0.0) {
                    self.dataset.append(dataset::DatasetRow {
                        chat_id,
                        text: text.to_string(),
                        chosen_route: route,
                        score: s,
                        router_version: shadow_version.id.clone(),
                        was_correct: None,
                        recorded_at_ms: now_ms,
                        shadow: true,
                    });
                }
            }
        }

        outcome
    }

    pub fn observe_outcome(&self, route: &str, score: f64, was_correct: bool) {
        self.calibration.write().unwrap().observe(route, score, was_correct);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SemanticRouteConfig;

    fn version() -> RouterVersion {
        let gmail = SemanticRouteConfig {
            name: "gmail".into(),
            threshold: 0.3,
            utterances: vec!["enviar correo a alguien".into(), "mandar un email".into()],
            negative_utterances: vec![],
        };
        let web = SemanticRouteConfig {
            name: "web".into(),
            threshold: 0.3,
            utterances: vec!["buscar en internet noticias".into()],
            negative_utterances: vec![],
        };
        RouterVersion {
            id: "v1".into(),
            label: "stable".into(),
            routes: [("gmail".to_string(), gmail), ("web".to_string(), web)].into_iter().collect(),
            hybrid_alpha: 0.5,
            min_score_gap: 0.05,
        }
    }

    fn config() -> IntentRouterConfig {
        IntentRouterConfig {
            per_route_alpha: HashMap::new(),
            min_score_gap: 0.05,
            ab_split_percent: 0,
            ab_variant_b_alpha: None,
            ab_variant_b_min_gap: None,
            ab_variant_b_threshold_shift: 0.0,
            canary_split_percent: 0,
            shadow_sample_percent: 0,
        }
    }

    fn router() -> IntentRouter {
        IntentRouter::new(version(), config())
    }

    #[test]
    fn test_resolve_variant_is_deterministic_per_chat() {
        let a = resolve_variant(42, 30);
        let b = resolve_variant(42, 30);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_clear_match_routes_without_ai_fallback() {
        let r = router();
        let ctx = RoutingContext::default();
        let outcome = r.route("enviar correo a alguien", 1, &ctx, None, 1000).await;
        assert!(matches!(outcome, RouteOutcome::Matched { route, .. } if route == "gmail"));
    }

    #[tokio::test]
    async fn test_ambiguous_text_needs_clarification_without_fallback() {
        let r = router();
        let ctx = RoutingContext::default();
        let outcome = r.route("hmm", 1, &ctx, None, 1000).await;
        assert!(matches!(outcome, RouteOutcome::NeedsClarification { .. }));
    }

    struct AlwaysGmail;
    #[async_trait::async_trait]
    impl AiRouteFallback for AlwaysGmail {
        async fn classify(&self, _text: &str, candidates: &[String]) -> Option<String> {
            candidates.iter().find(|c| *c == "gmail").cloned()
        }
    }

    #[tokio::test]
    async fn test_ai_fallback_used_when_hybrid_unclear() {
        let r = router();
        let ctx = RoutingContext::default();
        let fallback = AlwaysGmail;
        let outcome = r.route("algo ambiguo relacionado", 1, &ctx, Some(&fallback), 1000).await;
        assert!(matches!(outcome, RouteOutcome::Matched { via: MatchSource::AiFallback, .. } | RouteOutcome::NeedsClarification { .. }));
    }

    #[tokio::test]
    async fn test_variant_b_alpha_and_gap_are_applied() {
        let mut cfg = config();
        cfg.ab_split_percent = 100;
        cfg.ab_variant_b_alpha = Some(1.0);
        cfg.ab_variant_b_min_gap = Some(0.0);
        let r = IntentRouter::new(version(), cfg);
        let ctx = RoutingContext::default();
        let outcome = r.route("enviar correo a alguien", 1, &ctx, None, 1000).await;
        assert!(matches!(outcome, RouteOutcome::Matched { route, .. } if route == "gmail"));
    }

    #[tokio::test]
    async fn test_canary_fully_replaces_live_routes() {
        let cfg = IntentRouterConfig { canary_split_percent: 100, ..config() };
        let r = IntentRouter::new(version(), cfg);
        let canary_gmail = SemanticRouteConfig {
            name: "gmail".into(),
            threshold: 0.99,
            utterances: vec!["enviar correo a alguien".into()],
            negative_utterances: vec![],
        };
        let canary = RouterVersion {
            id: "canary-1".into(),
            label: "canary".into(),
            routes: [("gmail".to_string(), canary_gmail)].into_iter().collect(),
            hybrid_alpha: 0.5,
            min_score_gap: 0.05,
        };
        r.set_canary(Some(canary));

        let ctx = RoutingContext::default();
        let outcome = r.route("enviar correo a alguien", 1, &ctx, None, 1000).await;
        // threshold 0.99 under the canary snapshot is unreachable by hybrid score alone.
        assert!(matches!(outcome, RouteOutcome::NeedsClarification { .. }));

        let rows = r.dataset().snapshot();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_shadow_mode_records_without_changing_served_decision() {
        let cfg = IntentRouterConfig { shadow_sample_percent: 100, ..config() };
        let r = IntentRouter::new(version(), cfg);
        let shadow_gmail = SemanticRouteConfig {
            name: "gmail".into(),
            threshold: 0.0,
            utterances: vec!["enviar correo a alguien".into()],
            negative_utterances: vec![],
        };
        let shadow_version = RouterVersion {
            id: "shadow-1".into(),
            label: "shadow".into(),
            routes: [("gmail".to_string(), shadow_gmail)].into_iter().collect(),
            hybrid_alpha: 0.5,
            min_score_gap: 0.0,
        };
        r.set_canary(Some(shadow_version));

        let ctx = RoutingContext::default();
        let outcome = r.route("enviar correo a alguien", 1, &ctx, None, 1000).await;
        assert!(matches!(outcome, RouteOutcome::Matched { route, .. } if route == "gmail"));

        let rows = r.dataset().snapshot();
        assert!(rows.iter().any(|row| row.shadow));
        assert!(rows.iter().any(|row| !row.shadow));
    }

    #[test]
    fn test_add_negative_utterance_caps_per_route() {
        let r = router();
        for i in 0..5 {
            r.add_negative_utterance("gmail", &format!("negativo {i}"), 3);
        }
        assert_eq!(r.route_negative_utterances("gmail").len(), 3);
        assert_eq!(r.route_negative_utterances("gmail")[0], "negativo 2");
    }
}
