//! RouteNarrowing (spec §4.F): ContextFilter, RouteLayers, Hierarchy.

use std::collections::HashSet;

use crate::model::{IndexedListContext, IndexedListKind, ROUTE_DOMAINS};

/// Context flags consulted by narrowing stages, assembled by the caller
/// from chat session + store state before routing begins.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    pub pending_workspace_delete: bool,
    pub indexed_list: Option<IndexedListContext>,
    pub recent_gmail_list: bool,
    pub recent_connector_context: bool,
    pub memory_recall_cue: bool,
    pub conversational_only_mode: bool,
}

#[derive(Debug, Clone)]
pub struct NarrowResult {
    pub candidates: HashSet<String>,
    pub strict: bool,
    pub exhausted: bool,
}

impl NarrowResult {
    fn all() -> Self {
        Self { candidates: ROUTE_DOMAINS.iter().map(|s| s.to_string()).collect(), strict: false, exhausted: false }
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
}

fn indexed_list_handlers(kind: IndexedListKind) -> HashSet<String> {
    match kind {
        IndexedListKind::WorkspaceList => ["workspace"].into_iter().map(String::from).collect(),
        IndexedListKind::StoredFiles => ["document", "workspace"].into_iter().map(String::from).collect(),
        IndexedListKind::WebResults => ["web"].into_iter().map(String::from).collect(),
        IndexedListKind::GmailList => ["gmail", "gmail-recipients"].into_iter().map(String::from).collect(),
    }
}

fn has_ordinal_reference(normalized: &str) -> bool {
    normalized.split_whitespace().any(|w| w.parse::<u32>().is_ok())
        || normalized.contains("abrí el")
        || normalized.contains("abri el")
}

/// §4.E.1 step 1 / §4.F ContextFilter.
pub fn context_filter(text: &str, ctx: &RoutingContext) -> NarrowResult {
    let normalized = normalize(text);
    let is_yes_no = ["si", "sí", "no", "yes", "cancel", "cancelar"].contains(&normalized.trim());

    if ctx.pending_workspace_delete && is_yes_no {
        return strict_set(["workspace"]);
    }

    if let Some(ctx_list) = &ctx.indexed_list {
        if has_ordinal_reference(&normalized) {
            return NarrowResult { candidates: indexed_list_handlers(ctx_list.kind), strict: true, exhausted: false };
        }
    }

    if ["ese", "esa", "lo"].iter().any(|p| normalized.split_whitespace().any(|w| w == *p)) && ctx.recent_gmail_list {
        return NarrowResult {
            candidates: ["gmail", "gmail-recipients"].into_iter().map(String::from).collect(),
            strict: false,
            exhausted: false,
        };
    }

    if normalized.contains("/lim") && ctx.recent_connector_context {
        return strict_set(["connector"]);
    }

    let mut result = NarrowResult::all();
    if ["gmail", "correo", "email"].iter().any(|p| normalized.contains(p)) {
        result.candidates = ["gmail", "gmail-recipients"].into_iter().map(String::from).collect();
    } else if ["workspace", "archivo", "carpeta"].iter().any(|p| normalized.contains(p)) {
        result.candidates = ["workspace"].into_iter().map(String::from).collect();
    } else if ["web", "internet", "busca"].iter().any(|p| normalized.contains(p)) {
        result.candidates = ["web"].into_iter().map(String::from).collect();
    } else if !ctx.memory_recall_cue
        && ["correo", "gmail", "mail"].iter().any(|p| normalized.contains(p))
    {
        result.candidates = ["gmail", "gmail-recipients"].into_iter().map(String::from).collect();
    }
    result
}

/// §4.E.1 step 2 / §4.F RouteLayers.
pub fn route_layers(text: &str, prior: NarrowResult, ctx: &RoutingContext) -> NarrowResult {
    let normalized = normalize(text);

    if normalized.contains("tsk-") || normalized.contains("tsk_") {
        return strict_set(["schedule"]);
    }

    if ["programa correo", "agenda correo", "programar correo"].iter().any(|p| normalized.contains(p)) {
        return NarrowResult {
            candidates: ["schedule", "gmail", "gmail-recipients"].into_iter().map(String::from).collect(),
            strict: false,
            exhausted: false,
        };
    }

    if ctx.conversational_only_mode {
        let mut filtered = prior.candidates;
        filtered.remove("workspace");
        filtered.remove("web");
        return NarrowResult { candidates: filtered, strict: prior.strict, exhausted: prior.exhausted };
    }

    prior
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseDomain {
    Communication,
    Files,
    Knowledge,
    PlanningMemory,
    Operations,
    Social,
}

fn handlers_for_domain(domain: CoarseDomain) -> HashSet<String> {
    match domain {
        CoarseDomain::Communication => ["gmail", "gmail-recipients"].into_iter().map(String::from).collect(),
        CoarseDomain::Files => ["workspace", "document"].into_iter().map(String::from).collect(),
        CoarseDomain::Knowledge => ["web"].into_iter().map(String::from).collect(),
        CoarseDomain::PlanningMemory => ["schedule", "memory"].into_iter().map(String::from).collect(),
        CoarseDomain::Operations => ["connector", "self-maintenance", "ai-shell"].into_iter().map(String::from).collect(),
        CoarseDomain::Social => ["stoic-smalltalk"].into_iter().map(String::from).collect(),
    }
}

/// Inverse of [`handlers_for_domain`]: which coarse domain a route belongs
/// to, used by the ensemble's contextual-boost term to know which of the
/// hierarchy's per-domain bumps apply to a given candidate.
fn domain_of_route(route: &str) -> Option<CoarseDomain> {
    [
        CoarseDomain::Communication,
        CoarseDomain::Files,
        CoarseDomain::Knowledge,
        CoarseDomain::PlanningMemory,
        CoarseDomain::Operations,
        CoarseDomain::Social,
    ]
    .into_iter()
    .find(|d| handlers_for_domain(*d).contains(route))
}

/// The same contextual bumps [`hierarchy`] applies to coarse domains,
/// looked up for one candidate route (spec §4.E.4's `contextualBoosts[r]`
/// ensemble term). Capped at `1.0` since the ensemble formula weights it by
/// `0.9`.
pub(crate) fn contextual_boost(route: &str, ctx: &RoutingContext, normalized: &str) -> f64 {
    let Some(domain) = domain_of_route(route) else {
        return 0.0;
    };

    let mut boost: f64 = 0.0;
    if ctx.pending_workspace_delete && domain == CoarseDomain::Files {
        boost += 0.45;
    }
    if let Some(list) = &ctx.indexed_list {
        if domain == coarse_domain_of_kind(list.kind) {
            boost += 0.30;
        }
    }
    if ctx.recent_connector_context && domain == CoarseDomain::Operations && has_operational_verb(normalized) {
        boost += 0.35;
    }
    boost.min(1.0)
}

/// §4.E.1 step 3 / §4.F Hierarchy — a weighted sum over six coarse domains.
pub fn hierarchy(text: &str, prior: NarrowResult, ctx: &RoutingContext) -> NarrowResult {
    if prior.strict {
        return prior;
    }

    let normalized = normalize(text);
    let mut scores: [(CoarseDomain, f64); 6] = [
        (CoarseDomain::Communication, 0.0),
        (CoarseDomain::Files, 0.0),
        (CoarseDomain::Knowledge, 0.0),
        (CoarseDomain::PlanningMemory, 0.0),
        (CoarseDomain::Operations, 0.0),
        (CoarseDomain::Social, 0.0),
    ];

    for (domain, score) in scores.iter_mut() {
        *score += lexical_domain_weight(*domain, &normalized);
    }

    if ctx.pending_workspace_delete {
        bump(&mut scores, CoarseDomain::Files, 0.45);
    }
    if let Some(list) = &ctx.indexed_list {
        let domain = coarse_domain_of_kind(list.kind);
        bump(&mut scores, domain, 0.30);
    }
    if ctx.recent_connector_context && has_operational_verb(&normalized) {
        bump(&mut scores, CoarseDomain::Operations, 0.35);
    }

    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    let (top_domain, top_score) = scores[0];
    let (_, second_score) = scores[1];

    if top_score < 0.45 {
        // No domain confidently wins; fall through to the prior candidate set.
        return prior;
    }

    let mut expanded = handlers_for_domain(top_domain);
    if second_score >= top_score - 0.15 && second_score >= 0.45 {
        expanded.extend(handlers_for_domain(scores[1].0));
    }

    let intersected: HashSet<String> = prior.candidates.intersection(&expanded).cloned().collect();
    let candidates = if intersected.is_empty() { expanded } else { intersected };

    let strict = top_score >= 0.62 || ctx.pending_workspace_delete || ctx.indexed_list.is_some();
    let exhausted = candidates.is_empty();
    NarrowResult { candidates, strict, exhausted }
}

fn bump(scores: &mut [(CoarseDomain, f64); 6], domain: CoarseDomain, amount: f64) {
    for (d, s) in scores.iter_mut() {
        if *d == domain {
            *s += amount;
        }
    }
}

fn coarse_domain_of_kind(kind: IndexedListKind) -> CoarseDomain {
    match kind {
        IndexedListKind::WorkspaceList | IndexedListKind::StoredFiles => CoarseDomain::Files,
        IndexedListKind::WebResults => CoarseDomain::Knowledge,
        IndexedListKind::GmailList => CoarseDomain::Communication,
    }
}

fn has_operational_verb(normalized: &str) -> bool {
    ["ejecuta", "reinicia", "actualiza", "conecta", "corre"].iter().any(|v| normalized.contains(v))
}

fn lexical_domain_weight(domain: CoarseDomain, normalized: &str) -> f64 {
    let cues: &[&str] = match domain {
        CoarseDomain::Communication => &["correo", "gmail", "email", "mail"],
        CoarseDomain::Files => &["workspace", "archivo", "carpeta", "documento"],
        CoarseDomain::Knowledge => &["web", "internet", "busca", "buscar"],
        CoarseDomain::PlanningMemory => &["recuerda", "agenda", "programa", "recordatorio", "memoria", "tarea"],
        CoarseDomain::Operations => &["conector", "/lim", "reinicia", "actualiza", "ejecuta"],
        CoarseDomain::Social => &["hola", "cómo estás", "gracias", "chiste"],
    };
    let hits = cues.iter().filter(|c| normalized.contains(**c)).count() as f64;
    (hits * 0.35).min(0.8)
}

fn strict_set<const N: usize>(names: [&str; N]) -> NarrowResult {
    NarrowResult { candidates: names.into_iter().map(String::from).collect(), strict: true, exhausted: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_workspace_delete_yes_no_strict() {
        let ctx = RoutingContext { pending_workspace_delete: true, ..Default::default() };
        let result = context_filter("sí", &ctx);
        assert!(result.strict);
        assert_eq!(result.candidates, ["workspace"].into_iter().map(String::from).collect());
    }

    #[test]
    fn test_unrelated_yes_no_does_not_force_workspace() {
        let ctx = RoutingContext::default();
        let result = context_filter("sí", &ctx);
        assert!(!result.candidates.is_empty());
        // Without pending state, "sí" alone does not narrow strictly to workspace.
        assert!(!(result.strict && result.candidates.len() == 1 && result.candidates.contains("workspace")));
    }

    #[test]
    fn test_tsk_token_forces_schedule() {
        let ctx = RoutingContext::default();
        let prior = context_filter("eliminar tsk_mlz7y5a9-t7qltx", &ctx);
        let result = route_layers("eliminar tsk_mlz7y5a9-t7qltx", prior, &ctx);
        assert!(result.strict);
        assert_eq!(result.candidates, ["schedule"].into_iter().map(String::from).collect());
    }

    #[test]
    fn test_hierarchy_files_domain_on_delete() {
        let ctx = RoutingContext { pending_workspace_delete: true, ..Default::default() };
        let prior = NarrowResult { candidates: ROUTE_DOMAINS.iter().map(|s| s.to_string()).collect(), strict: false, exhausted: false };
        let result = hierarchy("eliminar workspace/notas.txt", prior, &ctx);
        assert!(result.candidates.contains("workspace"));
    }
}
