//! Lexical and semantic scoring (spec §4.E.2).

use std::collections::{HashMap, HashSet};

use crate::model::SemanticRouteConfig;

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Best per-utterance token-Jaccard + prefix match, minus negative-utterance
/// penalty, clamped to `[0, 1]`.
pub fn lexical_score(text: &str, route: &SemanticRouteConfig) -> f64 {
    let text_tokens = tokenize(text);
    let lowered = text.to_lowercase();

    let best_positive = route
        .utterances
        .iter()
        .map(|u| {
            let u_tokens = tokenize(u);
            let jac = jaccard(&text_tokens, &u_tokens);
            let prefix_bonus = if lowered.starts_with(&u.to_lowercase()) { 0.1 } else { 0.0 };
            (jac + prefix_bonus).min(1.0)
        })
        .fold(0.0_f64, f64::max);

    let negative_penalty = route
        .negative_utterances
        .iter()
        .map(|u| jaccard(&text_tokens, &tokenize(u)))
        .fold(0.0_f64, f64::max);

    (best_positive - negative_penalty).clamp(0.0, 1.0)
}

/// Character-trigram bag, used as a lightweight stand-in for the "richer
/// embeddings" spec.md explicitly allows — the contract is scale-invariant
/// cosine in `[0,1]`, not a specific embedding model.
fn char_ngrams(text: &str, n: usize) -> HashMap<String, f64> {
    let normalized: String = text.to_lowercase().chars().filter(|c| c.is_alphanumeric() || c.is_whitespace()).collect();
    let chars: Vec<char> = normalized.chars().collect();
    let mut counts: HashMap<String, f64> = HashMap::new();
    if chars.len() < n {
        if !chars.is_empty() {
            *counts.entry(normalized.clone()).or_insert(0.0) += 1.0;
        }
        return counts;
    }
    for window in chars.windows(n) {
        let gram: String = window.iter().collect();
        *counts.entry(gram).or_insert(0.0) += 1.0;
    }
    counts
}

fn cosine(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let mut dot = 0.0;
    for (k, va) in a {
        if let Some(vb) = b.get(k) {
            dot += va * vb;
        }
    }
    let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Cosine similarity over character-trigram vectors of the input against
/// each utterance, max-pooled, minus a malus for negative-utterance
/// matches.
pub fn semantic_score(text: &str, route: &SemanticRouteConfig) -> f64 {
    let text_grams = char_ngrams(text, 3);

    let best_positive = route
        .utterances
        .iter()
        .map(|u| cosine(&text_grams, &char_ngrams(u, 3)))
        .fold(0.0_f64, f64::max);

    let negative_malus = route
        .negative_utterances
        .iter()
        .map(|u| cosine(&text_grams, &char_ngrams(u, 3)))
        .fold(0.0_f64, f64::max)
        * 0.5;

    (best_positive - negative_malus).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, utterances: &[&str], negatives: &[&str]) -> SemanticRouteConfig {
        SemanticRouteConfig {
            name: name.into(),
            threshold: 0.3,
            utterances: utterances.iter().map(|s| s.to_string()).collect(),
            negative_utterances: negatives.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_lexical_identical_text_scores_high() {
        let r = route("gmail", &["enviar correo a alguien"], &[]);
        assert!(lexical_score("enviar correo a alguien", &r) > 0.9);
    }

    #[test]
    fn test_lexical_unrelated_text_scores_low() {
        let r = route("gmail", &["enviar correo a alguien"], &[]);
        assert!(lexical_score("elimina el archivo", &r) < 0.3);
    }

    #[test]
    fn test_semantic_score_in_bounds() {
        let r = route("web", &["buscar en internet noticias"], &[]);
        let s = semantic_score("busca noticias en internet", &r);
        assert!((0.0..=1.0).contains(&s));
        assert!(s > 0.2);
    }

    #[test]
    fn test_negative_utterance_reduces_score() {
        let with_negative = route("gmail", &["enviar correo"], &["enviar correo de prueba"]);
        let without_negative = route("gmail", &["enviar correo"], &[]);
        let a = lexical_score("enviar correo de prueba", &with_negative);
        let b = lexical_score("enviar correo de prueba", &without_negative);
        assert!(a <= b);
    }
}
