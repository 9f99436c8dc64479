//! C9 step 2: scores a query for how much reasoning effort it is likely to
//! need, so the Conversation Manager can pick a [`ThinkingLevel`] hint
//! without a POS tagger. Reuses [`orakle_core::lexicon`] for tokenization,
//! same rationale as the substantive-query gate — a fixed word list instead
//! of an NLP dependency.

use orakle_core::lexicon::tokenize;

use crate::thinking::ThinkingLevel;

const REASONING_VERBS: &[&str] = &[
    "explain", "analyze", "analyse", "justify", "prove", "reason", "deduce", "conclude", "infer",
    "argue", "compare", "evaluate", "assess", "determine", "calculate", "derive",
];

const EXPLANATORY_INTERROGATIVES: &[&str] = &["why", "how"];

const HYPOTHETICAL_PHRASES: &[&str] = &[
    "what if", "suppose that", "imagine if", "if i were", "had i", "were i to", "what would happen if",
];

const COMPARATIVE_SUPERLATIVE_WORDS: &[&str] = &[
    "better", "best", "worse", "worst", "more", "most", "less", "least",
];

fn is_comparative_or_superlative(token: &str) -> bool {
    COMPARATIVE_SUPERLATIVE_WORDS.contains(&token) || token.ends_with("er") || token.ends_with("est")
}

/// Raw reasoning score in `[0, max_level]`. Queries of 3 tokens or fewer
/// always score 0 (too short to carry a reasoning signal).
pub fn reasoning_score(query: &str, max_level: f32) -> f32 {
    let tokens = tokenize(query);
    if tokens.len() <= 3 {
        return 0.0;
    }

    let lower = query.to_lowercase();
    let mut score = 0.0f32;

    // "root" is approximated as the first three tokens — no parser, so a
    // reasoning verb early in the sentence stands in for "is the main verb".
    let root_window = &tokens[..tokens.len().min(3)];
    if root_window.iter().any(|t| REASONING_VERBS.contains(&t.as_str())) {
        score += 1.0;
    } else if tokens.iter().any(|t| REASONING_VERBS.contains(&t.as_str())) {
        score += 0.2;
    }

    if let Some(first) = tokens.first() {
        if EXPLANATORY_INTERROGATIVES.contains(&first.as_str()) {
            score += 0.4;
        }
    }

    if HYPOTHETICAL_PHRASES.iter().any(|p| lower.contains(p)) {
        score += 1.0;
    }

    if tokens.iter().any(|t| is_comparative_or_superlative(t)) {
        score += 0.15;
    }

    score.min(1.0) * max_level
}

/// Maps a reasoning score onto a discrete [`ThinkingLevel`] budget.
pub fn level_for_score(score: f32) -> ThinkingLevel {
    if score <= 0.0 {
        ThinkingLevel::Off
    } else if score < 0.2 {
        ThinkingLevel::Minimal
    } else if score < 0.4 {
        ThinkingLevel::Low
    } else if score < 0.6 {
        ThinkingLevel::Medium
    } else if score < 0.8 {
        ThinkingLevel::High
    } else {
        ThinkingLevel::XHigh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_queries_score_zero() {
        assert_eq!(reasoning_score("why is that", 0.6), 0.0);
    }

    #[test]
    fn root_reasoning_verb_dominates_the_score() {
        let score = reasoning_score("explain how photosynthesis actually works", 0.6);
        assert!(score > 0.5, "expected a high score, got {score}");
    }

    #[test]
    fn explanatory_interrogative_adds_a_smaller_bump() {
        let score = reasoning_score("why does the sky appear blue today", 0.6);
        assert!(score > 0.0 && score <= 0.6);
    }

    #[test]
    fn hypothetical_phrase_is_detected() {
        let score = reasoning_score("what if the server crashes during a deploy", 0.6);
        assert!(score > 0.0);
    }

    #[test]
    fn plain_factual_query_scores_zero() {
        assert_eq!(reasoning_score("what is the capital of France", 0.6), 0.0);
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(level_for_score(0.0), ThinkingLevel::Off);
        assert_eq!(level_for_score(0.1), ThinkingLevel::Minimal);
        assert_eq!(level_for_score(0.3), ThinkingLevel::Low);
        assert_eq!(level_for_score(0.5), ThinkingLevel::Medium);
        assert_eq!(level_for_score(0.7), ThinkingLevel::High);
        assert_eq!(level_for_score(0.9), ThinkingLevel::XHigh);
    }
}
