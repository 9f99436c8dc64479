/// Shared lexical helpers for the substantive-query gate (§4.4 step 1) and
/// the reasoning heuristic (§4.5 step 2). The original relies on spaCy
/// part-of-speech tagging for both; this reimplementation uses a fixed
/// closed-class function-word list plus simple tokenization instead of
/// pulling in an NLP dependency.
const FUNCTION_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "for", "of", "at", "by", "to",
    "in", "on", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "can", "may", "might", "must", "shall",
    "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those", "with", "from", "as", "so",
    "not", "no", "what", "who", "when", "where", "why", "how",
];

pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|tok| !tok.is_empty())
        .collect()
}

pub fn is_function_word(token: &str) -> bool {
    FUNCTION_WORDS.contains(&token)
}

/// Gate used before contextual memory retrieval (§4.4 step 1, §8 boundary
/// behaviors): a query is substantive if it has more than 3 tokens and at
/// least one content token of length ≥ 3 that is not a function word.
pub fn is_substantive_query(query: &str) -> bool {
    let tokens = tokenize(query);
    if tokens.len() <= 3 {
        return false;
    }
    tokens.iter().any(|t| t.len() >= 3 && !is_function_word(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_queries_are_not_substantive() {
        assert!(!is_substantive_query("hi there"));
        assert!(!is_substantive_query("ok thanks bye"));
    }

    #[test]
    fn substantive_query_needs_a_content_word() {
        assert!(is_substantive_query("what is the weather in Paris"));
        assert!(!is_substantive_query("what is it to be or"));
    }
}
