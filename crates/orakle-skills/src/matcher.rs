use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use orakle_memory::vector::Embedder;

use crate::descriptor::SkillDescriptor;
use crate::error::SkillsError;

struct RegisteredSkill {
    embedding: Vec<f32>,
    descriptor: SkillDescriptor,
    usage_count: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct SkillMatch {
    pub skill_id: String,
    pub score: f32,
}

/// C2: embeds skill descriptions and ranks them against a query by cosine
/// similarity (§4.1).
pub struct SemanticMatcher {
    registry: DashMap<String, RegisteredSkill>,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
    top_k: usize,
}

impl SemanticMatcher {
    pub fn new(embedder: Arc<dyn Embedder>, threshold: f32, top_k: usize) -> Self {
        Self {
            registry: DashMap::new(),
            embedder,
            threshold,
            top_k,
        }
    }

    /// Registers or replaces a skill's embedding. The embedding input is
    /// built by concatenating, in order: the domain path repeated twice,
    /// every `**boost keyword**` found in the description repeated six
    /// times, the description with the boost markers stripped, and the
    /// matcher_info keywords (§4.1, §9).
    pub fn register(&self, descriptor: SkillDescriptor) -> Result<(), SkillsError> {
        let (cleaned_description, boost_keywords) = extract_boost_keywords(&descriptor.description);
        let embedding_input = build_embedding_input(&descriptor, &cleaned_description, &boost_keywords);
        let embedding = self.embedder.embed(&embedding_input)?;

        self.registry.insert(
            descriptor.name.clone(),
            RegisteredSkill {
                embedding,
                descriptor,
                usage_count: AtomicU64::new(0),
            },
        );
        Ok(())
    }

    pub fn unregister(&self, skill_id: &str) {
        self.registry.remove(skill_id);
    }

    pub fn record_usage(&self, skill_id: &str) {
        if let Some(entry) = self.registry.get(skill_id) {
            entry.usage_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Looks up a registered skill's descriptor, e.g. to branch on
    /// `SkillType::Ui` after a selection call returns a `skill_id`.
    pub fn descriptor(&self, skill_id: &str) -> Option<SkillDescriptor> {
        self.registry.get(skill_id).map(|entry| entry.descriptor.clone())
    }

    /// Embeds `query` once and ranks every registered skill by
    /// `cosine_similarity * embeddings_boost_factor`, keeping results at or
    /// above `threshold`, breaking ties by usage count (§4.1).
    pub fn match_query(&self, query: &str) -> Result<Vec<SkillMatch>, SkillsError> {
        let query_embedding = self.embedder.embed(query)?;

        let mut scored: Vec<(SkillMatch, u64)> = self
            .registry
            .iter()
            .filter_map(|entry| {
                let skill = entry.value();
                let similarity = cosine_similarity(&query_embedding, &skill.embedding);
                let score = similarity * skill.descriptor.embeddings_boost_factor;
                if score < self.threshold {
                    return None;
                }
                Some((
                    SkillMatch {
                        skill_id: entry.key().clone(),
                        score,
                    },
                    skill.usage_count.load(Ordering::Relaxed),
                ))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.score
                .partial_cmp(&a.0.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });
        scored.truncate(self.top_k);
        Ok(scored.into_iter().map(|(m, _)| m).collect())
    }
}

fn extract_boost_keywords(description: &str) -> (String, Vec<String>) {
    let mut cleaned = String::with_capacity(description.len());
    let mut keywords = Vec::new();
    let mut rest = description;

    while let Some(start) = rest.find("**") {
        cleaned.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("**") {
            Some(end) => {
                let keyword = &after[..end];
                keywords.push(keyword.to_string());
                cleaned.push_str(keyword);
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated marker — treat the rest as plain text.
                cleaned.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    cleaned.push_str(rest);

    (cleaned, keywords)
}

fn build_embedding_input(descriptor: &SkillDescriptor, cleaned_description: &str, boost_keywords: &[String]) -> String {
    let mut parts = Vec::new();

    if let Some(domain_path) = &descriptor.matcher_info.domain_path {
        parts.push(domain_path.clone());
        parts.push(domain_path.clone());
    }

    for keyword in boost_keywords {
        for _ in 0..6 {
            parts.push(keyword.clone());
        }
    }

    parts.push(cleaned_description.to_string());

    if !descriptor.matcher_info.keywords.is_empty() {
        parts.push(descriptor.matcher_info.keywords.join(" "));
    }

    parts.join(" ")
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use orakle_protocol::skill_wire::MatcherInfo;

    struct FakeEmbedder;

    impl Embedder for FakeEmbedder {
        fn embed(&self, text: &str) -> Result<Vec<f32>, orakle_memory::error::MemoryError> {
            const DIM: usize = 16;
            let mut v = vec![0.0f32; DIM];
            for word in text.split_whitespace() {
                let mut hash: u64 = 1469598103934665603;
                for b in word.bytes() {
                    hash ^= b as u64;
                    hash = hash.wrapping_mul(1099511628211);
                }
                v[(hash as usize) % DIM] += 1.0;
            }
            Ok(v)
        }
    }

    fn weather_descriptor() -> SkillDescriptor {
        SkillDescriptor {
            name: "weather".to_string(),
            description: "Checks the **current weather** for a city".to_string(),
            matcher_info: MatcherInfo {
                keywords: vec!["forecast".to_string()],
                domain_path: Some("travel/weather".to_string()),
            },
            parameters: Vec::new(),
            skill_type: crate::descriptor::SkillType::Regular,
            ui: None,
            embeddings_boost_factor: 1.0,
        }
    }

    #[test]
    fn extract_boost_keywords_strips_markers_and_collects_keywords() {
        let (cleaned, keywords) = extract_boost_keywords("Checks the **current weather** for a city");
        assert_eq!(cleaned, "Checks the current weather for a city");
        assert_eq!(keywords, vec!["current weather".to_string()]);
    }

    #[test]
    fn registered_skill_matches_a_related_query_above_threshold() {
        let matcher = SemanticMatcher::new(Arc::new(FakeEmbedder), 0.05, 5);
        matcher.register(weather_descriptor()).unwrap();

        let results = matcher.match_query("what is the current weather forecast").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].skill_id, "weather");
    }

    #[test]
    fn unrelated_query_below_threshold_returns_nothing() {
        let matcher = SemanticMatcher::new(Arc::new(FakeEmbedder), 0.9, 5);
        matcher.register(weather_descriptor()).unwrap();

        let results = matcher.match_query("recommend me a good book").unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn usage_count_breaks_ties_between_equal_scores() {
        let matcher = SemanticMatcher::new(Arc::new(FakeEmbedder), -1.0, 5);
        matcher.register(weather_descriptor()).unwrap();
        let mut other = weather_descriptor();
        other.name = "weather2".to_string();
        matcher.register(other).unwrap();

        matcher.record_usage("weather2");
        let results = matcher.match_query("current weather forecast").unwrap();
        assert_eq!(results[0].skill_id, "weather2");
    }
}
