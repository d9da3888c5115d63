//! Weighted rerank blend across retrieval channels.

use std::collections::HashSet;

use super::{tokenize_keywords, QueryUnderstanding, RetrievalCandidate};

const W_SEMANTIC: f64 = 0.40;
const W_ENTITY_OVERLAP: f64 = 0.30;
const W_NARRATIVE_FIT: f64 = 0.20;
const W_RECENCY: f64 = 0.10;

/// Blends semantic, entity, narrative, and session signals into the final
/// rank.
#[derive(Debug, Default)]
pub struct Reranker;

impl Reranker {
    pub fn new() -> Self {
        Self
    }

    /// Score and sort candidates, highest `final_score` first.
    pub fn rank(
        &self,
        mut candidates: Vec<RetrievalCandidate>,
        query: &QueryUnderstanding,
        session_entities: &[String],
    ) -> Vec<RetrievalCandidate> {
        let entity_set: HashSet<&str> = query.entities.iter().map(String::as_str).collect();
        let keywords: Vec<String> = if query.event_keywords.is_empty() {
            tokenize_keywords(&query.normalized_query)
        } else {
            query.event_keywords.clone()
        };
        let session_set: HashSet<&str> = session_entities.iter().map(String::as_str).collect();

        for candidate in &mut candidates {
            candidate.entity_overlap = entity_overlap(candidate, &entity_set);
            candidate.narrative_fit = narrative_fit(candidate, &keywords);
            candidate.recency_in_session = recency_fit(candidate, &session_set);

            candidate.final_score = candidate.semantic_score * W_SEMANTIC
                + candidate.entity_overlap * W_ENTITY_OVERLAP
                + candidate.narrative_fit * W_NARRATIVE_FIT
                + candidate.recency_in_session * W_RECENCY;
        }

        candidates.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}

/// |candidate entities ∩ query entities| / max(|query entities|, 1), where
/// candidate entities are its characters plus the location when set.
fn entity_overlap(candidate: &RetrievalCandidate, entities: &HashSet<&str>) -> f64 {
    if entities.is_empty() {
        return 0.0;
    }
    let mut fields: HashSet<&str> = candidate.characters.iter().map(String::as_str).collect();
    if !candidate.location.is_empty() {
        fields.insert(candidate.location.as_str());
    }
    let matched = fields.intersection(entities).count();
    matched as f64 / entities.len().max(1) as f64
}

/// Fraction of query keywords appearing as substrings of the candidate's
/// summaries and text.
fn narrative_fit(candidate: &RetrievalCandidate, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack = format!(
        "{} {} {}",
        candidate.scene_summary, candidate.event_summary, candidate.text
    );
    if haystack.trim().is_empty() {
        return 0.0;
    }
    let matched = keywords
        .iter()
        .filter(|k| !k.is_empty() && haystack.contains(k.as_str()))
        .count();
    matched as f64 / keywords.len().max(1) as f64
}

/// |candidate characters ∩ session recent entities| / max(|session|, 1).
fn recency_fit(candidate: &RetrievalCandidate, session_entities: &HashSet<&str>) -> f64 {
    if session_entities.is_empty() || candidate.characters.is_empty() {
        return 0.0;
    }
    let candidate_set: HashSet<&str> = candidate.characters.iter().map(String::as_str).collect();
    let overlap = candidate_set.intersection(session_entities).count();
    overlap as f64 / session_entities.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rp::{Intent, QueryConstraints, SourceType};

    fn scene(id: &str, characters: Vec<&str>, text: &str, semantic: f64) -> RetrievalCandidate {
        RetrievalCandidate {
            source_type: SourceType::Scene,
            source_id: id.to_string(),
            text: text.to_string(),
            chapter: Some("chapter_0001".to_string()),
            chapter_no: Some(1),
            scene_index: Some(0),
            chapter_title: String::new(),
            scene_summary: String::new(),
            event_summary: String::new(),
            characters: characters.into_iter().map(str::to_string).collect(),
            location: String::new(),
            excerpt: String::new(),
            semantic_score: semantic,
            entity_overlap: 0.0,
            narrative_fit: 0.0,
            recency_in_session: 0.0,
            final_score: 0.0,
        }
    }

    fn query(entities: Vec<&str>, keywords: Vec<&str>) -> QueryUnderstanding {
        QueryUnderstanding {
            intent: Intent::StoryRecap,
            normalized_query: "查案".to_string(),
            entities: entities.into_iter().map(str::to_string).collect(),
            locations: Vec::new(),
            event_keywords: keywords.into_iter().map(str::to_string).collect(),
            constraints: QueryConstraints::default(),
        }
    }

    #[test]
    fn entity_overlap_outranks_raw_semantic() {
        let candidates = vec![
            scene("plain", vec!["路人"], "无关内容", 0.9),
            scene("hit", vec!["许七安"], "查案线索", 0.6),
        ];
        let query = query(vec!["许七安"], vec!["查案"]);

        let ranked = Reranker::new().rank(candidates, &query, &[]);
        assert_eq!(ranked[0].source_id, "hit");
        assert!(ranked[0].entity_overlap > 0.99);
        assert!(ranked[0].narrative_fit > 0.99);
        assert_eq!(ranked[1].entity_overlap, 0.0);
    }

    #[test]
    fn weights_compose_the_final_score() {
        let candidates = vec![scene("a", vec!["许七安"], "查案", 0.5)];
        let query = query(vec!["许七安"], vec!["查案"]);
        let session = vec!["许七安".to_string()];

        let ranked = Reranker::new().rank(candidates, &query, &session);
        let expected = 0.5 * W_SEMANTIC + 1.0 * W_ENTITY_OVERLAP + 1.0 * W_NARRATIVE_FIT + 1.0 * W_RECENCY;
        assert!((ranked[0].final_score - expected).abs() < 1e-9);
    }

    #[test]
    fn ranking_is_a_permutation() {
        let candidates: Vec<RetrievalCandidate> = (0..20)
            .map(|i| scene(&format!("c{i}"), vec![], "文本", i as f64 / 20.0))
            .collect();
        let ids: std::collections::HashSet<String> =
            candidates.iter().map(|c| c.source_id.clone()).collect();

        let ranked = Reranker::new().rank(candidates, &query(vec![], vec![]), &[]);
        assert_eq!(ranked.len(), 20);
        let ranked_ids: std::collections::HashSet<String> =
            ranked.iter().map(|c| c.source_id.clone()).collect();
        assert_eq!(ids, ranked_ids);
        // Descending by final score.
        for pair in ranked.windows(2) {
            assert!(pair[0].final_score >= pair[1].final_score);
        }
    }

    #[test]
    fn empty_keyword_query_falls_back_to_normalized_query() {
        let candidates = vec![scene("a", vec![], "查案记录", 0.1)];
        let query = query(vec![], vec![]);
        let ranked = Reranker::new().rank(candidates, &query, &[]);
        // normalized_query "查案" tokenizes and matches the text.
        assert!(ranked[0].narrative_fit > 0.99);
    }
}
