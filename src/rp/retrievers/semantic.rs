//! Semantic retrieval channel over the vector store.

use std::sync::Arc;

use super::candidate_from_point;
use crate::models::EmbeddingProvider;
use crate::rp::RetrievalCandidate;
use crate::types::Result;
use crate::vector::{MatchAnyFilter, VectorIndex};

/// Map a provider score into [0, 1]: `(s + 1) / 2` clamped, or the
/// identity when the provider already reports cosine similarity in [0, 1].
pub fn normalize_semantic_score(raw: f32) -> f64 {
    let raw = raw as f64;
    if raw < -1.0 {
        0.0
    } else if raw <= 1.0 {
        (raw + 1.0) / 2.0
    } else {
        raw.min(1.0)
    }
}

/// Embeds the query and searches top-K with an optional should-filter on
/// active characters and hinted locations.
pub struct SemanticRetriever {
    index: Arc<dyn VectorIndex>,
    embedding: Arc<dyn EmbeddingProvider>,
}

impl SemanticRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, embedding: Arc<dyn EmbeddingProvider>) -> Self {
        Self { index, embedding }
    }

    pub async fn query(
        &self,
        query_text: &str,
        top_k: usize,
        active_characters: &[String],
        location_hints: &[String],
        unlocked_chapter: Option<i64>,
    ) -> Result<Vec<RetrievalCandidate>> {
        if query_text.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.embedding.embed(&[query_text.to_string()]).await?;
        let Some(query_vector) = vectors.into_iter().next() else {
            return Ok(Vec::new());
        };

        let filter = MatchAnyFilter::new()
            .match_any("characters", active_characters)
            .match_any("location", location_hints);
        let filter = (!filter.is_empty()).then_some(filter);

        let points = self.index.search(query_vector, top_k, filter).await?;

        Ok(points
            .iter()
            .map(|point| candidate_from_point(point, normalize_semantic_score(point.score)))
            .filter(|candidate| match (candidate.chapter_no, unlocked_chapter) {
                (Some(no), Some(unlocked)) => no <= unlocked,
                _ => true,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_normalisation_clamps_and_shifts() {
        assert_eq!(normalize_semantic_score(-2.0), 0.0);
        assert_eq!(normalize_semantic_score(-1.0), 0.0);
        assert_eq!(normalize_semantic_score(0.0), 0.5);
        assert_eq!(normalize_semantic_score(1.0), 1.0);
        assert_eq!(normalize_semantic_score(3.0), 1.0);
    }

    #[tokio::test]
    async fn searches_and_applies_spoiler_cut() {
        use crate::models::MockEmbeddingProvider;
        use crate::pipeline::vectorize::testing::InMemoryIndex;
        use crate::vector::ScenePoint;

        let index = Arc::new(InMemoryIndex::default());
        index
            .upsert_points(vec![
                ScenePoint {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0; 8],
                    payload: serde_json::json!({
                        "text": "早期剧情", "chapter": "chapter_0001", "chapter_no": 1,
                        "scene_index": 0, "characters": ["许七安"],
                    }),
                },
                ScenePoint {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0; 8],
                    payload: serde_json::json!({
                        "text": "后期剧情", "chapter": "chapter_0020", "chapter_no": 20,
                        "scene_index": 1, "characters": ["许七安"],
                    }),
                },
            ])
            .await
            .unwrap();

        let retriever = SemanticRetriever::new(
            Arc::clone(&index) as Arc<dyn VectorIndex>,
            Arc::new(MockEmbeddingProvider::new(8)),
        );

        let results = retriever
            .query("许七安做了什么", 10, &[], &[], Some(10))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chapter.as_deref(), Some("chapter_0001"));

        let unbounded = retriever
            .query("许七安做了什么", 10, &[], &[], None)
            .await
            .unwrap();
        assert_eq!(unbounded.len(), 2);
    }

    #[tokio::test]
    async fn empty_query_short_circuits() {
        use crate::models::MockEmbeddingProvider;
        use crate::pipeline::vectorize::testing::InMemoryIndex;

        let retriever = SemanticRetriever::new(
            Arc::new(InMemoryIndex::default()),
            Arc::new(MockEmbeddingProvider::new(8)),
        );
        assert!(retriever.query("", 10, &[], &[], None).await.unwrap().is_empty());
    }
}
