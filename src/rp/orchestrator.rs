//! Multi-channel retrieval orchestration.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use super::rerank::Reranker;
use super::retrievers::{FilterRetriever, ProfileRetriever, SemanticRetriever};
use super::session::SessionState;
use super::{Guardrails, QueryUnderstanding, RetrievalCandidate};

/// Per-request diagnostics: channel counts, timings, and captured errors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalDebug {
    pub counts: HashMap<String, usize>,
    pub timing_ms: HashMap<String, f64>,
    pub errors: HashMap<String, String>,
}

/// Fans out to the three channels, dedupes, applies the spoiler boundary,
/// and reranks. Channel failures land in `debug.errors` instead of
/// aborting the request.
pub struct RetrievalOrchestrator {
    semantic: SemanticRetriever,
    filter: FilterRetriever,
    profile: ProfileRetriever,
    reranker: Reranker,
    guardrails: Guardrails,
    vector_top_k: usize,
    filter_top_k: usize,
    profile_top_k: usize,
}

impl RetrievalOrchestrator {
    pub fn new(
        semantic: SemanticRetriever,
        filter: FilterRetriever,
        profile: ProfileRetriever,
        vector_top_k: usize,
        filter_top_k: usize,
        profile_top_k: usize,
    ) -> Self {
        Self {
            semantic,
            filter,
            profile,
            reranker: Reranker::new(),
            guardrails: Guardrails::new(),
            vector_top_k,
            filter_top_k,
            profile_top_k,
        }
    }

    pub async fn retrieve(
        &self,
        query: &QueryUnderstanding,
        session: &SessionState,
        max_candidates: usize,
    ) -> (Vec<RetrievalCandidate>, RetrievalDebug) {
        let started = Instant::now();
        let mut debug = RetrievalDebug::default();

        let unlocked = query.constraints.unlocked_chapter;
        let profile_entities: &[String] = if query.entities.is_empty() {
            &query.constraints.active_characters
        } else {
            &query.entities
        };

        let semantic_fut = async {
            let channel_start = Instant::now();
            let result = self
                .semantic
                .query(
                    &query.normalized_query,
                    self.vector_top_k,
                    &query.constraints.active_characters,
                    &query.locations,
                    unlocked,
                )
                .await;
            (result, channel_start.elapsed())
        };
        let filter_fut = async {
            let channel_start = Instant::now();
            let result = self
                .filter
                .query(&query.entities, &query.locations, self.filter_top_k, unlocked)
                .await;
            (result, channel_start.elapsed())
        };
        let profile_fut = async {
            let channel_start = Instant::now();
            let result = self.profile.query(profile_entities, self.profile_top_k).await;
            (result, channel_start.elapsed())
        };

        let ((semantic, semantic_ms), (filter, filter_ms), (profile, profile_ms)) =
            tokio::join!(semantic_fut, filter_fut, profile_fut);

        let mut unpack = |name: &str, result: crate::types::Result<Vec<RetrievalCandidate>>| {
            match result {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::error!(channel = name, error = %e, "retrieval channel failed");
                    debug.errors.insert(name.to_string(), e.to_string());
                    Vec::new()
                }
            }
        };
        let semantic = unpack("vector", semantic);
        let filter = unpack("filter", filter);
        let profile = unpack("profile", profile);

        debug.counts.insert("vector".to_string(), semantic.len());
        debug.counts.insert("filter".to_string(), filter.len());
        debug.counts.insert("profile".to_string(), profile.len());
        debug
            .timing_ms
            .insert("vector".to_string(), round2(semantic_ms.as_secs_f64() * 1000.0));
        debug
            .timing_ms
            .insert("filter".to_string(), round2(filter_ms.as_secs_f64() * 1000.0));
        debug
            .timing_ms
            .insert("profile".to_string(), round2(profile_ms.as_secs_f64() * 1000.0));

        let mut merged: Vec<RetrievalCandidate> = Vec::new();
        merged.extend(semantic);
        merged.extend(filter);
        merged.extend(profile);
        let merged = dedupe(merged);
        debug.counts.insert("merged".to_string(), merged.len());

        let filtered = self.guardrails.filter_spoilers(merged, unlocked);
        debug
            .counts
            .insert("after_spoiler_filter".to_string(), filtered.len());

        let mut ranked = self
            .reranker
            .rank(filtered, query, &session.recent_entities);
        ranked.truncate(max_candidates);
        debug.counts.insert("ranked".to_string(), ranked.len());
        debug
            .timing_ms
            .insert("total".to_string(), round2(started.elapsed().as_secs_f64() * 1000.0));

        (ranked, debug)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// On dedupe-key collision the candidate with the higher semantic score
/// survives.
fn dedupe(candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut bucket: Vec<RetrievalCandidate> = Vec::new();
    for candidate in candidates {
        let key = candidate.dedupe_key();
        match bucket.iter_mut().find(|c| c.dedupe_key() == key) {
            Some(existing) => {
                if candidate.semantic_score > existing.semantic_score {
                    *existing = candidate;
                }
            }
            None => bucket.push(candidate),
        }
    }
    bucket
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MockEmbeddingProvider;
    use crate::pipeline::vectorize::testing::InMemoryIndex;
    use crate::rp::{Intent, QueryConstraints, SourceType};
    use crate::vector::{ScenePoint, VectorIndex};
    use std::sync::Arc;

    fn query(entities: Vec<&str>, unlocked: Option<i64>) -> QueryUnderstanding {
        QueryUnderstanding {
            intent: Intent::StoryRecap,
            normalized_query: "许七安 查案".to_string(),
            entities: entities.iter().map(|s| s.to_string()).collect(),
            locations: Vec::new(),
            event_keywords: vec!["查案".to_string()],
            constraints: QueryConstraints {
                unlocked_chapter: unlocked,
                active_characters: entities.iter().map(|s| s.to_string()).collect(),
                location_hints: Vec::new(),
            },
        }
    }

    async fn orchestrator_with_data() -> (tempfile::TempDir, RetrievalOrchestrator) {
        let index = Arc::new(InMemoryIndex::default());
        index
            .upsert_points(vec![
                ScenePoint {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0; 8],
                    payload: serde_json::json!({
                        "text": "许七安在衙门查案。", "chapter": "chapter_0001", "chapter_no": 1,
                        "scene_index": 2, "characters": ["许七安"], "location": "衙门",
                        "event_summary": "查案",
                    }),
                },
                ScenePoint {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0; 8],
                    payload: serde_json::json!({
                        "text": "大结局剧透内容。", "chapter": "chapter_0020", "chapter_no": 20,
                        "scene_index": 1, "characters": ["许七安"],
                    }),
                },
            ])
            .await
            .unwrap();

        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("许七安.md"), "# 许七安 - 角色档案").unwrap();

        let orchestrator = RetrievalOrchestrator::new(
            SemanticRetriever::new(
                Arc::clone(&index) as Arc<dyn VectorIndex>,
                Arc::new(MockEmbeddingProvider::new(8)),
            ),
            FilterRetriever::new(Arc::clone(&index) as Arc<dyn VectorIndex>),
            ProfileRetriever::new(tmp.path()),
            30,
            20,
            10,
        );
        (tmp, orchestrator)
    }

    #[tokio::test]
    async fn spoiler_boundary_holds_across_channels() {
        let (_tmp, orchestrator) = orchestrator_with_data().await;
        let session = SessionState::new("s", 0);

        let (ranked, debug) = orchestrator
            .retrieve(&query(vec!["许七安"], Some(10)), &session, 60)
            .await;

        // Scene citations never exceed the boundary; the profile passes.
        for candidate in &ranked {
            if candidate.source_type == SourceType::Scene {
                assert!(candidate.chapter_no.unwrap_or(0) <= 10);
            }
        }
        assert!(ranked.iter().any(|c| c.source_type == SourceType::Profile));
        assert!(debug.errors.is_empty());
        assert!(debug.counts["merged"] >= debug.counts["after_spoiler_filter"]);
    }

    #[tokio::test]
    async fn duplicate_scene_keeps_higher_semantic_score() {
        let (_tmp, orchestrator) = orchestrator_with_data().await;
        let session = SessionState::new("s", 0);

        // The same scene arrives via the vector channel (normalized mock
        // score 0.9) and the filter channel (baseline 0.55).
        let (ranked, debug) = orchestrator
            .retrieve(&query(vec!["许七安"], None), &session, 60)
            .await;

        let scene_count = ranked
            .iter()
            .filter(|c| c.dedupe_key() == "scene:chapter_0001:2")
            .count();
        assert_eq!(scene_count, 1);
        let survivor = ranked
            .iter()
            .find(|c| c.dedupe_key() == "scene:chapter_0001:2")
            .unwrap();
        assert!(survivor.semantic_score > 0.55);
        assert!(debug.counts["vector"] >= 1);
        assert!(debug.counts["filter"] >= 1);
    }

    #[tokio::test]
    async fn max_candidates_truncates_ranked_output() {
        let (_tmp, orchestrator) = orchestrator_with_data().await;
        let session = SessionState::new("s", 0);

        let (ranked, _) = orchestrator
            .retrieve(&query(vec!["许七安"], None), &session, 1)
            .await;
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn dedupe_prefers_higher_score() {
        let mut a = RetrievalCandidate::profile("同一人", "text", 0.3);
        let mut b = RetrievalCandidate::profile("同一人", "better", 0.9);
        a.final_score = 0.0;
        b.final_score = 0.0;

        let out = dedupe(vec![a, b]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "better");
    }
}
