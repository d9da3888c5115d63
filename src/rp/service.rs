//! Application-level role-play query service and its per-novel router.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::orchestrator::{RetrievalDebug, RetrievalOrchestrator};
use super::retrievers::{FilterRetriever, ProfileRetriever, SemanticRetriever};
use super::session::{SessionStore, Turn};
use super::understanding::{HistoryTurn, QueryUnderstandingService};
use super::worldbook::{WorldbookBuilder, WorldbookContext};
use super::{Citation, Guardrails, QueryUnderstanding};
use crate::config::RpQueryConfig;
use crate::models::{ChatProvider, ChatRequest, EmbeddingProvider};
use crate::novels::NovelsService;
use crate::storage::StorageLayout;
use crate::types::Result;
use crate::vector::VectorIndexProvider;

/// Response of the context-only query path.
#[derive(Debug, Serialize)]
pub struct QueryContextResponse {
    pub session_id: String,
    pub worldbook_context: WorldbookContext,
    pub citations: Vec<Citation>,
    pub debug_scores: RetrievalDebug,
    pub query_understanding: QueryUnderstanding,
}

/// Response of the grounded respond path.
#[derive(Debug, Serialize)]
pub struct RespondResponse {
    pub assistant_reply: String,
    pub citations: Vec<Citation>,
    pub worldbook_context: Value,
}

/// Inputs shared by both query paths.
#[derive(Debug, Clone, Default)]
pub struct RpRequest {
    pub message: String,
    pub session_id: String,
    pub unlocked_chapter: Option<i64>,
    pub active_characters: Option<Vec<String>>,
    pub recent_messages: Option<Vec<HistoryTurn>>,
}

/// Retrieval and grounding for one novel's knowledge base.
pub struct RpQueryService {
    understanding: QueryUnderstandingService,
    orchestrator: RetrievalOrchestrator,
    worldbook: WorldbookBuilder,
    guardrails: Guardrails,
    chat: Arc<dyn ChatProvider>,
    max_candidates: usize,
}

impl RpQueryService {
    pub fn new(
        understanding: QueryUnderstandingService,
        orchestrator: RetrievalOrchestrator,
        worldbook: WorldbookBuilder,
        chat: Arc<dyn ChatProvider>,
        max_candidates: usize,
    ) -> Self {
        Self {
            understanding,
            orchestrator,
            worldbook,
            guardrails: Guardrails::new(),
            chat,
            max_candidates,
        }
    }

    /// Retrieve evidence and compose the worldbook without generating a
    /// reply. Persists the user turn and remembered entities.
    pub async fn query_context(
        &self,
        sessions: &SessionStore,
        request: &RpRequest,
    ) -> Result<QueryContextResponse> {
        let mut state = sessions.load(&request.session_id, request.unlocked_chapter.unwrap_or(0));
        state.apply_runtime_updates(
            request.unlocked_chapter,
            request.active_characters.as_deref(),
            None,
        );

        let history: Vec<HistoryTurn> = match &request.recent_messages {
            Some(messages) => messages.clone(),
            None => state
                .turns
                .iter()
                .rev()
                .take(10)
                .rev()
                .map(|t: &Turn| HistoryTurn {
                    role: t.role.clone(),
                    content: t.content.clone(),
                })
                .collect(),
        };

        let understanding = self.understanding.understand(
            &request.message,
            &history,
            &state,
            Some(state.max_unlocked_chapter),
            Some(&state.active_characters),
        );

        let (ranked, debug) = self
            .orchestrator
            .retrieve(&understanding, &state, self.max_candidates)
            .await;

        let (worldbook_context, citations) = self.worldbook.build(&ranked, &understanding);

        state.append_turn("user", &request.message);
        state.remember_entities(&understanding.entities);
        sessions.save(&mut state)?;

        Ok(QueryContextResponse {
            session_id: request.session_id.clone(),
            worldbook_context,
            citations,
            debug_scores: debug,
            query_understanding: understanding,
        })
    }

    /// Full grounded reply: evidence check, model call, citation footer.
    /// Callers may supply a previously returned worldbook + citations.
    pub async fn respond(
        &self,
        sessions: &SessionStore,
        request: &RpRequest,
        worldbook_context: Option<Value>,
        citations: Option<Vec<Citation>>,
    ) -> Result<RespondResponse> {
        let (worldbook_value, citations, understanding) = match (worldbook_context, citations) {
            (Some(context), Some(citations)) => {
                // Recompute understanding only for the fallback-reply shape.
                let state =
                    sessions.load(&request.session_id, request.unlocked_chapter.unwrap_or(0));
                let understanding = self.understanding.understand(
                    &request.message,
                    &[],
                    &state,
                    Some(state.max_unlocked_chapter),
                    Some(&state.active_characters),
                );
                (context, citations, understanding)
            }
            _ => {
                let context_resp = self.query_context(sessions, request).await?;
                (
                    serde_json::to_value(&context_resp.worldbook_context)?,
                    context_resp.citations,
                    context_resp.query_understanding,
                )
            }
        };

        let mut state = sessions.load(&request.session_id, request.unlocked_chapter.unwrap_or(0));
        state.apply_runtime_updates(
            request.unlocked_chapter,
            request.active_characters.as_deref(),
            None,
        );

        // query_context may already have recorded this user turn.
        let duplicate_user_turn = state
            .turns
            .last()
            .map(|t| t.role == "user" && t.content == request.message)
            .unwrap_or(false);
        if !duplicate_user_turn {
            state.append_turn("user", &request.message);
        }

        if !self.guardrails.has_enough_evidence(&citations) {
            let reply = self.guardrails.insufficient_evidence_reply(&understanding);
            state.append_turn("assistant", reply);
            sessions.save(&mut state)?;
            return Ok(RespondResponse {
                assistant_reply: reply.to_string(),
                citations,
                worldbook_context: worldbook_value,
            });
        }

        let system_prompt = self.guardrails.grounding_system_prompt();
        let user_prompt = self
            .guardrails
            .grounding_prompt(&request.message, &worldbook_value);

        let reply = match self
            .chat
            .call(
                ChatRequest::text(user_prompt)
                    .with_system_prompt(system_prompt)
                    .with_temperature(0.4),
            )
            .await
            .and_then(|out| out.into_text())
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "grounded reply failed, using deterministic fallback");
                fallback_reply(&worldbook_value)
            }
        };

        let final_reply = self.guardrails.append_citation_footer(&reply, &citations);

        state.append_turn("assistant", &final_reply);
        sessions.save(&mut state)?;

        Ok(RespondResponse {
            assistant_reply: final_reply,
            citations,
            worldbook_context: worldbook_value,
        })
    }
}

/// Deterministic reply listing up to three facts with their sources.
fn fallback_reply(worldbook: &Value) -> String {
    let facts = worldbook
        .get("facts")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if facts.is_empty() {
        return "当前没有足够证据支持回复，请提供更具体的问题。".to_string();
    }

    let mut lines = vec!["根据当前证据：".to_string()];
    for fact in facts.iter().take(3) {
        let chapter = fact
            .get("source_chapter")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let source = match fact.get("source_scene").and_then(Value::as_i64) {
            Some(scene) => format!("{chapter} / scene {scene}"),
            None => chapter.to_string(),
        };
        let text = fact.get("fact_text").and_then(Value::as_str).unwrap_or("");
        lines.push(format!("- {text}（{source}）"));
    }
    lines.push("如果你希望我继续推进剧情，请指定你要扮演的角色和当前目标。".to_string());
    lines.join("\n")
}

/// Builds and caches one [`RpQueryService`] per novel.
pub struct RpServiceRouter {
    novels: NovelsService,
    layout: StorageLayout,
    config: RpQueryConfig,
    chat: Arc<dyn ChatProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorIndexProvider>,
    services: Mutex<HashMap<String, Arc<RpQueryService>>>,
}

impl RpServiceRouter {
    pub fn new(
        novels: NovelsService,
        layout: StorageLayout,
        config: RpQueryConfig,
        chat: Arc<dyn ChatProvider>,
        embedding: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndexProvider>,
    ) -> Self {
        Self {
            novels,
            layout,
            config,
            chat,
            embedding,
            vectors,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Drop the cached service so the next query sees fresh artifacts.
    pub fn invalidate(&self, novel_id: &str) {
        self.services.lock().remove(novel_id);
    }

    /// Session store scoped to (user|guest) × novel.
    pub fn session_store(
        &self,
        user_id: Option<&str>,
        guest_id: Option<&str>,
        novel_id: Option<&str>,
    ) -> Result<SessionStore> {
        let dir = self.layout.sessions_dir(user_id, guest_id, novel_id)?;
        Ok(SessionStore::new(dir))
    }

    pub fn get_service(&self, novel_id: &str) -> Result<Arc<RpQueryService>> {
        if let Some(cached) = self.services.lock().get(novel_id) {
            return Ok(Arc::clone(cached));
        }

        // Confirm the novel exists before building (outside the lock).
        let paths = self.novels.paths(novel_id)?;

        let index = self.vectors.index_for(novel_id)?;
        let orchestrator = RetrievalOrchestrator::new(
            SemanticRetriever::new(Arc::clone(&index), Arc::clone(&self.embedding)),
            FilterRetriever::new(index),
            ProfileRetriever::new(&paths.profiles_dir),
            self.config.vector_top_k,
            self.config.filter_top_k,
            self.config.profile_top_k,
        );

        let service = Arc::new(RpQueryService::new(
            QueryUnderstandingService::new(&paths.profiles_dir, &paths.annotated_dir),
            orchestrator,
            WorldbookBuilder::new(self.config.worldbook_top_n),
            Arc::clone(&self.chat),
            self.config.max_candidates,
        ));

        self.services
            .lock()
            .insert(novel_id.to_string(), Arc::clone(&service));
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::ScriptedChatProvider;
    use crate::models::MockEmbeddingProvider;
    use crate::pipeline::vectorize::testing::InMemoryIndex;
    use crate::rp::guardrails::INSUFFICIENT_EVIDENCE_REPLY;
    use crate::vector::{ScenePoint, VectorIndex};

    struct Fixture {
        _tmp: tempfile::TempDir,
        sessions: SessionStore,
        service: RpQueryService,
    }

    async fn fixture(chat: ScriptedChatProvider, with_scene: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let profiles_dir = tmp.path().join("profiles");
        let annotated_dir = tmp.path().join("annotated");
        std::fs::create_dir_all(&profiles_dir).unwrap();
        std::fs::create_dir_all(&annotated_dir).unwrap();
        std::fs::write(profiles_dir.join("许七安.md"), "# 许七安 - 角色档案").unwrap();

        let index = Arc::new(InMemoryIndex::default());
        if with_scene {
            index
                .upsert_points(vec![ScenePoint {
                    id: uuid::Uuid::new_v4(),
                    vector: vec![0.0; 8],
                    payload: serde_json::json!({
                        "text": "许七安在破庙中找到关键证物。",
                        "chapter": "chapter_0001", "chapter_no": 1, "scene_index": 0,
                        "characters": ["许七安"], "location": "破庙",
                        "event_summary": "找到证物",
                    }),
                }])
                .await
                .unwrap();
        }

        let orchestrator = RetrievalOrchestrator::new(
            SemanticRetriever::new(
                Arc::clone(&index) as Arc<dyn VectorIndex>,
                Arc::new(MockEmbeddingProvider::new(8)),
            ),
            FilterRetriever::new(Arc::clone(&index) as Arc<dyn VectorIndex>),
            ProfileRetriever::new(&profiles_dir),
            30,
            20,
            10,
        );

        let service = RpQueryService::new(
            QueryUnderstandingService::new(&profiles_dir, &annotated_dir),
            orchestrator,
            WorldbookBuilder::new(8),
            Arc::new(chat),
            60,
        );
        let sessions = SessionStore::new(tmp.path().join("sessions"));

        Fixture {
            _tmp: tmp,
            sessions,
            service,
        }
    }

    fn request(message: &str) -> RpRequest {
        RpRequest {
            message: message.to_string(),
            session_id: "s1".to_string(),
            unlocked_chapter: Some(10),
            active_characters: None,
            recent_messages: None,
        }
    }

    #[tokio::test]
    async fn query_context_builds_worldbook_and_persists_turn() {
        let f = fixture(ScriptedChatProvider::failing(), true).await;

        let response = f
            .service
            .query_context(&f.sessions, &request("许七安找到了什么？"))
            .await
            .unwrap();

        assert!(!response.citations.is_empty());
        assert!(!response.worldbook_context.facts.is_empty());
        assert_eq!(
            response.worldbook_context.facts[0].source_chapter.as_deref(),
            Some("chapter_0001")
        );

        let state = f.sessions.load("s1", 0);
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].role, "user");
        assert!(state.recent_entities.contains(&"许七安".to_string()));
    }

    #[tokio::test]
    async fn respond_with_empty_citations_returns_fixed_fallback() {
        let f = fixture(ScriptedChatProvider::failing(), false).await;

        let response = f
            .service
            .respond(
                &f.sessions,
                &request("发生了什么？"),
                Some(serde_json::json!({"facts": []})),
                Some(Vec::new()),
            )
            .await
            .unwrap();

        assert_eq!(response.assistant_reply, INSUFFICIENT_EVIDENCE_REPLY);

        // The fixed reply is persisted as an assistant turn.
        let state = f.sessions.load("s1", 0);
        assert_eq!(state.turns.last().unwrap().role, "assistant");
        assert_eq!(state.turns.last().unwrap().content, INSUFFICIENT_EVIDENCE_REPLY);
    }

    #[tokio::test]
    async fn respond_appends_citation_footer() {
        let f = fixture(
            ScriptedChatProvider::with_text(vec!["许七安已完成破案。"]),
            true,
        )
        .await;

        let response = f
            .service
            .respond(&f.sessions, &request("案子怎么样了？"), None, None)
            .await
            .unwrap();

        assert!(response.assistant_reply.starts_with("许七安已完成破案。"));
        assert!(response
            .assistant_reply
            .contains("参考来源:\n- chapter_0001 / scene 0"));
    }

    #[tokio::test]
    async fn respond_model_failure_uses_deterministic_fallback() {
        let f = fixture(ScriptedChatProvider::failing(), true).await;

        let response = f
            .service
            .respond(&f.sessions, &request("案子怎么样了？"), None, None)
            .await
            .unwrap();

        assert!(response.assistant_reply.starts_with("根据当前证据："));
        assert!(response.assistant_reply.contains("chapter_0001"));
    }

    #[tokio::test]
    async fn duplicate_user_turn_is_suppressed() {
        let f = fixture(
            ScriptedChatProvider::with_text(vec!["回答。"]),
            true,
        )
        .await;

        // respond() recomputes context internally, which records the user
        // turn; the respond path must not record it twice.
        f.service
            .respond(&f.sessions, &request("同一个问题"), None, None)
            .await
            .unwrap();

        let state = f.sessions.load("s1", 0);
        let user_turns = state
            .turns
            .iter()
            .filter(|t| t.role == "user" && t.content == "同一个问题")
            .count();
        assert_eq!(user_turns, 1);
    }

    #[test]
    fn fallback_reply_lists_three_facts() {
        let worldbook = serde_json::json!({
            "facts": [
                {"fact_text": "一", "source_chapter": "chapter_0001", "source_scene": 0},
                {"fact_text": "二", "source_chapter": "chapter_0002", "source_scene": 1},
                {"fact_text": "三", "source_chapter": "chapter_0003"},
                {"fact_text": "四", "source_chapter": "chapter_0004"},
            ]
        });
        let reply = fallback_reply(&worldbook);
        assert!(reply.contains("一（chapter_0001 / scene 0）"));
        assert!(reply.contains("三（chapter_0003）"));
        assert!(!reply.contains("四"));
    }
}
