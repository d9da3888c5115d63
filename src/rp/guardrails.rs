//! Spoiler, evidence, and citation guardrails.

use serde_json::Value;

use super::{Citation, Intent, QueryUnderstanding, RetrievalCandidate, SourceType};

/// Fixed fallback when retrieval produced no citations.
pub const INSUFFICIENT_EVIDENCE_REPLY: &str =
    "未检索到明确证据，请补充人物、地点或章节范围后重试。";

const INSUFFICIENT_NEXT_ACTION_REPLY: &str =
    "当前知识库没有检索到足够证据支撑下一步建议，请补充角色、地点或章节范围后重试。";

/// Applies the spoiler boundary and response constraints.
#[derive(Debug, Default)]
pub struct Guardrails;

impl Guardrails {
    pub fn new() -> Self {
        Self
    }

    /// Drop scene candidates beyond the unlocked chapter. Scenes with an
    /// unknown chapter number are kept; profiles are never filtered.
    pub fn filter_spoilers(
        &self,
        candidates: Vec<RetrievalCandidate>,
        unlocked_chapter: Option<i64>,
    ) -> Vec<RetrievalCandidate> {
        let Some(unlocked) = unlocked_chapter else {
            return candidates;
        };

        candidates
            .into_iter()
            .filter(|candidate| {
                if candidate.source_type != SourceType::Scene {
                    return true;
                }
                match candidate.chapter_no {
                    Some(no) => no <= unlocked,
                    None => true,
                }
            })
            .collect()
    }

    pub fn has_enough_evidence(&self, citations: &[Citation]) -> bool {
        !citations.is_empty()
    }

    pub fn insufficient_evidence_reply(&self, query: &QueryUnderstanding) -> &'static str {
        if query.intent == Intent::NextAction {
            INSUFFICIENT_NEXT_ACTION_REPLY
        } else {
            INSUFFICIENT_EVIDENCE_REPLY
        }
    }

    /// System prompt enforcing citation-grounded answers.
    pub fn grounding_system_prompt(&self) -> String {
        "你是角色扮演剧情助手。\n\
         规则：\n\
         1) 只能基于给定 worldbook_context 里的 facts 和 character_state 回答。\n\
         2) 不得编造未在证据中出现的事实。\n\
         3) 重要断言必须引用来源。\n\
         4) 若证据不足，直接说明证据不足，并提出需要补充的信息。"
            .to_string()
    }

    /// User prompt embedding the worldbook payload and the raw message.
    pub fn grounding_prompt(&self, user_message: &str, worldbook: &Value) -> String {
        format!(
            "以下是检索到的 worldbook_context（JSON）：\n{worldbook}\n\n\
             请根据以上信息回复玩家，并在末尾附上 citations 数组中的关键来源。\n\
             玩家消息：{user_message}"
        )
    }

    /// Append a compact footer when the model forgot to cite sources.
    pub fn append_citation_footer(&self, reply: &str, citations: &[Citation]) -> String {
        if citations.is_empty() {
            return reply.to_string();
        }
        if reply.contains("参考来源") || reply.to_lowercase().contains("citation") {
            return reply.to_string();
        }

        let lines: Vec<String> = citations
            .iter()
            .take(3)
            .map(|c| {
                let chapter = c.chapter.as_deref().unwrap_or("unknown");
                match c.scene_index {
                    Some(scene) => format!("- {chapter} / scene {scene}"),
                    None => format!("- {chapter}"),
                }
            })
            .collect();

        format!("{reply}\n\n参考来源:\n{}", lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rp::QueryConstraints;

    fn scene(chapter: &str, chapter_no: Option<i64>) -> RetrievalCandidate {
        let mut candidate = RetrievalCandidate::profile("x", "text", 0.5);
        candidate.source_type = SourceType::Scene;
        candidate.chapter = Some(chapter.to_string());
        candidate.chapter_no = chapter_no;
        candidate.scene_index = Some(0);
        candidate
    }

    fn citation(chapter: Option<&str>, scene_index: Option<i64>) -> Citation {
        Citation {
            source_type: SourceType::Scene,
            source_id: "id".to_string(),
            chapter: chapter.map(str::to_string),
            scene_index,
            chapter_title: String::new(),
            excerpt: String::new(),
        }
    }

    #[test]
    fn spoiler_filter_keeps_unknown_and_profiles() {
        let guardrails = Guardrails::new();
        let candidates = vec![
            scene("chapter_0002", Some(2)),
            scene("chapter_0020", Some(20)),
            scene("prologue", None),
            RetrievalCandidate::profile("许七安", "dossier", 0.5),
        ];

        let filtered = guardrails.filter_spoilers(candidates, Some(10));
        assert_eq!(filtered.len(), 3);
        assert!(filtered
            .iter()
            .filter(|c| c.source_type == SourceType::Scene)
            .all(|c| c.chapter_no.unwrap_or(0) <= 10));
        assert!(filtered.iter().any(|c| c.source_type == SourceType::Profile));
    }

    #[test]
    fn no_boundary_means_no_filtering() {
        let guardrails = Guardrails::new();
        let candidates = vec![scene("chapter_0099", Some(99))];
        assert_eq!(guardrails.filter_spoilers(candidates, None).len(), 1);
    }

    #[test]
    fn insufficient_reply_depends_on_intent() {
        let guardrails = Guardrails::new();
        let mut query = QueryUnderstanding {
            intent: Intent::NextAction,
            normalized_query: String::new(),
            entities: Vec::new(),
            locations: Vec::new(),
            event_keywords: Vec::new(),
            constraints: QueryConstraints::default(),
        };
        assert!(guardrails.insufficient_evidence_reply(&query).contains("下一步"));

        query.intent = Intent::StoryRecap;
        assert_eq!(
            guardrails.insufficient_evidence_reply(&query),
            INSUFFICIENT_EVIDENCE_REPLY
        );
    }

    #[test]
    fn footer_appends_up_to_three_citations() {
        let guardrails = Guardrails::new();
        let citations = vec![
            citation(Some("chapter_0001"), Some(0)),
            citation(Some("chapter_0002"), None),
            citation(Some("chapter_0003"), Some(4)),
            citation(Some("chapter_0004"), Some(5)),
        ];

        let reply = guardrails.append_citation_footer("许七安已完成破案。", &citations);
        assert!(reply.ends_with(
            "参考来源:\n- chapter_0001 / scene 0\n- chapter_0002\n- chapter_0003 / scene 4"
        ));
    }

    #[test]
    fn footer_skipped_when_sources_already_cited() {
        let guardrails = Guardrails::new();
        let citations = vec![citation(Some("chapter_0001"), Some(0))];

        let already = guardrails.append_citation_footer("见参考来源。", &citations);
        assert_eq!(already, "见参考来源。");

        let english = guardrails.append_citation_footer("See Citations above.", &citations);
        assert_eq!(english, "See Citations above.");

        let none = guardrails.append_citation_footer("无来源。", &[]);
        assert_eq!(none, "无来源。");
    }
}
