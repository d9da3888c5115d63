//! Worldbook assembly from ranked evidence.

use serde::Serialize;

use super::{Citation, QueryUnderstanding, RetrievalCandidate, SourceType};
use crate::text::shorten_text;

/// One grounded fact derived from a scene candidate.
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    pub fact_text: String,
    pub source_chapter: Option<String>,
    pub source_scene: Option<i64>,
    pub excerpt: String,
    pub confidence: f64,
}

/// Condensed character dossier entry.
#[derive(Debug, Clone, Serialize)]
pub struct CharacterState {
    pub character: String,
    pub summary: String,
    pub confidence: f64,
}

/// Timeline note ordered by narrative position.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineNote {
    pub chapter: Option<String>,
    pub scene_index: Option<i64>,
    pub event: String,
}

/// The structured payload handed to the grounded reply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorldbookContext {
    pub facts: Vec<Fact>,
    pub character_state: Vec<CharacterState>,
    pub timeline_notes: Vec<TimelineNote>,
    pub forbidden: Vec<String>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Assembles facts, character state, and timeline notes from the top
/// ranked candidates.
pub struct WorldbookBuilder {
    max_facts: usize,
}

impl WorldbookBuilder {
    pub fn new(max_facts: usize) -> Self {
        Self {
            max_facts: max_facts.max(1),
        }
    }

    pub fn build(
        &self,
        candidates: &[RetrievalCandidate],
        query: &QueryUnderstanding,
    ) -> (WorldbookContext, Vec<Citation>) {
        let selected: Vec<&RetrievalCandidate> =
            candidates.iter().take(self.max_facts).collect();

        let mut context = WorldbookContext::default();
        let mut citations: Vec<Citation> = Vec::new();

        for candidate in &selected {
            match candidate.source_type {
                SourceType::Scene => {
                    let fact_text = if !candidate.event_summary.is_empty() {
                        candidate.event_summary.clone()
                    } else if !candidate.scene_summary.is_empty() {
                        candidate.scene_summary.clone()
                    } else {
                        shorten_text(&candidate.text, 140)
                    };
                    context.facts.push(Fact {
                        fact_text,
                        source_chapter: candidate.chapter.clone(),
                        source_scene: candidate.scene_index,
                        excerpt: shorten_text(&candidate.text, 180),
                        confidence: round4(candidate.final_score),
                    });
                    citations.push(candidate.citation());
                }
                SourceType::Profile => {
                    context.character_state.push(CharacterState {
                        character: candidate.source_id.clone(),
                        summary: shorten_text(&candidate.text, 220),
                        confidence: round4(candidate.final_score),
                    });
                    let mut citation = candidate.citation();
                    citation.excerpt = shorten_text(&candidate.text, 120);
                    citations.push(citation);
                }
            }
        }

        // Timeline in narrative order; unknown chapter numbers sort last.
        let mut timeline: Vec<&&RetrievalCandidate> = selected
            .iter()
            .filter(|c| c.source_type == SourceType::Scene)
            .collect();
        timeline.sort_by_key(|c| {
            (
                c.chapter_no.unwrap_or(i64::MAX),
                c.scene_index.unwrap_or(0),
            )
        });
        for candidate in timeline.into_iter().take(self.max_facts) {
            let event = if !candidate.event_summary.is_empty() {
                candidate.event_summary.clone()
            } else if !candidate.scene_summary.is_empty() {
                candidate.scene_summary.clone()
            } else {
                shorten_text(&candidate.text, 100)
            };
            context.timeline_notes.push(TimelineNote {
                chapter: candidate.chapter.clone(),
                scene_index: candidate.scene_index,
                event,
            });
        }

        context.forbidden = vec![
            "禁止编造未在证据中的设定。".to_string(),
            "若证据不足必须明确说明，不能强行续写事实。".to_string(),
        ];
        if let Some(unlocked) = query.constraints.unlocked_chapter {
            context
                .forbidden
                .push(format!("禁止引用 chapter>{unlocked} 的信息（防剧透）。"));
        }

        (context, citations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rp::{Intent, QueryConstraints};

    fn scene(chapter: &str, chapter_no: i64, scene_index: i64, summary: &str) -> RetrievalCandidate {
        let mut candidate = RetrievalCandidate::profile("x", "场景正文内容。", 0.5);
        candidate.source_type = SourceType::Scene;
        candidate.source_id = format!("{chapter}:{scene_index}");
        candidate.chapter = Some(chapter.to_string());
        candidate.chapter_no = Some(chapter_no);
        candidate.scene_index = Some(scene_index);
        candidate.event_summary = summary.to_string();
        candidate.final_score = 0.87654321;
        candidate
    }

    fn query(unlocked: Option<i64>) -> QueryUnderstanding {
        QueryUnderstanding {
            intent: Intent::StoryRecap,
            normalized_query: String::new(),
            entities: Vec::new(),
            locations: Vec::new(),
            event_keywords: Vec::new(),
            constraints: QueryConstraints {
                unlocked_chapter: unlocked,
                ..QueryConstraints::default()
            },
        }
    }

    #[test]
    fn facts_and_citations_pair_up() {
        let builder = WorldbookBuilder::new(8);
        let candidates = vec![
            scene("chapter_0002", 2, 1, "夜探破庙"),
            RetrievalCandidate::profile("许七安", "档案全文", 0.5),
        ];

        let (context, citations) = builder.build(&candidates, &query(None));
        assert_eq!(context.facts.len(), 1);
        assert_eq!(context.facts[0].fact_text, "夜探破庙");
        assert_eq!(context.facts[0].confidence, 0.8765);
        assert_eq!(context.character_state.len(), 1);
        assert_eq!(context.character_state[0].character, "许七安");
        assert_eq!(citations.len(), 2);
    }

    #[test]
    fn timeline_sorts_by_narrative_position() {
        let builder = WorldbookBuilder::new(8);
        let mut unknown = scene("prologue", 0, 0, "楔子");
        unknown.chapter_no = None;
        let candidates = vec![
            scene("chapter_0005", 5, 2, "后事"),
            scene("chapter_0001", 1, 3, "前事"),
            unknown,
        ];

        let (context, _) = builder.build(&candidates, &query(None));
        let chapters: Vec<Option<i64>> = context
            .timeline_notes
            .iter()
            .map(|n| n.chapter.as_deref().and_then(crate::pipeline::parse_chapter_no))
            .collect();
        assert_eq!(context.timeline_notes[0].event, "前事");
        assert_eq!(context.timeline_notes[1].event, "后事");
        // Unknown chapter number sorts last.
        assert_eq!(context.timeline_notes[2].event, "楔子");
        assert_eq!(chapters.len(), 3);
    }

    #[test]
    fn forbidden_rules_include_spoiler_line_when_bounded() {
        let builder = WorldbookBuilder::new(8);
        let candidates = vec![scene("chapter_0001", 1, 0, "事")];

        let (open, _) = builder.build(&candidates, &query(None));
        assert_eq!(open.forbidden.len(), 2);

        let (bounded, _) = builder.build(&candidates, &query(Some(10)));
        assert_eq!(bounded.forbidden.len(), 3);
        assert!(bounded.forbidden[2].contains("chapter>10"));
    }

    #[test]
    fn max_facts_truncates_selection() {
        let builder = WorldbookBuilder::new(2);
        let candidates: Vec<RetrievalCandidate> = (0..5)
            .map(|i| scene("chapter_0001", 1, i, &format!("事件{i}")))
            .collect();

        let (context, citations) = builder.build(&candidates, &query(None));
        assert_eq!(context.facts.len(), 2);
        assert_eq!(citations.len(), 2);
    }
}
