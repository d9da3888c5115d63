//! Rule-based query understanding.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::session::SessionState;
use super::{normalize_entities, tokenize_keywords, Intent, QueryConstraints, QueryUnderstanding};
use crate::pipeline::annotate::{load_name_map, NameMap};

fn location_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            "[\\x{4e00}-\\x{9fff}]{1,10}(?:城|府|宫|寺|山|谷|楼|馆|堂|门|营|州|郡|村|镇|客栈|书院|牢房|驿站)",
        )
        .expect("valid regex")
    })
}

/// One conversation turn as passed by API callers.
#[derive(Debug, Clone)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Extracts intent, entities, locations, and constraints from one query.
pub struct QueryUnderstandingService {
    intent_rules: Vec<(Intent, Vec<&'static str>)>,
    /// Alias → canonical, alias-first lookup order preserved.
    alias_pairs: Vec<(String, String)>,
    character_names: Vec<String>,
}

impl QueryUnderstandingService {
    /// Build the entity dictionary from profile filenames and the novel's
    /// persisted name map.
    pub fn new(profiles_dir: &Path, annotated_dir: &Path) -> Self {
        let mut names: Vec<String> = Vec::new();
        let mut alias_pairs: Vec<(String, String)> = Vec::new();

        if let Ok(entries) = std::fs::read_dir(profiles_dir) {
            let mut files: Vec<String> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|n| n.ends_with(".md"))
                .collect();
            files.sort();
            for file in files {
                let canonical = file.trim_end_matches(".md").trim().to_string();
                if !canonical.is_empty() {
                    names.push(canonical.clone());
                    alias_pairs.push((canonical.clone(), canonical));
                }
            }
        }

        let name_map: NameMap = load_name_map(annotated_dir);
        for (canonical, aliases) in &name_map {
            names.push(canonical.clone());
            alias_pairs.push((canonical.clone(), canonical.clone()));
            for alias in aliases {
                alias_pairs.push((alias.clone(), canonical.clone()));
            }
        }

        Self {
            intent_rules: vec![
                (
                    Intent::CharacterRelation,
                    vec!["关系", "什么关系", "谁和谁", "是否认识", "立场"],
                ),
                (
                    Intent::LocationQuery,
                    vec!["在哪", "哪里", "地点", "去过", "位于", "方位"],
                ),
                (
                    Intent::CanonCheck,
                    vec!["设定", "依据", "证据", "原文", "真实吗", "是否属实"],
                ),
                (
                    Intent::NextAction,
                    vec!["下一步", "接下来", "怎么办", "如何行动", "建议"],
                ),
                (
                    Intent::StoryRecap,
                    vec!["回顾", "总结", "之前", "经过", "复盘", "发生了什么"],
                ),
            ],
            character_names: normalize_entities(names),
            alias_pairs,
        }
    }

    /// Parse one user query into a structured representation.
    pub fn understand(
        &self,
        message: &str,
        history: &[HistoryTurn],
        session: &SessionState,
        unlocked_chapter: Option<i64>,
        active_characters: Option<&[String]>,
    ) -> QueryUnderstanding {
        let text = message.trim();

        let intent = self.detect_intent(text);
        let entities = self.extract_entities(text, history, session, active_characters);
        let locations = self.extract_locations(text);
        let event_keywords = tokenize_keywords(text);

        let effective_unlocked = unlocked_chapter.unwrap_or(session.max_unlocked_chapter);

        let constraints = QueryConstraints {
            unlocked_chapter: Some(effective_unlocked),
            active_characters: normalize_entities(
                active_characters
                    .map(|a| a.to_vec())
                    .unwrap_or_else(|| session.active_characters.clone()),
            ),
            location_hints: locations.clone(),
        };

        // Fold the tail of the conversation into the query the embedder sees.
        let normalized_query = if history.is_empty() {
            text.to_string()
        } else {
            let mut parts: Vec<&str> = history
                .iter()
                .rev()
                .take(3)
                .map(|t| t.content.as_str())
                .collect();
            parts.reverse();
            parts.push(text);
            parts.join("\n").trim().to_string()
        };

        QueryUnderstanding {
            intent,
            normalized_query,
            entities,
            locations,
            event_keywords,
            constraints,
        }
    }

    fn detect_intent(&self, text: &str) -> Intent {
        let lowered = text.to_lowercase();
        for (intent, keywords) in &self.intent_rules {
            if keywords.iter().any(|k| text.contains(k) || lowered.contains(k)) {
                return *intent;
            }
        }
        Intent::StoryRecap
    }

    fn extract_entities(
        &self,
        text: &str,
        history: &[HistoryTurn],
        session: &SessionState,
        active_characters: Option<&[String]>,
    ) -> Vec<String> {
        let mut matched: Vec<String> = Vec::new();

        for (alias, canonical) in &self.alias_pairs {
            if !alias.is_empty() && text.contains(alias.as_str()) {
                matched.push(canonical.clone());
            }
        }

        if matched.is_empty() {
            for name in &self.character_names {
                if !name.is_empty() && text.contains(name.as_str()) {
                    matched.push(name.clone());
                }
            }
        }

        if matched.is_empty() {
            if let Some(actives) = active_characters {
                matched.extend(actives.iter().cloned());
            }
        }

        if matched.is_empty() {
            matched.extend(session.active_characters.iter().cloned());
        }

        if matched.is_empty() && !history.is_empty() {
            let tail: Vec<&str> = history
                .iter()
                .rev()
                .take(4)
                .map(|t| t.content.as_str())
                .collect();
            let history_text = tail.join("\n");
            for (alias, canonical) in &self.alias_pairs {
                if !alias.is_empty() && history_text.contains(alias.as_str()) {
                    matched.push(canonical.clone());
                }
            }
        }

        normalize_entities(matched)
    }

    fn extract_locations(&self, text: &str) -> Vec<String> {
        normalize_entities(
            location_regex()
                .find_iter(text)
                .map(|m| m.as_str().to_string()),
        )
    }
}
