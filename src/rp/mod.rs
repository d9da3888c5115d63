//! Role-play query side: understanding, retrieval fusion, worldbook.

use serde::{Deserialize, Serialize};

pub mod guardrails;
pub mod orchestrator;
pub mod rerank;
pub mod retrievers;
pub mod service;
pub mod session;
pub mod understanding;
pub mod worldbook;

pub use guardrails::Guardrails;
pub use orchestrator::{RetrievalDebug, RetrievalOrchestrator};
pub use rerank::Reranker;
pub use service::{RpQueryService, RpServiceRouter};
pub use session::{SessionState, SessionStore};
pub use understanding::QueryUnderstandingService;
pub use worldbook::{WorldbookBuilder, WorldbookContext};

/// Chinese/English stop words filtered out of event keywords.
const STOP_WORDS: [&str; 38] = [
    "的", "了", "是", "在", "我", "你", "他", "她", "它", "我们", "你们", "他们", "她们",
    "它们", "和", "与", "及", "或", "并", "就", "都", "也", "很", "还", "吗", "呢", "啊",
    "吧", "么", "如何", "怎么", "什么", "哪个", "哪些", "这个", "那个", "这里", "那里",
];

/// Query intent, detected by keyword rules in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    CharacterRelation,
    LocationQuery,
    CanonCheck,
    NextAction,
    StoryRecap,
}

/// Retrieval constraints inferred from the request and session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryConstraints {
    pub unlocked_chapter: Option<i64>,
    pub active_characters: Vec<String>,
    pub location_hints: Vec<String>,
}

/// Structured representation of one user query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryUnderstanding {
    pub intent: Intent,
    pub normalized_query: String,
    pub entities: Vec<String>,
    pub locations: Vec<String>,
    pub event_keywords: Vec<String>,
    pub constraints: QueryConstraints,
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Scene,
    Profile,
}

/// Unified evidence unit across the three retrieval channels.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalCandidate {
    pub source_type: SourceType,
    pub source_id: String,
    pub text: String,
    pub chapter: Option<String>,
    pub chapter_no: Option<i64>,
    pub scene_index: Option<i64>,
    pub chapter_title: String,
    pub scene_summary: String,
    pub event_summary: String,
    pub characters: Vec<String>,
    pub location: String,
    pub excerpt: String,

    pub semantic_score: f64,
    pub entity_overlap: f64,
    pub narrative_fit: f64,
    pub recency_in_session: f64,
    pub final_score: f64,
}

impl RetrievalCandidate {
    pub fn profile(source_id: &str, text: &str, semantic_score: f64) -> Self {
        Self {
            source_type: SourceType::Profile,
            source_id: source_id.to_string(),
            excerpt: crate::text::shorten_text(text, 180),
            text: text.to_string(),
            chapter: None,
            chapter_no: None,
            scene_index: None,
            chapter_title: String::new(),
            scene_summary: String::new(),
            event_summary: String::new(),
            characters: vec![source_id.to_string()],
            location: String::new(),
            semantic_score,
            entity_overlap: 0.0,
            narrative_fit: 0.0,
            recency_in_session: 0.0,
            final_score: 0.0,
        }
    }

    /// Collision key for cross-channel deduplication.
    pub fn dedupe_key(&self) -> String {
        match self.source_type {
            SourceType::Scene => format!(
                "scene:{}:{}",
                self.chapter.as_deref().unwrap_or(""),
                self.scene_index.map(|i| i.to_string()).unwrap_or_default()
            ),
            SourceType::Profile => format!("profile:{}", self.source_id),
        }
    }

    pub fn citation(&self) -> Citation {
        Citation {
            source_type: self.source_type,
            source_id: self.source_id.clone(),
            chapter: self.chapter.clone(),
            scene_index: self.scene_index,
            chapter_title: self.chapter_title.clone(),
            excerpt: self.excerpt.clone(),
        }
    }
}

/// One evidence citation returned with every grounded answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source_type: SourceType,
    pub source_id: String,
    pub chapter: Option<String>,
    pub scene_index: Option<i64>,
    #[serde(default)]
    pub chapter_title: String,
    #[serde(default)]
    pub excerpt: String,
}

/// Deduplicate strings preserving first-occurrence order; trims and drops
/// empties.
pub fn normalize_entities<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: Vec<String> = Vec::new();
    for value in values {
        let item = value.as_ref().trim();
        if item.is_empty() || seen.iter().any(|s| s == item) {
            continue;
        }
        seen.push(item.to_string());
    }
    seen
}

/// Extract coarse keywords from Chinese/ASCII mixed text: CJK chunks of
/// two or more characters plus ASCII word tokens, stop-word filtered,
/// deduplicated in order.
pub fn tokenize_keywords(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();

    let mut push = |token: String| {
        if !STOP_WORDS.contains(&token.as_str()) && !tokens.contains(&token) {
            tokens.push(token);
        }
    };

    let mut cjk = String::new();
    let mut ascii = String::new();
    for c in text.chars().chain(std::iter::once(' ')) {
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            if !ascii.is_empty() {
                if ascii.len() >= 2 && ascii.chars().next().is_some_and(|f| f.is_ascii_alphabetic()) {
                    push(ascii.to_lowercase());
                }
                ascii.clear();
            }
            cjk.push(c);
        } else {
            if cjk.chars().count() >= 2 {
                push(std::mem::take(&mut cjk));
            } else {
                cjk.clear();
            }
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                ascii.push(c);
            } else if !ascii.is_empty() {
                if ascii.len() >= 2 && ascii.chars().next().is_some_and(|f| f.is_ascii_alphabetic()) {
                    push(ascii.to_lowercase());
                }
                ascii.clear();
            }
        }
    }

    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_entities_dedupes_in_order() {
        let out = normalize_entities(["许七安", " 朱县令 ", "", "许七安", "婉儿"]);
        assert_eq!(out, vec!["许七安", "朱县令", "婉儿"]);
    }

    #[test]
    fn keywords_mix_cjk_and_ascii() {
        let tokens = tokenize_keywords("许七安在京城查案, using RAG-v2 pipeline 的方法");
        assert!(tokens.contains(&"许七安".to_string()));
        assert!(tokens.contains(&"京城查案".to_string()));
        assert!(tokens.contains(&"rag-v2".to_string()));
        assert!(tokens.contains(&"pipeline".to_string()));
        // Stop words and single characters are dropped.
        assert!(!tokens.iter().any(|t| t == "的" || t == "在"));
    }

    #[test]
    fn keywords_dedupe_preserving_order() {
        let tokens = tokenize_keywords("查案 查案 复盘 查案");
        assert_eq!(tokens, vec!["查案", "复盘"]);
    }

    #[test]
    fn dedupe_keys_distinguish_sources() {
        let mut scene = RetrievalCandidate::profile("ignored", "text", 0.5);
        scene.source_type = SourceType::Scene;
        scene.chapter = Some("chapter_0001".to_string());
        scene.scene_index = Some(2);
        assert_eq!(scene.dedupe_key(), "scene:chapter_0001:2");

        let profile = RetrievalCandidate::profile("许七安", "dossier", 0.5);
        assert_eq!(profile.dedupe_key(), "profile:许七安");
    }
}
