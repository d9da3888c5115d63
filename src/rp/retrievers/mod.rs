//! The three retrieval channels: semantic, structured filter, profile.

use serde_json::Value;

use super::{RetrievalCandidate, SourceType};
use crate::pipeline::parse_chapter_no;
use crate::text::shorten_text;
use crate::vector::StoredPoint;

mod filter;
mod profile;
mod semantic;

pub use filter::FilterRetriever;
pub use profile::ProfileRetriever;
pub use semantic::SemanticRetriever;

/// Baseline semantic score for entity-matched, filter-only candidates so
/// they still compete in the rerank blend.
pub const FILTER_BASELINE_SCORE: f64 = 0.55;

/// Baseline semantic score for profile evidence.
pub const PROFILE_BASELINE_SCORE: f64 = 0.50;

fn payload_str(payload: &Value, key: &str) -> String {
    payload.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

fn payload_str_list(payload: &Value, key: &str) -> Vec<String> {
    payload
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Convert one stored scene point into the unified candidate shape.
pub(crate) fn candidate_from_point(point: &StoredPoint, semantic_score: f64) -> RetrievalCandidate {
    let payload = &point.payload;
    let chapter = payload
        .get("chapter")
        .and_then(Value::as_str)
        .map(str::to_string);
    let chapter_no = payload
        .get("chapter_no")
        .and_then(Value::as_i64)
        .or_else(|| chapter.as_deref().and_then(parse_chapter_no));
    let text = payload_str(payload, "text");

    RetrievalCandidate {
        source_type: SourceType::Scene,
        source_id: point.id.clone(),
        excerpt: shorten_text(&text, 180),
        text,
        chapter,
        chapter_no,
        scene_index: payload.get("scene_index").and_then(Value::as_i64),
        chapter_title: payload_str(payload, "chapter_title"),
        scene_summary: payload_str(payload, "scene_summary"),
        event_summary: payload_str(payload, "event_summary"),
        characters: payload_str_list(payload, "characters"),
        location: payload_str(payload, "location"),
        semantic_score,
        entity_overlap: 0.0,
        narrative_fit: 0.0,
        recency_in_session: 0.0,
        final_score: 0.0,
    }
}
