//! Structured filter retrieval channel over payload indexes.

use std::sync::Arc;

use super::{candidate_from_point, FILTER_BASELINE_SCORE};
use crate::rp::RetrievalCandidate;
use crate::types::Result;
use crate::vector::{MatchAnyFilter, VectorIndex};

/// Recalls candidates by character/location payload matches. Shares the
/// semantic retriever's store handle; a missing collection reads as empty
/// (filter recall is opportunistic).
pub struct FilterRetriever {
    index: Arc<dyn VectorIndex>,
}

impl FilterRetriever {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }

    pub async fn query(
        &self,
        entities: &[String],
        locations: &[String],
        top_k: usize,
        unlocked_chapter: Option<i64>,
    ) -> Result<Vec<RetrievalCandidate>> {
        let filter = MatchAnyFilter::new()
            .match_any("characters", entities)
            .match_any("location", locations);
        if filter.is_empty() {
            return Ok(Vec::new());
        }

        let points = self.index.scroll_filtered(filter, top_k).await?;

        Ok(points
            .iter()
            .map(|point| candidate_from_point(point, FILTER_BASELINE_SCORE))
            .filter(|candidate| match (candidate.chapter_no, unlocked_chapter) {
                (Some(no), Some(unlocked)) => no <= unlocked,
                _ => true,
            })
            .collect())
    }
}
