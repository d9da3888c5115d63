//! Character-profile retrieval channel over the Markdown dossiers.

use std::path::PathBuf;

use super::PROFILE_BASELINE_SCORE;
use crate::rp::{normalize_entities, RetrievalCandidate};
use crate::types::Result;

/// Matches entity names to profile files, exact stem first then substring.
pub struct ProfileRetriever {
    profiles_dir: PathBuf,
}

impl ProfileRetriever {
    pub fn new(profiles_dir: impl Into<PathBuf>) -> Self {
        Self {
            profiles_dir: profiles_dir.into(),
        }
    }

    pub async fn query(&self, entities: &[String], top_k: usize) -> Result<Vec<RetrievalCandidate>> {
        let entities = normalize_entities(entities.iter().map(String::as_str));
        if entities.is_empty() || !self.profiles_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut stems: Vec<String> = std::fs::read_dir(&self.profiles_dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".md"))
            .map(|n| n.trim_end_matches(".md").to_string())
            .collect();
        stems.sort();

        let mut results = Vec::new();
        for entity in &entities {
            let Some(stem) = Self::match_stem(entity, &stems) else {
                continue;
            };
            let path = self.profiles_dir.join(format!("{stem}.md"));
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };

            results.push(RetrievalCandidate::profile(
                &stem,
                &content,
                PROFILE_BASELINE_SCORE,
            ));
            if results.len() >= top_k {
                break;
            }
        }
        Ok(results)
    }

    fn match_stem(entity: &str, stems: &[String]) -> Option<String> {
        if let Some(exact) = stems.iter().find(|s| s.as_str() == entity) {
            return Some(exact.clone());
        }
        stems
            .iter()
            .find(|s| s.contains(entity) || entity.contains(s.as_str()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rp::SourceType;

    fn profiles() -> (tempfile::TempDir, ProfileRetriever) {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("许七安.md"), "# 许七安 - 角色档案\n正文").unwrap();
        std::fs::write(tmp.path().join("魏渊.md"), "# 魏渊 - 角色档案\n正文").unwrap();
        let retriever = ProfileRetriever::new(tmp.path());
        (tmp, retriever)
    }

    #[tokio::test]
    async fn exact_match_wins() {
        let (_tmp, retriever) = profiles();
        let results = retriever.query(&["许七安".to_string()], 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_type, SourceType::Profile);
        assert_eq!(results[0].source_id, "许七安");
        assert_eq!(results[0].semantic_score, PROFILE_BASELINE_SCORE);
        assert_eq!(results[0].characters, vec!["许七安"]);
    }

    #[tokio::test]
    async fn substring_match_falls_back() {
        let (_tmp, retriever) = profiles();
        // Partial name still lands on the dossier.
        let results = retriever.query(&["七安".to_string()], 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source_id, "许七安");
    }

    #[tokio::test]
    async fn unknown_entities_and_missing_dir() {
        let (_tmp, retriever) = profiles();
        assert!(retriever.query(&["无名氏".to_string()], 10).await.unwrap().is_empty());

        let missing = ProfileRetriever::new("/nonexistent/profiles");
        assert!(missing.query(&["许七安".to_string()], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn top_k_bounds_results() {
        let (_tmp, retriever) = profiles();
        let entities = vec!["许七安".to_string(), "魏渊".to_string()];
        let results = retriever.query(&entities, 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }
}
