//! Stage 4: embed annotated scenes and upsert them into the vector store.

use serde_json::Value;
use std::sync::Arc;

use super::{
    parse_chapter_no, should_run_vectorize, ChapterIndex, JobLog, Scene, ScenesFile,
};
use crate::models::EmbeddingProvider;
use crate::storage::NovelPaths;
use crate::types::{ChapterStatus, Result, RuntimeError};
use crate::vector::{build_point_id, ScenePoint, VectorIndex};

/// Closed tag set inferred from keyword presence; `剧情` is the default.
const ENTITY_TAG_RULES: [(&str, &[&str]); 4] = [
    ("办案", &["案", "捕", "审", "衙门", "查"]),
    ("朝堂", &["朝", "帝", "官", "奏", "殿", "京城"]),
    ("修行", &["修行", "功法", "元神", "佛门", "道门", "气机"]),
    ("战斗", &["战", "军", "兵", "杀"]),
];

/// Infer coarse tags from the union of summaries and raw text.
pub fn infer_entity_tags(scene: &Scene) -> Vec<String> {
    let metadata = scene.metadata.as_ref();
    let haystack = format!(
        "{} {} {}",
        metadata.map(|m| m.event_summary.as_str()).unwrap_or(""),
        scene.scene_summary,
        scene.text
    );

    let mut tags: Vec<String> = ENTITY_TAG_RULES
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k)))
        .map(|(tag, _)| tag.to_string())
        .collect();

    if tags.is_empty() {
        tags.push("剧情".to_string());
    }
    tags.sort();
    tags
}

/// Embedding input: summary, characters, and location prepended to the
/// scene text so sparse queries still land.
pub fn augmented_text(scene: &Scene) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(metadata) = &scene.metadata {
        if !metadata.event_summary.is_empty() {
            parts.push(metadata.event_summary.clone());
        }
        if !metadata.characters.is_empty() {
            parts.push(metadata.characters.join(" "));
        }
        if !metadata.location.is_empty() {
            parts.push(metadata.location.clone());
        }
    }
    parts.push(scene.text.clone());
    parts.join("\n")
}

/// Full point payload mirrored from the scene and its chapter context.
pub fn scene_payload(scene: &Scene, chapter_id: &str, chapter_title: &str) -> Value {
    let chapter_no = parse_chapter_no(chapter_id).unwrap_or(0);
    let metadata = scene.metadata.clone().unwrap_or_else(super::SceneMetadata::fallback);

    serde_json::json!({
        "text": scene.text,
        "chapter": chapter_id,
        "chapter_no": chapter_no,
        "chapter_title": chapter_title,
        "scene_index": scene.scene_index,
        "scene_summary": scene.scene_summary,
        "char_count": scene.char_count,
        "characters": metadata.characters,
        "location": metadata.location,
        "time_description": metadata.time_description,
        "event_summary": metadata.event_summary,
        "emotion_tone": metadata.emotion_tone,
        "key_dialogues": metadata.key_dialogues,
        "character_relations": metadata.character_relations,
        "plot_significance": metadata.plot_significance,
        "aliases": metadata.characters,
        "entity_tags": infer_entity_tags(scene),
        "spoiler_level": chapter_no,
    })
}

/// Stage 4 runner.
pub struct SceneVectorizer {
    embedding: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
}

impl SceneVectorizer {
    pub fn new(embedding: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        Self { embedding, index }
    }

    pub async fn run(&self, paths: &NovelPaths, log: &JobLog, force: bool) -> Result<()> {
        let mut manifest = ChapterIndex::load(&paths.chapters_dir)?;
        self.index.ensure_collection().await?;

        let mut total_scenes = 0usize;
        for entry in &mut manifest.chapters {
            if entry.status == ChapterStatus::Vectorized && !force {
                log.info(format!("chapter {} already vectorized, skipping", entry.chapter_id));
                continue;
            }
            if !should_run_vectorize(entry.status, force) {
                log.warn(format!("chapter {} not annotated, skipping", entry.chapter_id));
                continue;
            }

            let Some(annotated_file) = entry.annotated_file.clone() else {
                log.error(format!("chapter {} has no annotated file", entry.chapter_id));
                entry.status = ChapterStatus::VectorizeFailed;
                continue;
            };

            let annotated_path = paths.annotated_dir.join(&annotated_file);
            match self.vectorize_chapter(&annotated_path, log).await {
                Ok(count) => {
                    entry.status = ChapterStatus::Vectorized;
                    total_scenes += count;
                }
                Err(e) => {
                    log.error(format!(
                        "failed to vectorize chapter {}: {e}",
                        entry.chapter_id
                    ));
                    entry.status = ChapterStatus::VectorizeFailed;
                }
            }
        }

        manifest.save(&paths.chapters_dir)?;
        log.info(format!("vectorization complete, {total_scenes} scenes upserted"));
        Ok(())
    }

    /// Vectorize one chapter. The number of returned vectors must match
    /// the number of scenes; existing chapter points are deleted before
    /// the single batched upsert.
    async fn vectorize_chapter(&self, annotated_path: &std::path::Path, log: &JobLog) -> Result<usize> {
        let artifact = ScenesFile::load(annotated_path)?;
        let chapter_id = artifact.chapter_id.clone();
        log.info(format!(
            "vectorizing {} scenes from {chapter_id}",
            artifact.scenes.len()
        ));

        let texts: Vec<String> = artifact.scenes.iter().map(augmented_text).collect();
        let embeddings = self.embedding.embed(&texts).await?;

        if embeddings.len() != artifact.scenes.len() {
            return Err(RuntimeError::Integrity(format!(
                "embedding count mismatch: {} != {}",
                embeddings.len(),
                artifact.scenes.len()
            )));
        }

        self.index.delete_by_chapter(&chapter_id).await?;

        let points: Vec<ScenePoint> = artifact
            .scenes
            .iter()
            .zip(embeddings)
            .map(|(scene, vector)| ScenePoint {
                id: build_point_id(&chapter_id, scene.scene_index as i64),
                vector,
                payload: scene_payload(scene, &chapter_id, &artifact.chapter_title),
            })
            .collect();

        let count = points.len();
        self.index.upsert_points(points).await?;
        log.info(format!("uploaded {count} points to collection"));
        Ok(count)
    }
}
