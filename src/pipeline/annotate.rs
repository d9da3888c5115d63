//! Stage 3: annotate scenes with structured metadata.
//!
//! Scenes are annotated in batches; short batches go out as one combined
//! prompt, everything else fans out with bounded concurrency. A final pass
//! asks the model for a name canonicalisation map and applies it to every
//! scene.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use super::{
    chapter_id_for, should_run_annotate, ChapterIndex, JobLog, Scene, SceneMetadata, ScenesFile,
    NAME_MAP_FILE,
};
use crate::config::AnnotationConfig;
use crate::models::{ChatProvider, ChatRequest};
use crate::storage::NovelPaths;
use crate::types::{ChapterStatus, Result};

/// Canonical name → aliases, persisted per novel.
pub type NameMap = BTreeMap<String, Vec<String>>;

/// Resolve a name to its canonical form; unknown names pass through.
pub fn canonical_name<'a>(name: &'a str, map: &'a NameMap) -> &'a str {
    if map.contains_key(name) {
        return name;
    }
    for (canonical, aliases) in map {
        if aliases.iter().any(|a| a == name) {
            return canonical;
        }
    }
    name
}

/// Replace aliases with canonical names, deduplicating within each scene
/// while preserving first-occurrence order.
pub fn apply_name_map(scenes: &mut [Scene], map: &NameMap) {
    for scene in scenes {
        if let Some(metadata) = scene.metadata.as_mut() {
            let mut normalized: Vec<String> = Vec::new();
            for name in &metadata.characters {
                let canonical = canonical_name(name, map).to_string();
                if !normalized.contains(&canonical) {
                    normalized.push(canonical);
                }
            }
            metadata.characters = normalized;
        }
    }
}

/// Stage 3 runner.
pub struct SceneAnnotator {
    chat: Arc<dyn ChatProvider>,
    config: AnnotationConfig,
    concurrency: usize,
}

impl SceneAnnotator {
    pub fn new(chat: Arc<dyn ChatProvider>, config: AnnotationConfig, concurrency: usize) -> Self {
        Self {
            chat,
            config,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        paths: &NovelPaths,
        log: &JobLog,
        force: bool,
        redo_chapter: Option<u32>,
    ) -> Result<()> {
        let mut index = ChapterIndex::load(&paths.chapters_dir)?;
        std::fs::create_dir_all(&paths.annotated_dir)?;

        for entry in &mut index.chapters {
            if let Some(redo) = redo_chapter {
                if entry.chapter_id != chapter_id_for(redo) {
                    continue;
                }
            }
            if !should_run_annotate(entry.status, force, redo_chapter.is_some()) {
                if matches!(
                    entry.status,
                    ChapterStatus::AnnotatedDone | ChapterStatus::Vectorized
                ) {
                    log.info(format!("chapter {} already annotated, skipping", entry.chapter_id));
                } else {
                    log.warn(format!("chapter {} scenes not ready, skipping", entry.chapter_id));
                }
                continue;
            }

            let Some(scenes_file) = entry.scenes_file.clone() else {
                log.error(format!("chapter {} has no scenes file", entry.chapter_id));
                entry.status = ChapterStatus::AnnotationFailed;
                continue;
            };

            let scenes_path = paths.scenes_dir.join(&scenes_file);
            match self
                .annotate_chapter(&scenes_path, &entry.chapter_id, &paths.annotated_dir, log)
                .await
            {
                Ok(annotated_file) => {
                    entry.status = ChapterStatus::AnnotatedDone;
                    entry.annotated_file = Some(annotated_file);
                }
                Err(e) => {
                    log.error(format!("failed to annotate chapter {}: {e}", entry.chapter_id));
                    entry.status = ChapterStatus::AnnotationFailed;
                }
            }
        }

        index.save(&paths.chapters_dir)?;
        log.info("annotation complete");
        Ok(())
    }

    async fn annotate_chapter(
        &self,
        scenes_path: &Path,
        chapter_id: &str,
        annotated_dir: &Path,
        log: &JobLog,
    ) -> Result<String> {
        log.info(format!("annotating chapter: {chapter_id}"));
        let mut artifact = ScenesFile::load(scenes_path)?;
        log.info(format!("processing {} scenes", artifact.scenes.len()));

        let scenes = std::mem::take(&mut artifact.scenes);
        let mut annotated: Vec<Scene> = Vec::with_capacity(scenes.len());

        for batch in scenes.chunks(self.config.batch_size.max(1)) {
            let metadatas = self.annotate_batch(batch).await;
            for (scene, metadata) in batch.iter().zip(metadatas) {
                let mut scene = scene.clone();
                scene.metadata = Some(metadata);
                annotated.push(scene);
            }
        }

        // Canonicalise character names across the whole chapter.
        let name_map = self.build_name_map(&annotated, annotated_dir, log).await;
        apply_name_map(&mut annotated, &name_map);

        artifact.scenes = annotated;
        let file_name = format!("{chapter_id}_annotated.json");
        artifact.save(&annotated_dir.join(&file_name))?;
        log.info(format!("saved annotated scenes to {file_name}"));
        Ok(file_name)
    }

    /// Annotate one batch: combined prompt for short scenes, otherwise
    /// per-scene calls with bounded concurrency. Results come back in the
    /// original batch order.
    async fn annotate_batch(&self, batch: &[Scene]) -> Vec<SceneMetadata> {
        let total_chars: usize = batch.iter().map(|s| s.char_count).sum();
        if batch.len() > 1 && total_chars < self.config.short_scene_threshold * batch.len() {
            if let Some(metadatas) = self.annotate_batch_combined(batch).await {
                return metadatas;
            }
            tracing::warn!("combined batch response unusable, annotating individually");
        }

        let prompts: Vec<String> = batch.iter().map(Self::scene_prompt).collect();
        let mut results: Vec<(usize, SceneMetadata)> = stream::iter(prompts.into_iter().enumerate())
            .map(|(i, prompt)| {
                let chat = Arc::clone(&self.chat);
                let model = self.chat.annotate_model().to_string();
                async move {
                    let metadata = match chat
                        .call(ChatRequest::json(prompt).with_model(model))
                        .await
                        .and_then(|out| out.into_json())
                    {
                        Ok(value) => SceneMetadata::from_model_value(&value),
                        Err(e) => {
                            tracing::error!(scene = i, error = %e, "failed to annotate scene");
                            SceneMetadata::fallback()
                        }
                    };
                    (i, metadata)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, m)| m).collect()
    }

    fn scene_prompt(scene: &Scene) -> String {
        format!(
            "请为以下场景片段提取元数据，返回 JSON 格式。\n\n场景文本：\n{}\n\n\
             需要提取的字段：\n\
             - characters: 出场人物名单（数组，使用全名）\n\
             - location: 地点\n\
             - time_description: 时间描述\n\
             - event_summary: 一句话事件概括\n\
             - emotion_tone: 情感基调（如：欢快、悲伤、紧张、平静等）\n\
             - key_dialogues: 重要对白原文（数组，1-3句）\n\
             - character_relations: 人物关系描述（数组）\n\
             - plot_significance: 情节重要性（high/medium/low）\n",
            scene.text
        )
    }

    async fn annotate_batch_combined(&self, batch: &[Scene]) -> Option<Vec<SceneMetadata>> {
        let mut scenes_text = String::new();
        for (i, scene) in batch.iter().enumerate() {
            scenes_text.push_str(&format!("\n\n=== 场景 {} ===\n{}", i + 1, scene.text));
        }
        let prompt = format!(
            "请为以下 {} 个场景片段分别提取元数据，返回 JSON 格式。\n\n场景文本：{}\n\n\
             返回格式为包含 scenes 数组的 JSON，每个场景包含：\n\
             characters、location、time_description、event_summary、emotion_tone、\
             key_dialogues、character_relations、plot_significance(high/medium/low)。\n",
            batch.len(),
            scenes_text
        );

        let model = self.chat.annotate_model().to_string();
        let value = self
            .chat
            .call(ChatRequest::json(prompt).with_model(model))
            .await
            .and_then(|out| out.into_json())
            .ok()?;

        let scenes = value.get("scenes")?.as_array()?;
        if scenes.len() != batch.len() {
            return None;
        }
        Some(scenes.iter().map(SceneMetadata::from_model_value).collect())
    }

    /// Ask the model to merge aliases; persist the map beside the
    /// annotated artifacts. Falls back to an identity map on failure.
    async fn build_name_map(
        &self,
        scenes: &[Scene],
        annotated_dir: &Path,
        log: &JobLog,
    ) -> NameMap {
        let mut all_names: Vec<String> = Vec::new();
        for scene in scenes {
            if let Some(metadata) = &scene.metadata {
                for name in &metadata.characters {
                    if !all_names.contains(name) {
                        all_names.push(name.clone());
                    }
                }
            }
        }
        if all_names.is_empty() {
            return NameMap::new();
        }

        let prompt = format!(
            "以下是从小说中提取的人物名称列表，请将它们归一化，把同一个人物的不同称呼合并。\n\n\
             人物名称：\n{}\n\n\
             返回 JSON 格式的映射表，键是规范全名，值是该人物的所有别名/简称的数组。\n",
            serde_json::to_string(&all_names).unwrap_or_default()
        );

        let model = self.chat.annotate_model().to_string();
        let map = match self
            .chat
            .call(ChatRequest::json(prompt).with_model(model))
            .await
            .and_then(|out| out.into_json())
        {
            Ok(value) => parse_name_map(&value),
            Err(e) => {
                log.error(format!("failed to generate name map: {e}"));
                all_names
                    .iter()
                    .map(|n| (n.clone(), vec![n.clone()]))
                    .collect()
            }
        };

        let map_path = annotated_dir.join(NAME_MAP_FILE);
        match serde_json::to_string_pretty(&map) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&map_path, json) {
                    log.warn(format!("could not persist name map: {e}"));
                } else {
                    log.info(format!("character name map saved to {}", map_path.display()));
                }
            }
            Err(e) => log.warn(format!("could not serialise name map: {e}")),
        }

        map
    }
}

fn parse_name_map(value: &Value) -> NameMap {
    let mut map = NameMap::new();
    if let Some(object) = value.as_object() {
        for (canonical, aliases) in object {
            let canonical = canonical.trim();
            if canonical.is_empty() {
                continue;
            }
            let aliases = aliases
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            map.insert(canonical.to_string(), aliases);
        }
    }
    map
}

/// Load a persisted name map; absent or invalid files read as empty.
pub fn load_name_map(annotated_dir: &Path) -> NameMap {
    let path = annotated_dir.join(NAME_MAP_FILE);
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok())
        .map(|value| parse_name_map(&value))
        .unwrap_or_default()
}
