//! Stage 5: synthesise per-character Markdown dossiers.
//!
//! Scans every annotated chapter, keeps the most frequent characters, and
//! asks the chat model for an eight-section profile grounded in a bounded
//! evidence excerpt.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::{JobLog, ScenesFile};
use crate::config::CharacterProfileConfig;
use crate::models::{ChatProvider, ChatRequest};
use crate::storage::NovelPaths;
use crate::types::{PlotSignificance, Result, RuntimeError};

/// Evidence budget per profile prompt.
const MAX_EVIDENCE_SCENES: usize = 100;

/// One scene appearance of a character, aggregated across chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterScene {
    pub chapter_id: String,
    pub chapter_title: String,
    pub scene_index: usize,
    pub event_summary: String,
    pub emotion_tone: String,
    pub key_dialogues: Vec<String>,
    pub character_relations: Vec<String>,
    pub plot_significance: PlotSignificance,
}

/// Collect every character's scene appearances from the annotated dir.
pub fn collect_character_scenes(annotated_dir: &Path) -> Result<HashMap<String, Vec<CharacterScene>>> {
    let mut by_character: HashMap<String, Vec<CharacterScene>> = HashMap::new();

    let entries = std::fs::read_dir(annotated_dir)?;
    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with("_annotated.json"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    for path in files {
        let artifact = ScenesFile::load(&path)?;
        for scene in &artifact.scenes {
            let Some(metadata) = &scene.metadata else {
                continue;
            };
            for character in &metadata.characters {
                by_character
                    .entry(character.clone())
                    .or_default()
                    .push(CharacterScene {
                        chapter_id: artifact.chapter_id.clone(),
                        chapter_title: artifact.chapter_title.clone(),
                        scene_index: scene.scene_index,
                        event_summary: metadata.event_summary.clone(),
                        emotion_tone: metadata.emotion_tone.clone(),
                        key_dialogues: metadata.key_dialogues.clone(),
                        character_relations: metadata.character_relations.clone(),
                        plot_significance: metadata.plot_significance,
                    });
            }
        }
    }

    Ok(by_character)
}

/// Top-N characters by appearance count, requiring the configured minimum.
/// Ties break by name for determinism.
pub fn select_top_characters(
    by_character: &HashMap<String, Vec<CharacterScene>>,
    top_n: usize,
    min_scenes: usize,
) -> Vec<String> {
    let mut counted: Vec<(&String, usize)> = by_character
        .iter()
        .map(|(name, scenes)| (name, scenes.len()))
        .filter(|(_, count)| *count >= min_scenes)
        .collect();
    counted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    counted
        .into_iter()
        .take(top_n)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Bound the evidence excerpt: all `high` significance scenes first, then
/// `medium` up to the budget.
pub fn select_evidence(scenes: &[CharacterScene]) -> Vec<&CharacterScene> {
    if scenes.len() <= MAX_EVIDENCE_SCENES {
        return scenes.iter().collect();
    }

    let high: Vec<&CharacterScene> = scenes
        .iter()
        .filter(|s| s.plot_significance == PlotSignificance::High)
        .collect();
    if high.len() >= MAX_EVIDENCE_SCENES {
        return high.into_iter().take(MAX_EVIDENCE_SCENES).collect();
    }

    let mut selected = high;
    let remaining = MAX_EVIDENCE_SCENES - selected.len();
    selected.extend(
        scenes
            .iter()
            .filter(|s| s.plot_significance == PlotSignificance::Medium)
            .take(remaining),
    );
    selected
}

fn sanitize_file_stem(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}

/// Stage 5 runner.
pub struct CharacterProfiler {
    chat: Arc<dyn ChatProvider>,
    config: CharacterProfileConfig,
    concurrency: usize,
}

impl CharacterProfiler {
    pub fn new(
        chat: Arc<dyn ChatProvider>,
        config: CharacterProfileConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            chat,
            config,
            concurrency: concurrency.max(1),
        }
    }

    /// Generate profiles for the kept characters; returns the file count.
    pub async fn run(&self, paths: &NovelPaths, log: &JobLog) -> Result<usize> {
        if !paths.annotated_dir.is_dir() {
            return Err(RuntimeError::Integrity(format!(
                "annotated dir not found: {}",
                paths.annotated_dir.display()
            )));
        }
        std::fs::create_dir_all(&paths.profiles_dir)?;

        log.info("collecting character data from all chapters");
        let by_character = collect_character_scenes(&paths.annotated_dir)?;
        let top = select_top_characters(
            &by_character,
            self.config.top_n_characters,
            self.config.min_scenes,
        );
        log.info(format!("generating profiles for {} characters", top.len()));

        let results: Vec<Option<String>> = stream::iter(top.into_iter())
            .map(|character| {
                let scenes = by_character.get(&character).cloned().unwrap_or_default();
                let chat = Arc::clone(&self.chat);
                let profiles_dir = paths.profiles_dir.clone();
                async move {
                    match generate_profile(chat, &character, &scenes, &profiles_dir).await {
                        Ok(file) => Some(file),
                        Err(e) => {
                            tracing::error!(character = %character, error = %e, "profile generation failed");
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let generated = results.into_iter().flatten().count();
        log.info(format!("generated {generated} character profiles"));
        Ok(generated)
    }
}

async fn generate_profile(
    chat: Arc<dyn ChatProvider>,
    character: &str,
    scenes: &[CharacterScene],
    profiles_dir: &Path,
) -> Result<String> {
    let evidence = select_evidence(scenes);

    let mut scene_lines: Vec<String> = Vec::with_capacity(evidence.len());
    for scene in &evidence {
        let mut line = format!("[{}] {}", scene.chapter_title, scene.event_summary);
        if !scene.emotion_tone.is_empty() {
            line.push_str(&format!(" (情感: {})", scene.emotion_tone));
        }
        if !scene.key_dialogues.is_empty() {
            let sampled: Vec<&str> = scene
                .key_dialogues
                .iter()
                .take(2)
                .map(String::as_str)
                .collect();
            line.push_str(&format!("\n  对白: {}", sampled.join("; ")));
        }
        scene_lines.push(line);
    }

    let mut relations: Vec<String> = Vec::new();
    for scene in scenes {
        for relation in &scene.character_relations {
            if !relations.contains(relation) {
                relations.push(relation.clone());
            }
        }
    }
    let relations_text = if relations.is_empty() {
        "无".to_string()
    } else {
        relations.join("\n")
    };

    let prompt = format!(
        "请为小说角色 \"{character}\" 生成详细的角色档案，用于后续的角色扮演。\n\n\
         角色在小说中的场景记录（按章节顺序）：\n\n{scenes}\n\n\
         角色关系：\n{relations}\n\n\
         请生成包含以下内容的角色档案：\n\
         1. **基本信息与身份**\n\
         2. **核心性格特征**（列出3-5个特点，每个附原文佐证）\n\
         3. **说话风格与语气**（附2-3个典型对白示例）\n\
         4. **情感反应模式**\n\
         5. **关键经历时间线**\n\
         6. **核心人物关系**\n\
         7. **内心动机**（核心渴望与主要恐惧）\n\
         8. **角色扮演注意事项**\n\n\
         请用 Markdown 格式输出，要详细且有深度。\n",
        scenes = scene_lines.join("\n\n"),
        relations = relations_text,
    );

    let body = chat
        .call(ChatRequest::text(prompt).with_temperature(0.7))
        .await?
        .into_text()?;

    let file_name = format!("{}.md", sanitize_file_stem(character));
    let content = format!(
        "# {character} - 角色档案\n\n**出场次数**: {}\n\n---\n\n{body}",
        scenes.len()
    );
    std::fs::write(profiles_dir.join(&file_name), content)?;
    tracing::info!(character = %character, file = %file_name, "saved profile");
    Ok(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::ScriptedChatProvider;

    fn character_scene(significance: PlotSignificance, chapter: &str) -> CharacterScene {
        CharacterScene {
            chapter_id: chapter.to_string(),
            chapter_title: format!("{chapter} 标题"),
            scene_index: 0,
            event_summary: "事件".to_string(),
            emotion_tone: "平静".to_string(),
            key_dialogues: vec!["对白一".to_string()],
            character_relations: vec!["甲与乙是同僚".to_string()],
            plot_significance: significance,
        }
    }

    #[test]
    fn top_character_selection_enforces_minimum_and_order() {
        let mut by_character = HashMap::new();
        by_character.insert(
            "许七安".to_string(),
            vec![character_scene(PlotSignificance::High, "chapter_0001"); 5],
        );
        by_character.insert(
            "朱县令".to_string(),
            vec![character_scene(PlotSignificance::Low, "chapter_0001"); 3],
        );
        by_character.insert(
            "路人".to_string(),
            vec![character_scene(PlotSignificance::Low, "chapter_0001"); 1],
        );

        let top = select_top_characters(&by_character, 10, 2);
        assert_eq!(top, vec!["许七安", "朱县令"]);

        let top_one = select_top_characters(&by_character, 1, 2);
        assert_eq!(top_one, vec!["许七安"]);
    }

    #[test]
    fn evidence_prefers_high_significance_within_budget() {
        let mut scenes = vec![character_scene(PlotSignificance::High, "chapter_0001"); 40];
        scenes.extend(vec![character_scene(PlotSignificance::Medium, "chapter_0002"); 120]);
        scenes.extend(vec![character_scene(PlotSignificance::Low, "chapter_0003"); 50]);

        let evidence = select_evidence(&scenes);
        assert_eq!(evidence.len(), MAX_EVIDENCE_SCENES);
        let high = evidence
            .iter()
            .filter(|s| s.plot_significance == PlotSignificance::High)
            .count();
        assert_eq!(high, 40);
        assert!(evidence
            .iter()
            .all(|s| s.plot_significance != PlotSignificance::Low));
    }

    #[test]
    fn small_scene_sets_pass_through() {
        let scenes = vec![character_scene(PlotSignificance::Low, "chapter_0001"); 3];
        assert_eq!(select_evidence(&scenes).len(), 3);
    }

    #[tokio::test]
    async fn run_writes_profile_files() {
        use crate::config::StorageConfig;
        use crate::pipeline::{Scene, SceneMetadata};
        use crate::storage::StorageLayout;

        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(&StorageConfig {
            data_root: tmp.path().join("data"),
            vector_db_root: tmp.path().join("vdb"),
            logs_root: tmp.path().join("logs"),
            database_path: tmp.path().join("db.sqlite3"),
        });
        let paths = layout.ensure_novel_dirs("u1", "n1").unwrap();

        let scenes: Vec<Scene> = (0..3)
            .map(|i| Scene {
                scene_index: i,
                text: "正文".to_string(),
                char_count: 2,
                scene_summary: String::new(),
                metadata: Some(SceneMetadata {
                    characters: vec!["许七安".to_string()],
                    event_summary: format!("事件{i}"),
                    ..SceneMetadata::fallback()
                }),
            })
            .collect();
        ScenesFile {
            source_file: "chapter_0001.txt".to_string(),
            chapter_id: "chapter_0001".to_string(),
            chapter_title: "第一章".to_string(),
            total_scenes: scenes.len(),
            coverage_rate: 1.0,
            scenes,
        }
        .save(&paths.annotated_dir.join("chapter_0001_annotated.json"))
        .unwrap();

        let profiler = CharacterProfiler::new(
            Arc::new(ScriptedChatProvider::with_text(vec!["## 档案正文"])),
            CharacterProfileConfig {
                top_n_characters: 5,
                min_scenes: 2,
            },
            2,
        );

        let count = profiler.run(&paths, &JobLog::disabled()).await.unwrap();
        assert_eq!(count, 1);

        let content =
            std::fs::read_to_string(paths.profiles_dir.join("许七安.md")).unwrap();
        assert!(content.starts_with("# 许七安 - 角色档案"));
        assert!(content.contains("**出场次数**: 3"));
        assert!(content.contains("## 档案正文"));
    }

    #[test]
    fn file_stems_are_sanitized() {
        assert_eq!(sanitize_file_stem("a/b\\c"), "a_b_c");
    }
}
