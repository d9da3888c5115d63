//! Stage 2: split chapters into scenes with model-returned markers.
//!
//! The chat model proposes `{start_marker, end_marker, scene_summary}`
//! triples quoted from the chapter text; markers are located with the
//! fuzzy locator, then the scene set is repaired for coverage and length
//! before being written out.

use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;

use super::{
    chapter_id_for, should_run_scene_split, ChapterIndex, JobLog, Scene, ScenesFile,
};
use crate::config::SceneSplitConfig;
use crate::models::{ChatProvider, ChatRequest};
use crate::storage::NovelPaths;
use crate::text::fuzzy::{fuzzy_find, validate_marker_order, FuzzyOptions};
use crate::text::{find_sentence_end, read_text_file, text_markers};
use crate::types::{ChapterStatus, Result};

/// Marker triple returned by the model for one scene.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SceneMarker {
    #[serde(default)]
    pub start_marker: String,
    #[serde(default)]
    pub end_marker: String,
    #[serde(default)]
    pub scene_summary: String,
}

/// Stage 2 runner.
pub struct SceneSplitter {
    chat: Arc<dyn ChatProvider>,
    config: SceneSplitConfig,
    fuzzy: FuzzyOptions,
}

impl SceneSplitter {
    pub fn new(chat: Arc<dyn ChatProvider>, config: SceneSplitConfig) -> Self {
        let fuzzy = FuzzyOptions::with_threshold(config.fuzzy_threshold);
        Self {
            chat,
            config,
            fuzzy,
        }
    }

    /// Process every chapter the status gate admits, updating the manifest.
    pub async fn run(
        &self,
        paths: &NovelPaths,
        log: &JobLog,
        force: bool,
        redo_chapter: Option<u32>,
    ) -> Result<()> {
        let mut index = ChapterIndex::load(&paths.chapters_dir)?;
        std::fs::create_dir_all(&paths.scenes_dir)?;

        for entry in &mut index.chapters {
            if let Some(redo) = redo_chapter {
                if entry.chapter_id != chapter_id_for(redo) {
                    continue;
                }
            }
            if !should_run_scene_split(entry.status, force, redo_chapter.is_some()) {
                log.info(format!("chapter {} already processed, skipping", entry.chapter_id));
                continue;
            }

            let chapter_file = paths.chapters_dir.join(&entry.file);
            match self
                .split_chapter(&chapter_file, &entry.chapter_id, &entry.title, &paths.scenes_dir, log)
                .await
            {
                Ok(scenes_file) => {
                    entry.status = ChapterStatus::ScenesDone;
                    entry.scenes_file = Some(scenes_file);
                    // Downstream artifacts are stale after a re-split.
                    entry.annotated_file = None;
                }
                Err(e) => {
                    log.error(format!("failed to split chapter {}: {e}", entry.chapter_id));
                    entry.status = ChapterStatus::ScenesFailed;
                }
            }
        }

        index.save(&paths.chapters_dir)?;
        log.info("scene split complete");
        Ok(())
    }

    /// Split one chapter and write its scenes artifact; returns the file name.
    async fn split_chapter(
        &self,
        chapter_file: &Path,
        chapter_id: &str,
        chapter_title: &str,
        scenes_dir: &Path,
        log: &JobLog,
    ) -> Result<String> {
        log.info(format!("processing chapter: {chapter_id} - {chapter_title}"));

        let text = read_text_file(chapter_file)?;
        let chapter_len = text.chars().count();
        log.info(format!("chapter length: {chapter_len} characters"));

        let estimated_scenes = (chapter_len / self.config.target_length).max(1);

        let markers = match self.request_markers(&text, estimated_scenes).await {
            Ok(markers) if !markers.is_empty() => markers,
            Ok(_) | Err(_) => {
                log.warn("marker request failed or empty, using length-based fallback split");
                self.fallback_markers(&text)
            }
        };

        let mut scenes = self.extract_scenes(&text, &markers, log);

        let mut coverage = coverage_rate(&text, &scenes);
        log.info(format!("coverage: {:.1}%", coverage * 100.0));
        if coverage < self.config.coverage_threshold {
            log.warn("coverage below threshold, adding missing segments");
            scenes = self.fill_missing_segments(&text, scenes);
            coverage = coverage_rate(&text, &scenes);
            log.info(format!("coverage after filling: {:.1}%", coverage * 100.0));
        }

        scenes = self.repair_lengths(scenes, log);
        for (i, scene) in scenes.iter_mut().enumerate() {
            scene.scene_index = i;
        }

        let artifact = ScenesFile {
            source_file: chapter_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            chapter_id: chapter_id.to_string(),
            chapter_title: chapter_title.to_string(),
            total_scenes: scenes.len(),
            coverage_rate: coverage,
            scenes,
        };

        let file_name = format!("{chapter_id}_scenes.json");
        artifact.save(&scenes_dir.join(&file_name))?;
        log.info(format!("saved {} scenes to {file_name}", artifact.total_scenes));
        Ok(file_name)
    }

    async fn request_markers(&self, text: &str, estimated_scenes: usize) -> Result<Vec<SceneMarker>> {
        let prompt = format!(
            "请将以下章节文本按场景切分，返回每个场景的起止标记。\n\n\
             切分标准：\n1. 地点变化\n2. 时间跳跃\n3. 人物组合变化\n4. 事件转换\n\n\
             目标：每个场景约 {target} 字，最少 {min} 字，最多 {max} 字。\n\
             预估需要切分成 {estimated_scenes} 个左右的场景。\n\n\
             文本：\n{text}\n\n\
             返回 JSON 格式，包含 scenes 数组，每个场景包含：\n\
             - start_marker: 场景开头的一句原文（15-30字）\n\
             - end_marker: 场景结尾的一句原文（15-30字）\n\
             - scene_summary: 一句话概括场景内容\n",
            target = self.config.target_length,
            min = self.config.min_length,
            max = self.config.max_length,
        );

        let response = self.chat.call(ChatRequest::json(prompt)).await?.into_json()?;
        let markers = response
            .get("scenes")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(markers).unwrap_or_default())
    }

    /// Length-based fallback when the model call fails: equal-sized scenes
    /// extended to sentence boundaries.
    fn fallback_markers(&self, text: &str) -> Vec<SceneMarker> {
        let mut markers = Vec::new();
        let chars: Vec<(usize, char)> = text.char_indices().collect();
        let mut pos = 0usize; // char offset

        while pos < chars.len() {
            let next_char = (pos + self.config.target_length).min(chars.len());
            let mut next_byte = if next_char < chars.len() {
                chars[next_char].0
            } else {
                text.len()
            };
            if next_byte < text.len() {
                next_byte = find_sentence_end(text, next_byte);
            }

            let start_byte = chars[pos].0;
            let segment = &text[start_byte..next_byte];
            let (start_marker, end_marker) = text_markers(segment, 30);

            markers.push(SceneMarker {
                start_marker,
                end_marker,
                scene_summary: format!("场景片段 {}", markers.len() + 1),
            });

            pos = chars
                .iter()
                .position(|(b, _)| *b >= next_byte)
                .unwrap_or(chars.len());
        }

        markers
    }

    /// Resolve markers to byte ranges and cut out the scene texts.
    fn extract_scenes(&self, text: &str, markers: &[SceneMarker], log: &JobLog) -> Vec<Scene> {
        let mut scenes: Vec<Scene> = Vec::new();

        for (i, marker) in markers.iter().enumerate() {
            let mut start_pos = None;
            let mut end_pos = None;

            // Prefer the jointly validated pair when both markers resolve.
            if !marker.start_marker.is_empty() && !marker.end_marker.is_empty() {
                let (s, e, valid) =
                    validate_marker_order(text, &marker.start_marker, &marker.end_marker, self.fuzzy);
                if valid {
                    start_pos = s;
                    end_pos = e;
                }
            }

            if start_pos.is_none() {
                start_pos = fuzzy_find(text, &marker.start_marker, self.fuzzy);
            }
            if end_pos.is_none() {
                end_pos = fuzzy_find(text, &marker.end_marker, self.fuzzy);
            }

            let Some(start) = start_pos else {
                log.warn(format!(
                    "could not find start marker for scene {i}: {}",
                    crate::text::shorten_text(&marker.start_marker, 50)
                ));
                continue;
            };

            let end = match end_pos {
                Some(end) => end,
                None => {
                    log.warn(format!(
                        "could not find end marker for scene {i}: {}",
                        crate::text::shorten_text(&marker.end_marker, 50)
                    ));
                    // Use the next scene's start as this scene's end.
                    if i + 1 < markers.len() {
                        match fuzzy_find(text, &markers[i + 1].start_marker, self.fuzzy) {
                            Some(next_start) if next_start > 0 => {
                                floor_char_boundary(text, next_start - 1)
                            }
                            _ => continue,
                        }
                    } else {
                        text.len()
                    }
                }
            };

            if start >= end {
                log.warn(format!("invalid marker positions for scene {i}"));
                continue;
            }

            let end = find_sentence_end(text, end).min(text.len());
            let scene_text = text[start..end].trim().to_string();
            let char_count = scene_text.chars().count();

            scenes.push(Scene {
                scene_index: scenes.len(),
                text: scene_text,
                char_count,
                scene_summary: marker.scene_summary.clone(),
                metadata: None,
            });
        }

        scenes
    }

    /// Interleave uncovered gaps longer than half the minimum scene length
    /// as additional scenes, in position order.
    fn fill_missing_segments(&self, text: &str, scenes: Vec<Scene>) -> Vec<Scene> {
        if scenes.is_empty() {
            return vec![Scene {
                scene_index: 0,
                text: text.to_string(),
                char_count: text.chars().count(),
                scene_summary: "完整章节".to_string(),
                metadata: None,
            }];
        }

        // Anchor each scene by the position of its leading snippet.
        let mut positioned: Vec<(usize, Scene)> = scenes
            .into_iter()
            .filter_map(|scene| {
                let probe: String = scene.text.chars().take(50).collect();
                text.find(&probe).map(|pos| (pos, scene))
            })
            .collect();
        positioned.sort_by_key(|(pos, _)| *pos);

        let min_gap = self.config.min_length / 2;
        let mut filled: Vec<Scene> = Vec::new();
        let mut cursor = 0usize;

        for (pos, mut scene) in positioned {
            cursor = floor_char_boundary(text, cursor.min(text.len()));
            if pos > cursor {
                let gap_text = text[cursor..pos].trim();
                if gap_text.chars().count() > min_gap {
                    filled.push(Scene {
                        scene_index: filled.len(),
                        text: gap_text.to_string(),
                        char_count: gap_text.chars().count(),
                        scene_summary: format!("补充片段 {}", filled.len()),
                        metadata: None,
                    });
                }
            }
            cursor = (pos + scene.text.len()).max(cursor);
            scene.scene_index = filled.len();
            filled.push(scene);
        }

        cursor = floor_char_boundary(text, cursor.min(text.len()));
        if cursor < text.len() {
            let gap_text = text[cursor..].trim();
            if gap_text.chars().count() > min_gap {
                filled.push(Scene {
                    scene_index: filled.len(),
                    text: gap_text.to_string(),
                    char_count: gap_text.chars().count(),
                    scene_summary: format!("补充片段 {}", filled.len()),
                    metadata: None,
                });
            }
        }

        filled
    }

    /// Split scenes above 1.5× the maximum at paragraph boundaries; merge
    /// scenes below 0.5× the minimum into their predecessor.
    fn repair_lengths(&self, scenes: Vec<Scene>, log: &JobLog) -> Vec<Scene> {
        let too_long = (self.config.max_length * 3) / 2;
        let too_short = self.config.min_length / 2;
        let last = scenes.len().saturating_sub(1);

        let mut fixed: Vec<Scene> = Vec::new();
        for (i, scene) in scenes.into_iter().enumerate() {
            if scene.char_count > too_long {
                log.warn(format!("scene {i} too long ({}), splitting", scene.char_count));
                fixed.extend(self.split_long_scene(scene));
            } else if scene.char_count < too_short && i > 0 && i < last {
                log.warn(format!(
                    "scene {i} too short ({}), merging with previous",
                    scene.char_count
                ));
                match fixed.last_mut() {
                    Some(prev) => {
                        prev.text.push('\n');
                        prev.text.push_str(&scene.text);
                        prev.char_count = prev.text.chars().count();
                        prev.scene_summary.push_str("; ");
                        prev.scene_summary.push_str(&scene.scene_summary);
                    }
                    None => fixed.push(scene),
                }
            } else {
                fixed.push(scene);
            }
        }

        for (i, scene) in fixed.iter_mut().enumerate() {
            scene.scene_index = i;
        }
        fixed
    }

    fn split_long_scene(&self, scene: Scene) -> Vec<Scene> {
        let paragraphs: Vec<&str> = scene
            .text
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();

        let mut sub_scenes: Vec<Scene> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0usize;

        let mut flush = |current: &mut Vec<&str>, sub_scenes: &mut Vec<Scene>| {
            if current.is_empty() {
                return;
            }
            let text = current.join("\n\n");
            sub_scenes.push(Scene {
                scene_index: sub_scenes.len(),
                char_count: text.chars().count(),
                text,
                scene_summary: format!("{} (部分{})", scene.scene_summary, sub_scenes.len() + 1),
                metadata: None,
            });
            current.clear();
        };

        for paragraph in paragraphs {
            let len = paragraph.chars().count();
            if current_len + len > self.config.target_length && !current.is_empty() {
                flush(&mut current, &mut sub_scenes);
                current_len = 0;
            }
            current.push(paragraph);
            current_len += len;
        }
        flush(&mut current, &mut sub_scenes);

        if sub_scenes.is_empty() {
            vec![scene]
        } else {
            sub_scenes
        }
    }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Fraction of the chapter text covered by the union of scene texts.
pub fn coverage_rate(chapter_text: &str, scenes: &[Scene]) -> f64 {
    let original: usize = chapter_text.chars().count();
    if original == 0 {
        return 0.0;
    }
    let covered: usize = scenes.iter().map(|s| s.char_count).sum();
    covered as f64 / original as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::ScriptedChatProvider;

    fn config() -> SceneSplitConfig {
        SceneSplitConfig {
            min_length: 40,
            max_length: 200,
            target_length: 100,
            coverage_threshold: 0.9,
            fuzzy_threshold: 0.7,
        }
    }

    fn splitter_with(chat: ScriptedChatProvider) -> SceneSplitter {
        SceneSplitter::new(Arc::new(chat), config())
    }

    fn chapter_text() -> String {
        let a = "许七安清晨起身练刀，院子里霜色未散，他反复揣摩着昨夜的刀意。".repeat(3);
        let b = "到了衙门，宋捕头召集众人商议税银失窃案，线索指向城南的废弃宅院。".repeat(3);
        format!("{a}\n\n{b}")
    }

    #[test]
    fn exact_markers_cut_scenes() {
        let text = chapter_text();
        let splitter = splitter_with(ScriptedChatProvider::failing());
        let markers = vec![
            SceneMarker {
                start_marker: "许七安清晨起身练刀".to_string(),
                end_marker: "揣摩着昨夜的刀意。".to_string(),
                scene_summary: "晨练".to_string(),
            },
            SceneMarker {
                start_marker: "到了衙门".to_string(),
                end_marker: "城南的废弃宅院。".to_string(),
                scene_summary: "议案".to_string(),
            },
        ];
        let scenes = splitter.extract_scenes(&text, &markers, &JobLog::disabled());
        assert_eq!(scenes.len(), 2);
        assert!(scenes[0].text.starts_with("许七安"));
        assert!(scenes[1].text.starts_with("到了衙门"));
        assert_eq!(scenes[0].scene_index, 0);
        assert_eq!(scenes[1].scene_index, 1);
    }

    #[test]
    fn missing_end_marker_borrows_next_start() {
        let text = chapter_text();
        let splitter = splitter_with(ScriptedChatProvider::failing());
        let markers = vec![
            SceneMarker {
                start_marker: "许七安清晨起身练刀".to_string(),
                end_marker: "这句话根本不存在于文本之中绝无匹配".to_string(),
                scene_summary: "晨练".to_string(),
            },
            SceneMarker {
                start_marker: "到了衙门".to_string(),
                end_marker: "城南的废弃宅院。".to_string(),
                scene_summary: "议案".to_string(),
            },
        ];
        let scenes = splitter.extract_scenes(&text, &markers, &JobLog::disabled());
        assert_eq!(scenes.len(), 2);
        assert!(scenes[0].text.starts_with("许七安"));
        assert!(scenes[1].text.starts_with("到了衙门"));
    }

    #[test]
    fn coverage_fill_interleaves_gaps_in_order() {
        let text = chapter_text();
        let splitter = splitter_with(ScriptedChatProvider::failing());

        // Only the second half is covered; the first half becomes a gap scene.
        let covered: String = {
            let idx = text.find("到了衙门").unwrap();
            text[idx..].trim().to_string()
        };
        let scenes = vec![Scene {
            scene_index: 0,
            char_count: covered.chars().count(),
            text: covered,
            scene_summary: "议案".to_string(),
            metadata: None,
        }];

        let filled = splitter.fill_missing_segments(&text, scenes);
        assert_eq!(filled.len(), 2);
        assert!(filled[0].scene_summary.starts_with("补充片段"));
        assert!(filled[0].text.starts_with("许七安"));
        assert_eq!(filled[1].scene_summary, "议案");
        assert!(coverage_rate(&text, &filled) > 0.9);
    }

    #[test]
    fn overlong_scenes_split_at_paragraphs() {
        let splitter = splitter_with(ScriptedChatProvider::failing());
        let paragraph = "这一段文字describes一个完整的段落内容并且足够长。".repeat(4);
        let long_text = format!("{paragraph}\n\n{paragraph}\n\n{paragraph}\n\n{paragraph}");
        let scene = Scene {
            scene_index: 0,
            char_count: long_text.chars().count(),
            text: long_text,
            scene_summary: "长场景".to_string(),
            metadata: None,
        };
        assert!(scene.char_count > 300);

        let fixed = splitter.repair_lengths(vec![scene], &JobLog::disabled());
        assert!(fixed.len() > 1);
        for (i, s) in fixed.iter().enumerate() {
            assert_eq!(s.scene_index, i);
            assert!(s.scene_summary.contains("部分"));
        }
    }

    #[test]
    fn short_middle_scene_merges_into_predecessor() {
        let splitter = splitter_with(ScriptedChatProvider::failing());
        let scenes = vec![
            Scene {
                scene_index: 0,
                text: "前".repeat(100),
                char_count: 100,
                scene_summary: "一".to_string(),
                metadata: None,
            },
            Scene {
                scene_index: 1,
                text: "短".repeat(10),
                char_count: 10,
                scene_summary: "二".to_string(),
                metadata: None,
            },
            Scene {
                scene_index: 2,
                text: "后".repeat(100),
                char_count: 100,
                scene_summary: "三".to_string(),
                metadata: None,
            },
        ];

        let fixed = splitter.repair_lengths(scenes, &JobLog::disabled());
        assert_eq!(fixed.len(), 2);
        assert!(fixed[0].text.contains('短'));
        assert_eq!(fixed[0].scene_summary, "一; 二");
        assert_eq!(fixed[1].scene_index, 1);
    }

    #[test]
    fn fallback_markers_cover_whole_text() {
        let splitter = splitter_with(ScriptedChatProvider::failing());
        let text = chapter_text();
        let markers = splitter.fallback_markers(&text);
        assert!(!markers.is_empty());
        assert!(markers[0].scene_summary.starts_with("场景片段"));
    }

    #[tokio::test]
    async fn run_updates_manifest_statuses() {
        use crate::config::StorageConfig;
        use crate::storage::StorageLayout;
        use crate::types::ChapterStatus;

        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(&StorageConfig {
            data_root: tmp.path().join("data"),
            vector_db_root: tmp.path().join("vdb"),
            logs_root: tmp.path().join("logs"),
            database_path: tmp.path().join("db.sqlite3"),
        });
        let paths = layout.ensure_novel_dirs("u1", "n1").unwrap();

        let text = chapter_text();
        std::fs::write(paths.chapters_dir.join("chapter_0001.txt"), &text).unwrap();
        let index = ChapterIndex {
            source_file: "source.txt".to_string(),
            total_chapters: 1,
            chapters: vec![super::super::ChapterEntry {
                chapter_id: "chapter_0001".to_string(),
                file: "chapter_0001.txt".to_string(),
                title: "第一章".to_string(),
                char_count: text.chars().count(),
                status: ChapterStatus::Pending,
                scenes_file: None,
                annotated_file: None,
            }],
        };
        index.save(&paths.chapters_dir).unwrap();

        // Model fails: the fallback splitter still produces scenes_done.
        let splitter = splitter_with(ScriptedChatProvider::failing());
        splitter
            .run(&paths, &JobLog::disabled(), false, None)
            .await
            .unwrap();

        let updated = ChapterIndex::load(&paths.chapters_dir).unwrap();
        assert_eq!(updated.chapters[0].status, ChapterStatus::ScenesDone);
        let scenes_file = updated.chapters[0].scenes_file.clone().unwrap();
        let artifact = ScenesFile::load(&paths.scenes_dir.join(scenes_file)).unwrap();
        assert!(artifact.total_scenes > 0);
        assert!(artifact.coverage_rate > 0.8);
    }
}
