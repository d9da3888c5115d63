//! The five-stage ingestion pipeline.
//!
//! Stages communicate exclusively through the per-novel chapter index
//! manifest (`chapter_index.json`) and the artifact files it references.
//! The manifest is the sole source of truth for stage progress.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::types::{ChapterStatus, PlotSignificance, Result, RuntimeError};

pub mod annotate;
pub mod chapter_split;
pub mod log;
pub mod profile;
pub mod runner;
pub mod scene_split;
pub mod vectorize;

pub use log::JobLog;
pub use runner::{PipelineRunSpec, PipelineRunner};

pub const CHAPTER_INDEX_FILE: &str = "chapter_index.json";
pub const NAME_MAP_FILE: &str = "character_name_map.json";

/// One chapter record in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterEntry {
    pub chapter_id: String,
    pub file: String,
    pub title: String,
    pub char_count: usize,
    pub status: ChapterStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenes_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_file: Option<String>,
}

/// Per-novel manifest created by stage 1 and updated by stages 2–4.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterIndex {
    pub source_file: String,
    pub total_chapters: usize,
    pub chapters: Vec<ChapterEntry>,
}

impl ChapterIndex {
    pub fn path(chapters_dir: &Path) -> PathBuf {
        chapters_dir.join(CHAPTER_INDEX_FILE)
    }

    pub fn load(chapters_dir: &Path) -> Result<Self> {
        let path = Self::path(chapters_dir);
        let text = std::fs::read_to_string(&path).map_err(|_| {
            RuntimeError::Integrity(format!("chapter index not found: {}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, chapters_dir: &Path) -> Result<()> {
        let path = Self::path(chapters_dir);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn exists(chapters_dir: &Path) -> bool {
        Self::path(chapters_dir).exists()
    }
}

/// LLM-derived scene tags. Model output is validated leniently: missing or
/// malformed fields take documented defaults so one bad response never
/// stalls a chapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneMetadata {
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub time_description: String,
    #[serde(default)]
    pub event_summary: String,
    #[serde(default)]
    pub emotion_tone: String,
    #[serde(default)]
    pub key_dialogues: Vec<String>,
    #[serde(default)]
    pub character_relations: Vec<String>,
    #[serde(default)]
    pub plot_significance: PlotSignificance,
}

impl SceneMetadata {
    /// All-defaults metadata attached when a model call fails outright.
    pub fn fallback() -> Self {
        Self {
            characters: Vec::new(),
            location: "未知".to_string(),
            time_description: "未知".to_string(),
            event_summary: "场景描述".to_string(),
            emotion_tone: "中性".to_string(),
            key_dialogues: Vec::new(),
            character_relations: Vec::new(),
            plot_significance: PlotSignificance::Medium,
        }
    }

    /// Replace empty required fields with their defaults.
    pub fn fill_defaults(&mut self) {
        let defaults = Self::fallback();
        if self.location.trim().is_empty() {
            self.location = defaults.location;
        }
        if self.time_description.trim().is_empty() {
            self.time_description = defaults.time_description;
        }
        if self.event_summary.trim().is_empty() {
            self.event_summary = defaults.event_summary;
        }
        if self.emotion_tone.trim().is_empty() {
            self.emotion_tone = defaults.emotion_tone;
        }
    }

    /// Lenient conversion from raw model output. Fields with the wrong
    /// type are dropped to defaults; `plot_significance` outside the enum
    /// becomes `medium`.
    pub fn from_model_value(value: &Value) -> Self {
        let string_list = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .filter(|s| !s.trim().is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        let string_field =
            |key: &str| -> String { value.get(key).and_then(Value::as_str).unwrap_or("").to_string() };

        let plot_significance = value
            .get("plot_significance")
            .and_then(Value::as_str)
            .and_then(|s| match s {
                "high" => Some(PlotSignificance::High),
                "medium" => Some(PlotSignificance::Medium),
                "low" => Some(PlotSignificance::Low),
                _ => None,
            })
            .unwrap_or_default();

        let mut metadata = Self {
            characters: string_list("characters"),
            location: string_field("location"),
            time_description: string_field("time_description"),
            event_summary: string_field("event_summary"),
            emotion_tone: string_field("emotion_tone"),
            key_dialogues: string_list("key_dialogues"),
            character_relations: string_list("character_relations"),
            plot_significance,
        };
        metadata.fill_defaults();
        metadata
    }
}

/// One narrative scene within a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub scene_index: usize,
    pub text: String,
    pub char_count: usize,
    #[serde(default)]
    pub scene_summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SceneMetadata>,
}

/// Artifact written by stage 2 (and enriched in place by stage 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenesFile {
    pub source_file: String,
    pub chapter_id: String,
    pub chapter_title: String,
    pub total_scenes: usize,
    pub coverage_rate: f64,
    pub scenes: Vec<Scene>,
}

impl ScenesFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|_| {
            RuntimeError::Integrity(format!("scenes file not found: {}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Status gate for stage 2. Downstream states are never regressed by a
/// default rerun; `force`/`redo_chapter` override.
pub fn should_run_scene_split(status: ChapterStatus, force: bool, redo: bool) -> bool {
    if force || redo {
        return true;
    }
    !matches!(
        status,
        ChapterStatus::ScenesDone | ChapterStatus::AnnotatedDone | ChapterStatus::Vectorized
    )
}

/// Status gate for stage 3: scenes must exist even under `force`.
pub fn should_run_annotate(status: ChapterStatus, force: bool, redo: bool) -> bool {
    if force || redo {
        return matches!(
            status,
            ChapterStatus::ScenesDone
                | ChapterStatus::AnnotatedDone
                | ChapterStatus::AnnotationFailed
                | ChapterStatus::Vectorized
                | ChapterStatus::VectorizeFailed
        );
    }
    status == ChapterStatus::ScenesDone
}

/// Status gate for stage 4: annotations must exist even under `force`.
pub fn should_run_vectorize(status: ChapterStatus, force: bool) -> bool {
    if force {
        return matches!(
            status,
            ChapterStatus::AnnotatedDone
                | ChapterStatus::Vectorized
                | ChapterStatus::VectorizeFailed
        );
    }
    status == ChapterStatus::AnnotatedDone
}

/// `redo_chapter: 3` targets `chapter_0003` only.
pub fn chapter_id_for(redo_chapter: u32) -> String {
    format!("chapter_{redo_chapter:04}")
}

/// Parse the numeric chapter index out of a chapter id. Ids without a
/// digit run have no chapter number; callers that must persist a value
/// write 0, and the spoiler filter keeps both forms.
pub fn parse_chapter_no(chapter_id: &str) -> Option<i64> {
    let digits: String = chapter_id
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
