//! Drives pipeline stages against one novel's workspace.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use super::annotate::SceneAnnotator;
use super::chapter_split::ChapterSplitter;
use super::profile::CharacterProfiler;
use super::scene_split::SceneSplitter;
use super::vectorize::SceneVectorizer;
use super::{ChapterIndex, JobLog};
use crate::config::RuntimeConfig;
use crate::models::{ChatProvider, EmbeddingProvider};
use crate::novels::NovelsService;
use crate::storage::NovelPaths;
use crate::types::{Result, RuntimeError};
use crate::vector::VectorIndexProvider;

/// What to run: one step, or the full 1..5 sequence when `step` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineRunSpec {
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub redo_chapter: Option<u32>,
}

impl PipelineRunSpec {
    pub fn validate(&self) -> Result<()> {
        if let Some(step) = self.step {
            if !(1..=5).contains(&step) {
                return Err(RuntimeError::invalid("step", "must be in [1, 5]"));
            }
        }
        Ok(())
    }

    pub fn single_step(step: u32) -> Self {
        Self {
            step: Some(step),
            ..Self::default()
        }
    }
}

/// Stage orchestration for one process; model and vector providers are
/// injected once at construction.
pub struct PipelineRunner {
    config: RuntimeConfig,
    novels: NovelsService,
    chat: Arc<dyn ChatProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorIndexProvider>,
    concurrency: usize,
}

impl PipelineRunner {
    pub fn new(
        config: RuntimeConfig,
        novels: NovelsService,
        chat: Arc<dyn ChatProvider>,
        embedding: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorIndexProvider>,
    ) -> Self {
        let concurrency = config.llm.concurrent_requests.max(1);
        Self {
            config,
            novels,
            chat,
            embedding,
            vectors,
            concurrency,
        }
    }

    /// Run the requested step (or all five) for one novel. Returns a small
    /// stats summary merged into the job result and the novel record.
    pub async fn run(
        &self,
        novel_id: &str,
        spec: &PipelineRunSpec,
        log: &JobLog,
    ) -> Result<Value> {
        spec.validate()?;
        let paths = self.novels.paths(novel_id)?;
        let started = Instant::now();

        self.check_preconditions(spec, &paths)?;

        let steps: Vec<u32> = match spec.step {
            Some(step) => vec![step],
            None => (1..=5).collect(),
        };

        let mut stats = serde_json::json!({ "novel_id": novel_id });
        for step in steps {
            self.run_step(step, novel_id, spec, &paths, log).await?;
            if step == 5 {
                stats["profiles_generated"] = count_profiles(&paths).into();
            }
        }

        // Derive summary stats from the manifest when present.
        if ChapterIndex::exists(&paths.chapters_dir) {
            let index = ChapterIndex::load(&paths.chapters_dir)?;
            stats["total_chapters"] = index.total_chapters.into();
            stats["chapters_vectorized"] = index
                .chapters
                .iter()
                .filter(|c| c.status == crate::types::ChapterStatus::Vectorized)
                .count()
                .into();
            stats["chapters_failed"] = index
                .chapters
                .iter()
                .filter(|c| c.status.is_failed())
                .count()
                .into();
        }
        stats["profiles_total"] = count_profiles(&paths).into();
        stats["elapsed_s"] =
            ((started.elapsed().as_secs_f64() * 100.0).round() / 100.0).into();

        log.info(format!("novel pipeline finished: {stats}"));
        Ok(stats)
    }

    fn check_preconditions(&self, spec: &PipelineRunSpec, paths: &NovelPaths) -> Result<()> {
        let needs_input = spec.step.is_none() || spec.step == Some(1);
        if needs_input && !paths.source_file.exists() {
            return Err(RuntimeError::Integrity(format!(
                "novel source file not found: {}",
                paths.source_file.display()
            )));
        }

        if let Some(step) = spec.step {
            if step >= 2 && !ChapterIndex::exists(&paths.chapters_dir) {
                return Err(RuntimeError::Integrity(format!(
                    "chapter index not found: {} (run step 1 first)",
                    ChapterIndex::path(&paths.chapters_dir).display()
                )));
            }
            if step == 5 && !paths.annotated_dir.is_dir() {
                return Err(RuntimeError::Integrity(format!(
                    "annotated dir not found: {} (run step 3 first)",
                    paths.annotated_dir.display()
                )));
            }
        }
        Ok(())
    }

    async fn run_step(
        &self,
        step: u32,
        novel_id: &str,
        spec: &PipelineRunSpec,
        paths: &NovelPaths,
        log: &JobLog,
    ) -> Result<()> {
        match step {
            1 => ChapterSplitter::new(&self.config.chapter_split)?.run(paths, log, spec.force),
            2 => {
                SceneSplitter::new(Arc::clone(&self.chat), self.config.scene_split.clone())
                    .run(paths, log, spec.force, spec.redo_chapter)
                    .await
            }
            3 => {
                SceneAnnotator::new(
                    Arc::clone(&self.chat),
                    self.config.annotation.clone(),
                    self.concurrency,
                )
                .run(paths, log, spec.force, spec.redo_chapter)
                .await
            }
            4 => {
                let index = self.vectors.index_for(novel_id)?;
                SceneVectorizer::new(Arc::clone(&self.embedding), index)
                    .run(paths, log, spec.force)
                    .await
            }
            5 => {
                CharacterProfiler::new(
                    Arc::clone(&self.chat),
                    self.config.character_profile.clone(),
                    self.concurrency,
                )
                .run(paths, log)
                .await
                .map(|_| ())
            }
            other => Err(RuntimeError::invalid("step", format!("unknown step {other}"))),
        }
    }
}

fn count_profiles(paths: &NovelPaths) -> usize {
    std::fs::read_dir(&paths.profiles_dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .extension()
                        .map(|ext| ext.eq_ignore_ascii_case("md"))
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_validation_bounds_step() {
        assert!(PipelineRunSpec::single_step(1).validate().is_ok());
        assert!(PipelineRunSpec::single_step(5).validate().is_ok());
        assert!(PipelineRunSpec::single_step(0).validate().is_err());
        assert!(PipelineRunSpec::single_step(6).validate().is_err());
        assert!(PipelineRunSpec::default().validate().is_ok());
    }

    #[test]
    fn spec_deserialises_from_request_body() {
        let spec: PipelineRunSpec =
            serde_json::from_str(r#"{"step": 2, "force": true, "redo_chapter": 7}"#).unwrap();
        assert_eq!(spec.step, Some(2));
        assert!(spec.force);
        assert_eq!(spec.redo_chapter, Some(7));

        let empty: PipelineRunSpec = serde_json::from_str("{}").unwrap();
        assert!(empty.step.is_none());
        assert!(!empty.force);
    }
}
