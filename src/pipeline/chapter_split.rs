//! Stage 1: split the source text into chapters.

use regex::Regex;

use super::{ChapterEntry, ChapterIndex, JobLog};
use crate::config::ChapterSplitConfig;
use crate::storage::NovelPaths;
use crate::text::{clean_text, read_text_file};
use crate::types::{ChapterStatus, Result, RuntimeError};

/// A chapter span found in the cleaned text.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterSpan {
    pub title: String,
    pub start: usize,
    pub end: usize,
}

/// Find chapter boundaries using every configured pattern. Boundary
/// positions are merged across patterns, sorted, and deduplicated by start
/// offset; each adjacent pair delimits a chapter, the last one ends at
/// end-of-text. Chapters shorter than `min_length` are dropped.
pub fn find_chapters(text: &str, patterns: &[Regex], min_length: usize) -> Vec<ChapterSpan> {
    let mut boundaries: Vec<(usize, String)> = Vec::new();
    for pattern in patterns {
        for m in pattern.find_iter(text) {
            boundaries.push((m.start(), m.as_str().trim().to_string()));
        }
    }
    boundaries.sort_by_key(|(pos, _)| *pos);
    boundaries.dedup_by_key(|(pos, _)| *pos);

    let mut chapters = Vec::new();
    for (i, (start, title)) in boundaries.iter().enumerate() {
        let end = boundaries
            .get(i + 1)
            .map(|(pos, _)| *pos)
            .unwrap_or(text.len());

        let length = end - start;
        if length < min_length {
            tracing::warn!(title = %title, length, "skipping short chapter");
            continue;
        }

        chapters.push(ChapterSpan {
            title: title.clone(),
            start: *start,
            end,
        });
    }
    chapters
}

/// Stage 1 runner.
pub struct ChapterSplitter {
    patterns: Vec<Regex>,
    min_chapter_length: usize,
}

impl ChapterSplitter {
    pub fn new(config: &ChapterSplitConfig) -> Result<Self> {
        let patterns = config
            .patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?m){p}")).map_err(|e| {
                    RuntimeError::invalid("chapter_split.patterns", format!("{p}: {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            patterns,
            min_chapter_length: config.min_chapter_length,
        })
    }

    /// Split the source file and write chapter files plus the manifest.
    /// No-op when the manifest already exists and `force` is unset.
    pub fn run(&self, paths: &NovelPaths, log: &JobLog, force: bool) -> Result<()> {
        if ChapterIndex::exists(&paths.chapters_dir) && !force {
            log.info("chapter index already exists, skipping chapter split");
            return Ok(());
        }

        log.info(format!(
            "reading input file: {}",
            paths.source_file.display()
        ));
        let text = clean_text(&read_text_file(&paths.source_file)?);
        log.info(format!("total text length: {} characters", text.chars().count()));

        let mut spans = find_chapters(&text, &self.patterns, self.min_chapter_length);
        if spans.is_empty() {
            log.warn("no chapter boundary matched, treating entire text as one chapter");
            spans.push(ChapterSpan {
                title: "全文".to_string(),
                start: 0,
                end: text.len(),
            });
        }
        log.info(format!("found {} chapters", spans.len()));

        std::fs::create_dir_all(&paths.chapters_dir)?;

        let mut entries = Vec::with_capacity(spans.len());
        for (i, span) in spans.iter().enumerate() {
            let chapter_id = format!("chapter_{:04}", i + 1);
            let file_name = format!("{chapter_id}.txt");
            let chapter_text = clean_text(&text[span.start..span.end]);

            std::fs::write(paths.chapters_dir.join(&file_name), &chapter_text)?;
            log.info(format!(
                "saved chapter {}: {} ({} chars)",
                i + 1,
                span.title,
                chapter_text.chars().count()
            ));

            entries.push(ChapterEntry {
                chapter_id,
                file: file_name,
                title: span.title.clone(),
                char_count: chapter_text.chars().count(),
                status: ChapterStatus::Pending,
                scenes_file: None,
                annotated_file: None,
            });
        }

        let index = ChapterIndex {
            source_file: paths
                .source_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source.txt".to_string()),
            total_chapters: entries.len(),
            chapters: entries,
        };
        index.save(&paths.chapters_dir)?;

        log.info(format!(
            "chapter index saved to: {}",
            ChapterIndex::path(&paths.chapters_dir).display()
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::StorageLayout;

    fn patterns() -> Vec<Regex> {
        vec![Regex::new(r"(?m)^第[一二三\d]+章.*$").unwrap()]
    }

    #[test]
    fn adjacent_boundaries_delimit_chapters() {
        let text = format!(
            "第一章 开端\n{}\n第二章 转折\n{}",
            "甲".repeat(50),
            "乙".repeat(50)
        );
        let chapters = find_chapters(&text, &patterns(), 10);
        assert_eq!(chapters.len(), 2);
        assert_eq!(chapters[0].title, "第一章 开端");
        assert_eq!(chapters[0].end, chapters[1].start);
        assert_eq!(chapters[1].end, text.len());
    }

    #[test]
    fn short_chapters_are_dropped() {
        let text = format!("第一章 短\n甲\n第二章 长\n{}", "乙".repeat(200));
        let chapters = find_chapters(&text, &patterns(), 100);
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].title, "第二章 长");
    }

    #[test]
    fn duplicate_boundaries_across_patterns_are_merged() {
        let overlapping = vec![
            Regex::new(r"(?m)^第[一二三\d]+章.*$").unwrap(),
            Regex::new(r"(?m)^第.+章.*$").unwrap(),
        ];
        let text = format!("第一章 起\n{}", "文".repeat(100));
        let chapters = find_chapters(&text, &overlapping, 10);
        assert_eq!(chapters.len(), 1);
    }

    fn workspace() -> (tempfile::TempDir, crate::storage::NovelPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(&StorageConfig {
            data_root: tmp.path().join("data"),
            vector_db_root: tmp.path().join("vdb"),
            logs_root: tmp.path().join("logs"),
            database_path: tmp.path().join("db.sqlite3"),
        });
        let paths = layout.ensure_novel_dirs("u1", "n1").unwrap();
        (tmp, paths)
    }

    #[test]
    fn run_writes_files_and_manifest() {
        let (_tmp, paths) = workspace();
        let body = format!(
            "第一章 开端\n{}\n第二章 转折\n{}",
            "甲".repeat(300),
            "乙".repeat(300)
        );
        std::fs::write(&paths.source_file, &body).unwrap();

        let splitter = ChapterSplitter::new(&crate::config::ChapterSplitConfig {
            patterns: vec![r"^第[一二三\d]+章.*$".to_string()],
            min_chapter_length: 50,
        })
        .unwrap();
        splitter.run(&paths, &JobLog::disabled(), false).unwrap();

        let index = ChapterIndex::load(&paths.chapters_dir).unwrap();
        assert_eq!(index.total_chapters, 2);
        assert_eq!(index.chapters[0].chapter_id, "chapter_0001");
        assert_eq!(index.chapters[0].status, ChapterStatus::Pending);
        assert!(paths.chapters_dir.join("chapter_0001.txt").exists());
        assert!(paths.chapters_dir.join("chapter_0002.txt").exists());
    }

    #[test]
    fn rerun_without_force_is_noop() {
        let (_tmp, paths) = workspace();
        std::fs::write(&paths.source_file, format!("第一章 甲\n{}", "文".repeat(300))).unwrap();

        let splitter = ChapterSplitter::new(&crate::config::ChapterSplitConfig {
            patterns: vec![r"^第[一二三\d]+章.*$".to_string()],
            min_chapter_length: 50,
        })
        .unwrap();
        splitter.run(&paths, &JobLog::disabled(), false).unwrap();

        // Mutate the manifest, rerun, and confirm the mutation survives.
        let mut index = ChapterIndex::load(&paths.chapters_dir).unwrap();
        index.chapters[0].status = ChapterStatus::Vectorized;
        index.save(&paths.chapters_dir).unwrap();

        splitter.run(&paths, &JobLog::disabled(), false).unwrap();
        let reloaded = ChapterIndex::load(&paths.chapters_dir).unwrap();
        assert_eq!(reloaded.chapters[0].status, ChapterStatus::Vectorized);
    }

    #[test]
    fn no_boundary_yields_single_full_text_chapter() {
        let (_tmp, paths) = workspace();
        std::fs::write(&paths.source_file, "平铺直叙没有任何章节标题的文本。".repeat(30)).unwrap();

        let splitter = ChapterSplitter::new(&crate::config::ChapterSplitConfig {
            patterns: vec![r"^第[一二三\d]+章.*$".to_string()],
            min_chapter_length: 50,
        })
        .unwrap();
        splitter.run(&paths, &JobLog::disabled(), false).unwrap();

        let index = ChapterIndex::load(&paths.chapters_dir).unwrap();
        assert_eq!(index.total_chapters, 1);
        assert_eq!(index.chapters[0].title, "全文");
    }
}
