//! Core types shared across the runtime.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::{Result, RuntimeError};

/// Opaque identifier for a pipeline job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Chapter processing status recorded in the chapter index manifest.
///
/// The manifest is the sole source of truth for stage progress; each stage
/// advances the status of the chapters it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    ScenesDone,
    ScenesFailed,
    AnnotatedDone,
    AnnotationFailed,
    Vectorized,
    VectorizeFailed,
}

impl ChapterStatus {
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            ChapterStatus::ScenesFailed
                | ChapterStatus::AnnotationFailed
                | ChapterStatus::VectorizeFailed
        )
    }
}

impl std::fmt::Display for ChapterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChapterStatus::Pending => "pending",
            ChapterStatus::ScenesDone => "scenes_done",
            ChapterStatus::ScenesFailed => "scenes_failed",
            ChapterStatus::AnnotatedDone => "annotated_done",
            ChapterStatus::AnnotationFailed => "annotation_failed",
            ChapterStatus::Vectorized => "vectorized",
            ChapterStatus::VectorizeFailed => "vectorize_failed",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Whether the job still occupies the single-job slot.
    pub fn is_live(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(RuntimeError::invalid("job status", other)),
        }
    }
}

/// Lifecycle status of a novel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NovelStatus {
    Created,
    Uploaded,
    Processing,
    Ready,
    Failed,
    Deleted,
}

impl NovelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NovelStatus::Created => "created",
            NovelStatus::Uploaded => "uploaded",
            NovelStatus::Processing => "processing",
            NovelStatus::Ready => "ready",
            NovelStatus::Failed => "failed",
            NovelStatus::Deleted => "deleted",
        }
    }
}

impl std::str::FromStr for NovelStatus {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(NovelStatus::Created),
            "uploaded" => Ok(NovelStatus::Uploaded),
            "processing" => Ok(NovelStatus::Processing),
            "ready" => Ok(NovelStatus::Ready),
            "failed" => Ok(NovelStatus::Failed),
            "deleted" => Ok(NovelStatus::Deleted),
            other => Err(RuntimeError::invalid("novel status", other)),
        }
    }
}

/// Novel visibility. Only `(owner, private|public)` is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            other => Err(RuntimeError::invalid(
                "visibility",
                format!("must be 'private' or 'public', got '{other}'"),
            )),
        }
    }
}

/// Plot significance assigned by the scene annotator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlotSignificance {
    High,
    #[default]
    Medium,
    Low,
}

impl PlotSignificance {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlotSignificance::High => "high",
            PlotSignificance::Medium => "medium",
            PlotSignificance::Low => "low",
        }
    }
}
