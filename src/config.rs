//! Configuration for the runtime.
//!
//! All sections carry serde defaults so a partial YAML file is enough to
//! boot a development instance.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration parsing error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Main runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector_db: VectorDbConfig,
    pub chapter_split: ChapterSplitConfig,
    pub scene_split: SceneSplitConfig,
    pub annotation: AnnotationConfig,
    pub character_profile: CharacterProfileConfig,
    pub rp_query: RpQueryConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
}

/// Chat model provider (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    /// Cheaper model used for high-volume scene annotation.
    pub annotate_model: String,
    pub max_retries: u32,
    /// Base back-off in seconds; attempt N waits `retry_delay * N`.
    pub retry_delay_secs: u64,
    pub rate_limit_per_minute: u32,
    pub concurrent_requests: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o".to_string(),
            annotate_model: "gpt-4o-mini".to_string(),
            max_retries: 3,
            retry_delay_secs: 2,
            rate_limit_per_minute: 30,
            concurrent_requests: 4,
            timeout_secs: 120,
        }
    }
}

/// Embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 64,
            max_retries: 3,
            retry_delay_secs: 2,
            timeout_secs: 60,
        }
    }
}

/// Vector store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorDbConfig {
    pub url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub collection_name: String,
    pub distance_metric: DistanceMetric,
    pub timeout_secs: u64,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            api_key: None,
            collection_name: "novel_scenes".to_string(),
            distance_metric: DistanceMetric::Cosine,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    Dot,
}

/// Stage 1 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChapterSplitConfig {
    /// Boundary patterns, each evaluated with multiline semantics.
    pub patterns: Vec<String>,
    pub min_chapter_length: usize,
}

impl Default for ChapterSplitConfig {
    fn default() -> Self {
        Self {
            patterns: vec![
                r"^第[一二三四五六七八九十百千万零\d]+章.*$".to_string(),
                r"^第[一二三四五六七八九十百千万零\d]+回.*$".to_string(),
                r"^Chapter\s+\d+.*$".to_string(),
            ],
            min_chapter_length: 200,
        }
    }
}

/// Stage 2 settings. Lengths are in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneSplitConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub target_length: usize,
    /// Scene ranges must cover at least this fraction of the chapter.
    pub coverage_threshold: f64,
    pub fuzzy_threshold: f64,
}

impl Default for SceneSplitConfig {
    fn default() -> Self {
        Self {
            min_length: 300,
            max_length: 2000,
            target_length: 1000,
            coverage_threshold: 0.9,
            fuzzy_threshold: 0.7,
        }
    }
}

/// Stage 3 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub batch_size: usize,
    /// Batches whose average scene length is below this are combined into
    /// one prompt.
    pub short_scene_threshold: usize,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            short_scene_threshold: 500,
        }
    }
}

/// Stage 5 settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterProfileConfig {
    pub top_n_characters: usize,
    pub min_scenes: usize,
}

impl Default for CharacterProfileConfig {
    fn default() -> Self {
        Self {
            top_n_characters: 20,
            min_scenes: 3,
        }
    }
}

/// Retrieval and worldbook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpQueryConfig {
    pub vector_top_k: usize,
    pub filter_top_k: usize,
    pub profile_top_k: usize,
    pub max_candidates: usize,
    pub worldbook_top_n: usize,
}

impl Default for RpQueryConfig {
    fn default() -> Self {
        Self {
            vector_top_k: 30,
            filter_top_k: 20,
            profile_top_k: 10,
            max_candidates: 60,
            worldbook_top_n: 8,
        }
    }
}

/// Filesystem roots for tenant workspaces, vector shards, and logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_root: PathBuf,
    pub vector_db_root: PathBuf,
    pub logs_root: PathBuf,
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            vector_db_root: PathBuf::from("vector_db"),
            logs_root: PathBuf::from("logs"),
            database_path: PathBuf::from("data/worldbook.sqlite3"),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cookie_name: String,
    pub user_session_days: u32,
    pub guest_session_days: u32,
    /// Upload cap in bytes.
    pub max_upload_bytes: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            cookie_name: "wb_sid".to_string(),
            user_session_days: 30,
            guest_session_days: 30,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Load and validate a YAML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject obviously unusable values before any network call is made.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let placeholders: HashSet<&str> = [
            "sk-xxxxx",
            "sk-yyyyy",
            "your-llm-api-key",
            "your-embedding-api-key",
            "your-llm-api-key-here",
            "your-embedding-api-key-here",
        ]
        .into_iter()
        .collect();

        if placeholders.contains(self.llm.api_key.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "llm.api_key".to_string(),
                reason: "placeholder API key".to_string(),
            });
        }
        if placeholders.contains(self.embedding.api_key.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "embedding.api_key".to_string(),
                reason: "placeholder API key".to_string(),
            });
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.dimensions".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "embedding.batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.scene_split.min_length >= self.scene_split.max_length {
            return Err(ConfigError::InvalidValue {
                key: "scene_split".to_string(),
                reason: "min_length must be below max_length".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.scene_split.coverage_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "scene_split.coverage_threshold".to_string(),
                reason: "must be in [0, 1]".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn placeholder_api_key_is_rejected() {
        let mut config = RuntimeConfig::default();
        config.llm.api_key = "your-llm-api-key".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let config: RuntimeConfig = serde_yaml::from_str(
            "llm:\n  model: test-model\nrp_query:\n  vector_top_k: 5\n",
        )
        .unwrap();
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.rp_query.vector_top_k, 5);
        assert_eq!(config.rp_query.filter_top_k, 20);
        assert_eq!(config.embedding.dimensions, 1536);
    }

    #[test]
    fn inverted_scene_lengths_are_rejected() {
        let mut config = RuntimeConfig::default();
        config.scene_split.min_length = 5000;
        assert!(config.validate().is_err());
    }
}
