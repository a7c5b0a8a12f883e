//! Configuration management for trendforge
//!
//! A single immutable `Config` is loaded once from TOML, patched with
//! environment overrides and an optional profile, validated, and then handed
//! to components by reference.

use crate::error::{Result, TrendError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Blobs at or above this many bytes are zstd-compressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

fn default_compression_threshold() -> usize {
    4096
}

/// Chunking parameters, in characters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Disable to run lexical-only
    pub enabled: bool,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            batch_size: 32,
        }
    }
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default number of candidates returned per query
    pub top_k: usize,
    /// MMR relevance/diversity trade-off
    pub lambda: f32,
    /// Lexical weight in score fusion
    pub alpha: f32,
    /// Candidate pool size per index is `pool_multiplier * k`
    pub pool_multiplier: usize,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub remove_stopwords: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            lambda: 0.5,
            alpha: 0.5,
            pool_multiplier: 4,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            remove_stopwords: true,
        }
    }
}

/// Data sufficiency thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub min_papers: usize,
    pub min_company_ratio: f32,
    pub min_distinct_sources: usize,
    pub min_reference_hits: usize,
    pub min_news_items: usize,
    /// Organisation names counted by the company ratio
    pub organizations: Vec<String>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_papers: 30,
            min_company_ratio: 0.20,
            min_distinct_sources: 3,
            min_reference_hits: 0,
            min_news_items: 0,
            organizations: [
                "Google", "DeepMind", "OpenAI", "Microsoft", "Meta", "Amazon", "Apple",
                "NVIDIA", "Intel", "IBM", "Samsung", "LG", "Hyundai", "Tesla", "Toyota",
                "Boston Dynamics", "Sony", "Huawei", "Baidu", "Alibaba", "Tencent",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Retry ceilings and collection fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_data_retries: u32,
    pub max_revisions: u32,
    pub max_plan_iterations: u32,
    /// Concurrent (keyword, tool) queries per collection round
    pub max_parallel_queries: usize,
    pub query_timeout_secs: u64,
    /// Upper bound on the keyword set after expansion
    pub max_keywords: usize,
    /// Documents requested per source query
    pub results_per_query: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_data_retries: 3,
            max_revisions: 5,
            max_plan_iterations: 100,
            max_parallel_queries: 3,
            query_timeout_secs: 30,
            max_keywords: 40,
            results_per_query: 20,
        }
    }
}

/// Feedback classification rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackConfig {
    /// Whole-message answers treated as approval
    pub approval_keywords: Vec<String>,
    /// Phrases that ask for new data when no model is configured
    pub recollection_cues: Vec<String>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            approval_keywords: [
                "ok", "okay", "approve", "approved", "accept", "lgtm", "good", "좋아요", "승인",
                "확인",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            recollection_cues: [
                "more data",
                "not enough data",
                "insufficient data",
                "missing data",
                "recollect",
                "start over",
                "from scratch",
                "데이터 부족",
                "자료 부족",
                "처음부터",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Language model configuration
///
/// The model is an external command that reads a prompt on stdin and writes
/// its answer to stdout (for example `ollama run llama3.1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub enabled: bool,
    pub command: Vec<String>,
    /// Attempts per call, including the first
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: vec![
                "ollama".to_string(),
                "run".to_string(),
                "llama3.1".to_string(),
            ],
            max_attempts: 2,
            timeout_secs: 120,
        }
    }
}

/// Local document sources, JSON-lines files of documents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub papers_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_file: Option<PathBuf>,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_lambda: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_alpha: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_papers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_revisions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_enabled: Option<bool>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TrendError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| TrendError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrendError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", parent),
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| TrendError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| TrendError::InvalidConfigValue {
                path: format!("profiles.{}", profile),
                message: "Unknown profile".to_string(),
            })?;

        if let Some(lambda) = overrides.retrieval_lambda {
            self.retrieval.lambda = lambda;
        }
        if let Some(alpha) = overrides.retrieval_alpha {
            self.retrieval.alpha = alpha;
        }
        if let Some(min_papers) = overrides.min_papers {
            self.quality.min_papers = min_papers;
        }
        if let Some(max_revisions) = overrides.max_revisions {
            self.pipeline.max_revisions = max_revisions;
        }
        if let Some(enabled) = overrides.embedding_enabled {
            self.embedding.enabled = enabled;
        }
        if let Some(enabled) = overrides.llm_enabled {
            self.llm.enabled = enabled;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: TRENDFORGE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        for (key, value) in std::env::vars() {
            if let Some(config_key) = key.strip_prefix("TRENDFORGE_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "EMBEDDING__ENABLED" => self.embedding.enabled = parse_value(path, value)?,
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "RETRIEVAL__TOP_K" => self.retrieval.top_k = parse_value(path, value)?,
            "RETRIEVAL__LAMBDA" => self.retrieval.lambda = parse_value(path, value)?,
            "RETRIEVAL__ALPHA" => self.retrieval.alpha = parse_value(path, value)?,
            "QUALITY__MIN_PAPERS" => self.quality.min_papers = parse_value(path, value)?,
            "PIPELINE__MAX_DATA_RETRIES" => {
                self.pipeline.max_data_retries = parse_value(path, value)?
            }
            "PIPELINE__MAX_REVISIONS" => self.pipeline.max_revisions = parse_value(path, value)?,
            "LLM__ENABLED" => self.llm.enabled = parse_value(path, value)?,
            "LLM__COMMAND" => {
                self.llm.command = value.split_whitespace().map(str::to_string).collect()
            }
            "SOURCES__PAPERS_FILE" => self.sources.papers_file = Some(PathBuf::from(value)),
            "SOURCES__NEWS_FILE" => self.sources.news_file = Some(PathBuf::from(value)),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            TrendError::InvalidConfig("Cannot determine config directory".to_string())
        })?;

        Ok(config_dir.join("trendforge").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            TrendError::InvalidConfig("Cannot determine home directory".to_string())
        })?;

        Ok(home_dir.join(".trendforge"))
    }
}

fn parse_value<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| TrendError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.trendforge"),
                compression_threshold: default_compression_threshold(),
            },
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            quality: QualityConfig::default(),
            pipeline: PipelineConfig::default(),
            feedback: FeedbackConfig::default(),
            llm: LlmConfig::default(),
            sources: SourcesConfig::default(),
            profiles: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.chunking.chunk_size, 1000);
        assert_eq!(parsed.quality.min_papers, 30);
        assert_eq!(parsed.pipeline.max_data_retries, 3);
        assert!(ConfigValidator::validate(&parsed).is_ok());
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let text = r#"
[_meta]
schema_version = "1.0.0"

[storage]
data_dir = "/tmp/trendforge"
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.retrieval.pool_multiplier, 4);
        assert_eq!(config.storage.compression_threshold, 4096);
        assert!(!config.llm.enabled);
    }

    #[test]
    fn test_apply_profile() {
        let mut config = Config::default();
        config.profiles.insert(
            "strict".to_string(),
            ProfileOverrides {
                min_papers: Some(50),
                retrieval_lambda: Some(0.8),
                ..Default::default()
            },
        );

        config.apply_profile("strict").unwrap();
        assert_eq!(config.quality.min_papers, 50);
        assert!((config.retrieval.lambda - 0.8).abs() < f32::EPSILON);
        assert!(config.apply_profile("missing").is_err());
    }

    #[test]
    fn test_env_value_parsing() {
        let mut config = Config::default();
        config.set_value_from_env("RETRIEVAL__TOP_K", "9").unwrap();
        assert_eq!(config.retrieval.top_k, 9);

        assert!(config.set_value_from_env("LLM__ENABLED", "maybe").is_err());
        config.set_value_from_env("UNKNOWN__KEY", "x").unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/trendforge.toml"));
        assert!(matches!(result, Err(TrendError::ConfigNotFound { .. })));
    }
}
