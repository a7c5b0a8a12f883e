use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::PipelineStatus;

/// Main error type for trendforge
#[derive(Error, Debug)]
pub enum TrendError {
    /// Bad chunking, retrieval or threshold parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Invalid configuration value
    #[error("Invalid configuration value at {path}: {message}")]
    InvalidConfigValue { path: String, message: String },

    /// Retrieval was requested against a corpus with no chunks
    #[error("Corpus is empty")]
    EmptyCorpus,

    /// Vector length differs from the indexed dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Query rejected before scoring
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// A document source could not be reached
    #[error("Source unavailable: {source_name}: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    /// Terminal pipeline outcome surfaced to the user
    #[error("Pipeline failed at status {status}: {reason}")]
    PipelineFailed {
        status: PipelineStatus,
        reason: String,
    },

    /// A state change outside the declared transition table
    #[error("Illegal transition: {from} -> {to}")]
    IllegalTransition {
        from: PipelineStatus,
        to: PipelineStatus,
    },

    /// Embedding provider errors that are not recovered locally
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Blob or index store errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Error message describing the validation failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result type for trendforge operations
pub type Result<T> = std::result::Result<T, TrendError>;
