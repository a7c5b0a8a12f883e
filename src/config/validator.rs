use crate::config::Config;
use crate::error::{Result, TrendError, ValidationError};

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, reporting every violation at once
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_chunking(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_quality(config, &mut errors);
        Self::validate_pipeline(config, &mut errors);
        Self::validate_llm(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrendError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_chunking(config: &Config, errors: &mut Vec<ValidationError>) {
        let chunking = &config.chunking;
        if chunking.chunk_size == 0 {
            errors.push(ValidationError::new(
                "chunking.chunk_size",
                "Chunk size must be greater than 0",
            ));
        }
        if chunking.overlap >= chunking.chunk_size {
            errors.push(ValidationError::new(
                "chunking.overlap",
                format!(
                    "Overlap ({}) must be smaller than chunk size ({})",
                    chunking.overlap, chunking.chunk_size
                ),
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.embedding.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }
        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "Dimension must be greater than 0",
            ));
        }
        if config.embedding.enabled && config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;
        Self::check_unit_range("retrieval.lambda", retrieval.lambda, errors);
        Self::check_unit_range("retrieval.alpha", retrieval.alpha, errors);

        if retrieval.top_k == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_k",
                "top_k must be greater than 0",
            ));
        }
        if retrieval.pool_multiplier == 0 {
            errors.push(ValidationError::new(
                "retrieval.pool_multiplier",
                "Pool multiplier must be greater than 0",
            ));
        }
        if retrieval.bm25_k1 < 0.0 {
            errors.push(ValidationError::new(
                "retrieval.bm25_k1",
                format!("k1 must be non-negative, got {}", retrieval.bm25_k1),
            ));
        }
        Self::check_unit_range("retrieval.bm25_b", retrieval.bm25_b, errors);
    }

    fn validate_quality(config: &Config, errors: &mut Vec<ValidationError>) {
        Self::check_unit_range(
            "quality.min_company_ratio",
            config.quality.min_company_ratio,
            errors,
        );
        if config
            .quality
            .organizations
            .iter()
            .any(|name| name.trim().is_empty())
        {
            errors.push(ValidationError::new(
                "quality.organizations",
                "Organization names cannot be empty",
            ));
        }
    }

    fn validate_pipeline(config: &Config, errors: &mut Vec<ValidationError>) {
        let pipeline = &config.pipeline;
        if pipeline.max_data_retries == 0 {
            errors.push(ValidationError::new(
                "pipeline.max_data_retries",
                "At least one collection attempt is required",
            ));
        }
        if pipeline.max_parallel_queries == 0 {
            errors.push(ValidationError::new(
                "pipeline.max_parallel_queries",
                "Parallel queries must be greater than 0",
            ));
        }
        if pipeline.query_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "pipeline.query_timeout_secs",
                "Query timeout must be greater than 0",
            ));
        }
        if pipeline.max_keywords == 0 {
            errors.push(ValidationError::new(
                "pipeline.max_keywords",
                "Keyword cap must be greater than 0",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.llm.max_attempts == 0 {
            errors.push(ValidationError::new(
                "llm.max_attempts",
                "At least one attempt is required",
            ));
        }
        if config.llm.enabled && config.llm.command.is_empty() {
            errors.push(ValidationError::new(
                "llm.command",
                "A command is required when the language model is enabled",
            ));
        }
    }

    fn check_unit_range(path: &str, value: f32, errors: &mut Vec<ValidationError>) {
        if !(0.0..=1.0).contains(&value) {
            errors.push(ValidationError::new(
                path,
                format!("Value must be between 0.0 and 1.0, got {}", value),
            ));
        }
    }
}
