use crate::config::Config;
use crate::error::{Result, SiftError, ValidationError};
use crate::retrieval::RetrievalMethod;
use std::collections::HashSet;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, reporting every problem at once
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_fusion(config, &mut errors);
        Self::validate_rerank(config, &mut errors);
        Self::validate_embedding(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SiftError::ConfigValidation { errors })
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

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let retrieval = &config.retrieval;

        if retrieval.enabled_methods.is_empty() {
            errors.push(ValidationError::new(
                "retrieval.enabled_methods",
                "At least one retrieval method must be enabled",
            ));
        }

        let mut seen = HashSet::new();
        for method in &retrieval.enabled_methods {
            if !seen.insert(*method) {
                errors.push(ValidationError::new(
                    "retrieval.enabled_methods",
                    format!("Method '{}' is listed more than once", method),
                ));
            }
        }

        for method in RetrievalMethod::ALL {
            let weight = retrieval.weights.get(method);
            if !weight.is_finite() || weight < 0.0 {
                errors.push(ValidationError::new(
                    format!("retrieval.weights.{}", method),
                    format!("Weight must be a non-negative number, got {}", weight),
                ));
            }
        }

        if retrieval.per_method_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "retrieval.per_method_timeout_ms",
                "Timeout must be greater than 0",
            ));
        }

        if retrieval.search_multiplier == 0 {
            errors.push(ValidationError::new(
                "retrieval.search_multiplier",
                "Search multiplier must be greater than 0",
            ));
        }

        if retrieval.default_limit == 0 {
            errors.push(ValidationError::new(
                "retrieval.default_limit",
                "Default limit must be greater than 0",
            ));
        }
    }

    fn validate_fusion(config: &Config, errors: &mut Vec<ValidationError>) {
        let k = config.fusion.rrf_k;
        if !k.is_finite() || k <= 0.0 {
            errors.push(ValidationError::new(
                "fusion.rrf_k",
                format!("RRF constant must be a positive number, got {}", k),
            ));
        }
    }

    fn validate_rerank(config: &Config, errors: &mut Vec<ValidationError>) {
        let rerank = &config.rerank;

        if rerank.top_n == 0 {
            errors.push(ValidationError::new(
                "rerank.top_n",
                "Rerank shortlist size must be greater than 0",
            ));
        }

        if rerank.timeout_ms == 0 {
            errors.push(ValidationError::new(
                "rerank.timeout_ms",
                "Timeout must be greater than 0",
            ));
        }

        if rerank.max_text_chars == 0 {
            errors.push(ValidationError::new(
                "rerank.max_text_chars",
                "Max text length must be greater than 0",
            ));
        }

        if rerank.batch_size == 0 {
            errors.push(ValidationError::new(
                "rerank.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if rerank.enabled && rerank.model.is_empty() {
            errors.push(ValidationError::new(
                "rerank.model",
                "Model name cannot be empty when reranking is enabled",
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

        if config.embedding.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }
}
