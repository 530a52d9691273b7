//! Cross-encoder model seam and the FastEmbed implementation

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

/// Where a scoring batch executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Shared GPU-class accelerator; one batch at a time per process
    Accelerator,
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accelerator => f.write_str("accelerator"),
            Self::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CrossEncoderError {
    #[error("Cross-encoder initialization failed: {0}")]
    Initialization(String),

    #[error("Cross-encoder ran out of memory on {device}: {detail}")]
    ResourceExhausted { device: Device, detail: String },

    #[error("Cross-encoder inference failed: {0}")]
    Inference(String),
}

/// A model that scores (query, text) pairs jointly
pub trait CrossEncoder: Send + Sync {
    /// Load weights and choose the execution device.
    ///
    /// Called once by the rerank engine before the first batch.
    fn initialize(&self) -> Result<Device, CrossEncoderError>;

    /// Score every pair in a single batch; output order matches `pairs`.
    ///
    /// Must report memory exhaustion as `CrossEncoderError::ResourceExhausted`
    /// so the caller can retry on another device.
    fn score(&self, pairs: &[(String, String)], device: Device)
        -> Result<Vec<f32>, CrossEncoderError>;

    /// Free whatever the model holds on `device` after a failed batch
    fn release(&self, _device: Device) {}

    fn model_name(&self) -> &str;
}

/// Cross-encoder backed by a FastEmbed (ONNX) reranker model
///
/// The model is loaded by `initialize`, not by `new`, so constructing the
/// encoder is cheap and the download happens on first use.
pub struct FastEmbedCrossEncoder {
    model_name: String,
    reranker_model: RerankerModel,
    batch_size: usize,
    model: OnceLock<TextRerank>,
}

impl FastEmbedCrossEncoder {
    /// Prepare the named model (e.g., "BAAI/bge-reranker-base")
    pub fn new(model_name: &str, batch_size: usize) -> Result<Self, CrossEncoderError> {
        let reranker_model = match model_name {
            "BAAI/bge-reranker-base" | "bge-reranker-base" => RerankerModel::BGERerankerBase,
            _ => {
                return Err(CrossEncoderError::Initialization(format!(
                    "Unsupported reranker model: {}. Supported: BAAI/bge-reranker-base",
                    model_name
                )))
            }
        };

        Ok(Self {
            model_name: model_name.to_string(),
            reranker_model,
            batch_size: batch_size.max(1),
            model: OnceLock::new(),
        })
    }

    /// Create encoder with default model
    pub fn with_default_model() -> Result<Self, CrossEncoderError> {
        Self::new("BAAI/bge-reranker-base", 32)
    }
}

fn classify_inference_error(device: Device, message: String) -> CrossEncoderError {
    let lower = message.to_lowercase();
    if lower.contains("out of memory") || lower.contains("failed to allocate") {
        CrossEncoderError::ResourceExhausted {
            device,
            detail: message,
        }
    } else {
        CrossEncoderError::Inference(message)
    }
}

impl CrossEncoder for FastEmbedCrossEncoder {
    fn initialize(&self) -> Result<Device, CrossEncoderError> {
        if self.model.get().is_none() {
            tracing::info!("Initializing reranker model: {}", self.model_name);

            let init_options = RerankInitOptions::new(self.reranker_model.clone())
                .with_show_download_progress(false);
            let model = TextRerank::try_new(init_options)
                .map_err(|e| CrossEncoderError::Initialization(e.to_string()))?;

            // A concurrent initializer may have won; either model is equivalent
            let _ = self.model.set(model);
        }

        // ONNX runtime is built with the default CPU execution provider
        Ok(Device::Cpu)
    }

    fn score(
        &self,
        pairs: &[(String, String)],
        device: Device,
    ) -> Result<Vec<f32>, CrossEncoderError> {
        let model = self
            .model
            .get()
            .ok_or_else(|| CrossEncoderError::Inference("Model not initialized".to_string()))?;

        // The model takes one query per call; group pairs by query text
        let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, (query, _)) in pairs.iter().enumerate() {
            groups.entry(query.as_str()).or_default().push(i);
        }

        let mut scores = vec![0.0f32; pairs.len()];
        for (query, indices) in groups {
            let documents: Vec<&str> = indices.iter().map(|&i| pairs[i].1.as_str()).collect();

            let results = model
                .rerank(query, documents, false, Some(self.batch_size))
                .map_err(|e| classify_inference_error(device, e.to_string()))?;

            for result in results {
                let pair_index = indices.get(result.index).ok_or_else(|| {
                    CrossEncoderError::Inference(format!(
                        "Reranker returned out-of-range index {}",
                        result.index
                    ))
                })?;
                scores[*pair_index] = result.score;
            }
        }

        Ok(scores)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
