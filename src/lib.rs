//! Sift - Hybrid Retrieval Core
//!
//! Runs full-text, dense-vector and sparse-vector search concurrently over a
//! document corpus, fuses the ranked lists with weighted Reciprocal Rank
//! Fusion, optionally reranks the head of the fused list with a cross-encoder,
//! and measures ranking quality with nDCG, Recall@K, Precision@K and MRR.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod metrics;
pub mod retrieval;

pub use error::{Result, SiftError};
