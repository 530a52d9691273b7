//! Reciprocal Rank Fusion algorithm for combining search results

use crate::retrieval::{Candidate, FusedResult, RetrievalMethod};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;

/// Default RRF smoothing constant
pub const DEFAULT_RRF_K: f64 = 60.0;

#[derive(Error, Debug, PartialEq)]
pub enum FusionError {
    #[error("Invalid RRF constant {0}: must be a positive number")]
    InvalidK(f64),
}

/// Ranked output of one retrieval method
#[derive(Debug, Clone)]
pub struct RankedList {
    pub method: RetrievalMethod,
    pub candidates: Vec<Candidate>,
}

impl RankedList {
    pub fn new(method: RetrievalMethod, candidates: Vec<Candidate>) -> Self {
        Self { method, candidates }
    }
}

/// Weighted Reciprocal Rank Fusion
#[derive(Debug, Clone, Copy)]
pub struct FusionEngine {
    k: f64,
}

impl FusionEngine {
    pub fn new(k: f64) -> Result<Self, FusionError> {
        if !k.is_finite() || k <= 0.0 {
            return Err(FusionError::InvalidK(k));
        }
        Ok(Self { k })
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    pub fn fuse(
        &self,
        lists: &[RankedList],
        weights: &HashMap<RetrievalMethod, f32>,
    ) -> Vec<FusedResult> {
        reciprocal_rank_fusion(lists, weights, self.k)
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self { k: DEFAULT_RRF_K }
    }
}

/// Combine ranked lists with weighted Reciprocal Rank Fusion.
///
/// `score(id) = Σ weight_m / (k + rank_m(id))` over the lists containing
/// `id`. Methods missing from `weights` weigh 1.0; a weight of 0 removes a
/// method's contribution without removing its candidates.
///
/// Results are sorted by fused score descending, then by number of
/// contributing methods descending, then by id ascending. Lists are summed
/// in method order, so the output does not depend on the order `lists`
/// arrive in.
pub fn reciprocal_rank_fusion(
    lists: &[RankedList],
    weights: &HashMap<RetrievalMethod, f32>,
    k: f64,
) -> Vec<FusedResult> {
    let mut ordered: Vec<&RankedList> = lists.iter().collect();
    ordered.sort_by_key(|list| list.method);

    let mut scores: HashMap<&str, (f64, BTreeSet<RetrievalMethod>)> = HashMap::new();

    for list in ordered {
        let weight = f64::from(weights.get(&list.method).copied().unwrap_or(1.0)).max(0.0);
        let mut seen: HashSet<&str> = HashSet::new();

        for candidate in &list.candidates {
            // Only the best rank of an id counts within one list
            if !seen.insert(candidate.id.as_str()) {
                continue;
            }

            let entry = scores
                .entry(candidate.id.as_str())
                .or_insert_with(|| (0.0, BTreeSet::new()));

            if weight > 0.0 {
                entry.0 += weight / (k + candidate.rank.max(1) as f64);
                entry.1.insert(list.method);
            }
        }
    }

    let mut results: Vec<FusedResult> = scores
        .into_iter()
        .map(|(id, (fused_score, contributing_methods))| FusedResult {
            id: id.to_string(),
            fused_score,
            contributing_methods,
        })
        .collect();

    results.sort_by(compare_fused);
    results
}

fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| {
            b.contributing_methods
                .len()
                .cmp(&a.contributing_methods.len())
        })
        .then_with(|| a.id.cmp(&b.id))
}
