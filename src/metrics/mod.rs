//! Ranking-quality metrics: nDCG, Recall@K, Precision@K and MRR
//!
//! All metrics are bounded to `[0, 1]` and return 0 instead of NaN for empty
//! inputs. A document is relevant when its grade is greater than zero.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Ground truth for one query: relevance grade per document id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RankingJudgment {
    pub query_id: String,
    /// Graded relevance; ids not listed have grade 0
    pub grades: HashMap<String, f64>,
}

impl RankingJudgment {
    /// Binary judgment: every listed id has grade 1
    pub fn from_relevant<I, S>(query_id: impl Into<String>, relevant: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            query_id: query_id.into(),
            grades: relevant.into_iter().map(|id| (id.into(), 1.0)).collect(),
        }
    }

    pub fn graded<I, S>(query_id: impl Into<String>, grades: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            query_id: query_id.into(),
            grades: grades.into_iter().map(|(id, g)| (id.into(), g)).collect(),
        }
    }

    pub fn grade(&self, id: &str) -> f64 {
        self.grades
            .get(id)
            .copied()
            .filter(|g| g.is_finite() && *g > 0.0)
            .unwrap_or(0.0)
    }

    pub fn is_relevant(&self, id: &str) -> bool {
        self.grade(id) > 0.0
    }

    pub fn relevant_count(&self) -> usize {
        self.grades.keys().filter(|id| self.is_relevant(id)).count()
    }
}

/// The four metrics for one ranked list
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub ndcg: f64,
    pub recall: f64,
    pub precision: f64,
    pub mrr: f64,
}

/// Macro-averaged metrics over a set of queries
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub k: usize,
    pub query_count: usize,
    pub mean: MetricsReport,
    pub per_query: BTreeMap<String, MetricsReport>,
}

/// Ranked ids with repeats removed, keeping the first occurrence
fn distinct<'a>(ranked: &'a [String]) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    ranked
        .iter()
        .map(String::as_str)
        .filter(|id| seen.insert(*id))
        .collect()
}

fn discount(position: usize) -> f64 {
    // position is 0-based; rank i = position + 1, discount log2(i + 1)
    ((position + 2) as f64).log2()
}

/// Normalized discounted cumulative gain over the top `k`
pub fn ndcg_at_k(ranked: &[String], judgment: &RankingJudgment, k: usize) -> f64 {
    if k == 0 || ranked.is_empty() {
        return 0.0;
    }

    let dcg: f64 = distinct(ranked)
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(pos, id)| judgment.grade(id) / discount(pos))
        .sum();

    let mut ideal: Vec<f64> = judgment
        .grades
        .keys()
        .map(|id| judgment.grade(id))
        .filter(|g| *g > 0.0)
        .collect();
    ideal.sort_by(|a, b| b.total_cmp(a));

    let idcg: f64 = ideal
        .into_iter()
        .take(k)
        .enumerate()
        .map(|(pos, grade)| grade / discount(pos))
        .sum();

    if idcg <= 0.0 {
        return 0.0;
    }
    (dcg / idcg).clamp(0.0, 1.0)
}

/// Fraction of relevant documents found in the top `k`
pub fn recall_at_k(ranked: &[String], judgment: &RankingJudgment, k: usize) -> f64 {
    let relevant = judgment.relevant_count();
    if k == 0 || relevant == 0 {
        return 0.0;
    }

    let hits = distinct(ranked)
        .into_iter()
        .take(k)
        .filter(|id| judgment.is_relevant(id))
        .count();

    (hits as f64 / relevant as f64).min(1.0)
}

/// Fraction of the top `k` that is relevant; the denominator shrinks to the
/// list length when fewer than `k` results were returned
pub fn precision_at_k(ranked: &[String], judgment: &RankingJudgment, k: usize) -> f64 {
    let top: Vec<&str> = distinct(ranked).into_iter().take(k).collect();
    if top.is_empty() {
        return 0.0;
    }

    let hits = top.iter().filter(|id| judgment.is_relevant(id)).count();
    hits as f64 / top.len() as f64
}

/// Reciprocal of the 1-based rank of the first relevant document in the
/// whole list
pub fn reciprocal_rank(ranked: &[String], judgment: &RankingJudgment) -> f64 {
    distinct(ranked)
        .into_iter()
        .position(|id| judgment.is_relevant(id))
        .map(|pos| 1.0 / (pos + 1) as f64)
        .unwrap_or(0.0)
}

pub fn compute_metrics(ranked: &[String], judgment: &RankingJudgment, k: usize) -> MetricsReport {
    MetricsReport {
        ndcg: ndcg_at_k(ranked, judgment, k),
        recall: recall_at_k(ranked, judgment, k),
        precision: precision_at_k(ranked, judgment, k),
        mrr: reciprocal_rank(ranked, judgment),
    }
}

/// Average metrics over every judged query.
///
/// `runs` maps query ids to ranked lists. A judged query with no run scores
/// zero on every metric; runs without a judgment are skipped.
pub fn evaluate_runs(
    runs: &HashMap<String, Vec<String>>,
    judgments: &[RankingJudgment],
    k: usize,
) -> EvaluationSummary {
    let mut per_query = BTreeMap::new();

    for judgment in judgments {
        let report = match runs.get(&judgment.query_id) {
            Some(ranked) => compute_metrics(ranked, judgment, k),
            None => {
                tracing::warn!(query_id = %judgment.query_id, "No run for judged query");
                MetricsReport::default()
            }
        };
        per_query.insert(judgment.query_id.clone(), report);
    }

    let skipped = runs
        .keys()
        .filter(|id| !per_query.contains_key(id.as_str()))
        .count();
    if skipped > 0 {
        tracing::debug!(skipped, "Ignoring runs without judgments");
    }

    let query_count = per_query.len();
    let mean = if query_count == 0 {
        MetricsReport::default()
    } else {
        let n = query_count as f64;
        let sum = per_query
            .values()
            .fold(MetricsReport::default(), |acc, r| MetricsReport {
                ndcg: acc.ndcg + r.ndcg,
                recall: acc.recall + r.recall,
                precision: acc.precision + r.precision,
                mrr: acc.mrr + r.mrr,
            });
        MetricsReport {
            ndcg: sum.ndcg / n,
            recall: sum.recall / n,
            precision: sum.precision / n,
            mrr: sum.mrr / n,
        }
    };

    EvaluationSummary {
        k,
        query_count,
        mean,
        per_query,
    }
}
