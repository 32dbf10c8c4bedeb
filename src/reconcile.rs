//! Combine per-category outcomes into one decision per case.
//!
//! Only determinate records take part (detected true/false, confidence
//! present, no error). With none the case is `unknown`; with exactly one the
//! record is returned unchanged; with two or more the combined confidence is
//! the weighted sum of confidences and `detected` is `combined >= threshold`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_THRESHOLD;
use crate::ledger::{Detected, Ledger, ResultFilter, ResultRecord};
use crate::source::Category;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    pub weights: BTreeMap<Category, f64>,
    pub threshold: f64,
}

impl ReconcileConfig {
    pub fn new(weights: BTreeMap<Category, f64>) -> Self {
        Self {
            weights,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Unconfigured categories weigh nothing.
    pub fn weight(&self, category: &Category) -> f64 {
        self.weights.get(category).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledDecision {
    pub experiment_id: String,
    pub case_id: String,
    pub combined_detected: Detected,
    pub combined_confidence: Option<f64>,
    /// Determinate categories that fed the decision, in category order.
    pub contributing_categories: Vec<Category>,
}

impl ReconciledDecision {
    pub fn is_determinate(&self) -> bool {
        self.combined_detected != Detected::Unknown
    }
}

/// Reconcile one case. Records belonging to other cases or experiments are ignored.
pub fn reconcile(
    experiment_id: &str,
    case_id: &str,
    results: &[ResultRecord],
    config: &ReconcileConfig,
) -> ReconciledDecision {
    let mut determinate: Vec<&ResultRecord> = results
        .iter()
        .filter(|r| r.experiment_id == experiment_id && r.case_id == case_id)
        .filter(|r| r.is_determinate())
        .collect();
    determinate.sort_by(|a, b| a.category.cmp(&b.category));
    determinate.dedup_by(|a, b| a.category == b.category);

    let contributing_categories = determinate.iter().map(|r| r.category.clone()).collect();
    let (combined_detected, combined_confidence) = match determinate.as_slice() {
        [] => (Detected::Unknown, None),
        [only] => (only.detected, only.confidence),
        many => {
            let combined: f64 = many
                .iter()
                .map(|r| config.weight(&r.category) * r.confidence.unwrap_or(0.0))
                .sum();
            (Detected::from_bool(combined >= config.threshold), Some(combined))
        }
    };

    ReconciledDecision {
        experiment_id: experiment_id.to_string(),
        case_id: case_id.to_string(),
        combined_detected,
        combined_confidence,
        contributing_categories,
    }
}

/// One decision per case present in `results`, ordered by case id.
pub fn reconcile_experiment(
    experiment_id: &str,
    results: &[ResultRecord],
    config: &ReconcileConfig,
) -> Vec<ReconciledDecision> {
    let mut by_case: BTreeMap<&str, Vec<ResultRecord>> = BTreeMap::new();
    for record in results.iter().filter(|r| r.experiment_id == experiment_id) {
        by_case
            .entry(record.case_id.as_str())
            .or_default()
            .push(record.clone());
    }
    by_case
        .into_iter()
        .map(|(case_id, records)| reconcile(experiment_id, case_id, &records, config))
        .collect()
}

/// Read every ledger row for `experiment_id` and reconcile all of its cases.
pub async fn reconcile_from_ledger(
    ledger: &Ledger,
    experiment_id: &str,
    config: &ReconcileConfig,
) -> Result<Vec<ReconciledDecision>, StoreError> {
    let results = ledger.query_results(experiment_id, &ResultFilter::all()).await?;
    Ok(reconcile_experiment(experiment_id, &results, config))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionTally {
    pub detected: usize,
    pub not_detected: usize,
    pub unknown: usize,
}

impl DecisionTally {
    pub fn from_decisions<'a>(decisions: impl IntoIterator<Item = &'a ReconciledDecision>) -> Self {
        let mut tally = Self::default();
        for decision in decisions {
            match decision.combined_detected {
                Detected::Yes => tally.detected += 1,
                Detected::No => tally.not_detected += 1,
                Detected::Unknown => tally.unknown += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.detected + self.not_detected + self.unknown
    }
}
