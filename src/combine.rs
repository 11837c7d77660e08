//! Result combination
//!
//! Merges the successful per-capability results of one dispatch into a single
//! answer: who contributed, an aggregate confidence, and the rationales.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use crate::worker::{ConfidenceTier, WorkerResult};

/// Weight of each confidence tier in the aggregate score
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub low: Decimal,
    pub medium: Decimal,
    pub high: Decimal,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            low: dec!(0.2),
            medium: dec!(0.3),
            high: dec!(0.5),
        }
    }
}

impl ConfidenceWeights {
    pub fn weight(&self, tier: ConfidenceTier) -> Decimal {
        match tier {
            ConfidenceTier::Low => self.low,
            ConfidenceTier::Medium => self.medium,
            ConfidenceTier::High => self.high,
        }
    }

    pub fn validation_errors(&self) -> Vec<String> {
        [("low", self.low), ("medium", self.medium), ("high", self.high)]
            .into_iter()
            .filter(|(_, w)| *w <= Decimal::ZERO || *w > Decimal::ONE)
            .map(|(name, w)| format!("weights.{name} must be in (0, 1], got {w}"))
            .collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CombineError {
    #[error("no successful results to combine")]
    NothingToCombine,
}

/// The merged answer of one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedResult {
    /// Capabilities whose results were merged
    pub contributors: BTreeSet<String>,
    /// Most common tier among contributors; ties resolve to the lower tier
    pub confidence: ConfidenceTier,
    /// Mean tier weight across contributors
    pub confidence_score: Decimal,
    /// One `capability (tier): rationale` line per contributor
    pub rationale: String,
}

/// Combine successful results keyed by capability
pub fn combine(
    results: &BTreeMap<String, WorkerResult>,
    weights: &ConfidenceWeights,
) -> Result<CombinedResult, CombineError> {
    if results.is_empty() {
        return Err(CombineError::NothingToCombine);
    }

    let mut tally: BTreeMap<ConfidenceTier, usize> = BTreeMap::new();
    let mut total = Decimal::ZERO;
    for result in results.values() {
        *tally.entry(result.confidence).or_insert(0) += 1;
        total += weights.weight(result.confidence);
    }

    // BTreeMap iterates Low -> High; strict `>` keeps the lowest tier on ties
    let mut confidence = ConfidenceTier::Low;
    let mut best = 0;
    for (tier, count) in tally {
        if count > best {
            best = count;
            confidence = tier;
        }
    }

    let confidence_score = (total / Decimal::from(results.len())).round_dp(4);
    let rationale = results
        .iter()
        .map(|(capability, r)| format!("{capability} ({}): {}", r.confidence, r.rationale))
        .collect::<Vec<_>>()
        .join("\n");

    Ok(CombinedResult {
        contributors: results.keys().cloned().collect(),
        confidence,
        confidence_score,
        rationale,
    })
}
