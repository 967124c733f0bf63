//! # Result Assembler
//!
//! Combines the prediction, the attribution, and the imputation bookkeeping of
//! one record into an `ExplanationRecord`, and renders the serializable
//! response returned to callers.

use crate::attribution::Attribution;
use crate::impute::ImputedRow;
use crate::inference::PredictionResult;
use crate::schema::FeatureSchema;
use crate::types::Disposition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One feature's part in a prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributionEntry {
    pub feature: String,
    /// Value the model saw, after imputation.
    pub value: f64,
    /// Signed contribution toward the predicted class.
    pub contribution: f64,
    pub was_missing: bool,
}

/// Everything known about one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationRecord {
    pub prediction: PredictionResult,
    /// One entry per schema feature, by descending |contribution|.
    pub attributions: Vec<AttributionEntry>,
    /// Imputed feature names, in schema order.
    pub missing_features: Vec<String>,
    /// Attribution baseline for the predicted class.
    pub baseline: f64,
}

impl ExplanationRecord {
    pub fn assemble(
        schema: &FeatureSchema,
        imputed: &ImputedRow,
        prediction: PredictionResult,
        attribution: Attribution,
    ) -> Self {
        let mut attributions: Vec<AttributionEntry> = schema
            .iter()
            .enumerate()
            .map(|(i, name)| AttributionEntry {
                feature: name.to_string(),
                value: imputed.vector[i],
                contribution: attribution.contributions[i],
                was_missing: imputed.imputed[i],
            })
            .collect();
        rank_by_importance(&mut attributions);

        Self {
            prediction,
            attributions,
            missing_features: imputed.imputed_names(schema),
            baseline: attribution.baseline,
        }
    }

    pub fn class(&self) -> Disposition {
        self.prediction.class
    }

    pub fn label(&self) -> &'static str {
        self.prediction.class.label()
    }

    pub fn confidence(&self) -> f64 {
        self.prediction.confidence
    }

    /// The `n` most important features, or all of them if fewer exist.
    pub fn top(&self, n: usize) -> &[AttributionEntry] {
        &self.attributions[..n.min(self.attributions.len())]
    }

    pub fn to_response(&self, top_features: usize) -> PredictionResponse {
        PredictionResponse {
            prediction: self.class().index(),
            prediction_label: self.label().to_string(),
            probabilities: Disposition::ALL
                .iter()
                .map(|d| (d.label().to_string(), self.prediction.probability(*d)))
                .collect(),
            confidence: self.confidence(),
            top_features: self
                .top(top_features)
                .iter()
                .map(|entry| TopFeature {
                    feature: entry.feature.clone(),
                    value: entry.value,
                    importance: entry.contribution,
                    was_missing: entry.was_missing,
                })
                .collect(),
            missing_features: self.missing_features.clone(),
        }
    }
}

/// Stable sort by descending absolute contribution; equal magnitudes keep
/// their schema order.
pub fn rank_by_importance(entries: &mut [AttributionEntry]) {
    entries.sort_by(|a, b| b.contribution.abs().total_cmp(&a.contribution.abs()));
}

/// JSON shape returned by single-record prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: usize,
    pub prediction_label: String,
    pub probabilities: BTreeMap<String, f64>,
    pub confidence: f64,
    pub top_features: Vec<TopFeature>,
    pub missing_features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopFeature {
    pub feature: String,
    pub value: f64,
    pub importance: f64,
    pub was_missing: bool,
}
