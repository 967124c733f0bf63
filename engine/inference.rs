//! # Inference Adapter
//!
//! Thin, pure wrapper over the frozen `TreeEnsemble`: a feature vector goes in,
//! a class label and probability vector come out.

use crate::model::{TreeEnsemble, argmax};
use crate::types::{Disposition, FeatureVector};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("Feature vector has {found} values, but the model expects {expected}.")]
    DimensionMismatch { found: usize, expected: usize },
    #[error("Model produced non-finite or empty class probabilities.")]
    DegenerateProbabilities,
    #[error("Model predicted class index {0}, which has no disposition label.")]
    UnknownClass(usize),
}

/// The classifier's verdict for one vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub class: Disposition,
    /// Indexed by class; sums to one.
    pub probabilities: Vec<f64>,
    /// Probability of `class`.
    pub confidence: f64,
}

impl PredictionResult {
    pub fn probability(&self, class: Disposition) -> f64 {
        self.probabilities
            .get(class.index())
            .copied()
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct InferenceAdapter {
    model: Arc<TreeEnsemble>,
}

impl InferenceAdapter {
    pub fn new(model: Arc<TreeEnsemble>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &TreeEnsemble {
        &self.model
    }

    pub fn predict(&self, vector: &FeatureVector) -> Result<PredictionResult, InferenceError> {
        let probabilities = self.model.predict_proba(vector.as_view())?;
        let index = argmax(&probabilities);
        let class = Disposition::from_index(index).ok_or(InferenceError::UnknownClass(index))?;
        Ok(PredictionResult {
            class,
            confidence: probabilities[index],
            probabilities,
        })
    }

    /// Raw model output for `class`: the probability for a decision tree, the
    /// margin for a boosted ensemble.
    pub fn raw_output(&self, vector: &FeatureVector, class: usize) -> Result<f64, InferenceError> {
        let raw = self.model.raw_scores(vector.as_view())?;
        raw.get(class)
            .copied()
            .ok_or(InferenceError::UnknownClass(class))
    }
}
