//! # Predictor
//!
//! The engine object. It owns the schema, the reference statistics, the frozen
//! model, and the attribution explainer, all fixed at construction. After that
//! it is immutable and shared freely between threads.

use crate::attribution::{Attribution, AttributionEngine};
use crate::config::{DEFAULT_TOP_FEATURES, EngineConfig};
use crate::explain::{ExplanationRecord, PredictionResponse};
use crate::impute::{ImputeError, ImputedRow, impute};
use crate::inference::{InferenceAdapter, InferenceError, PredictionResult};
use crate::model::{ModelError, TreeEnsemble};
use crate::normalize::{InputRecord, NormalizedRow, normalize};
use crate::schema::{FeatureSchema, ReferenceSet, ReferenceStatistics, SchemaError, load_reference_set};
use crate::types::Disposition;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Errors that stop the engine from starting.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load model: {0}")]
    Model(#[from] ModelError),
    #[error("Failed to load reference set: {0}")]
    Schema(#[from] SchemaError),
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("No reference statistic is available for feature(s): {}", .0.join(", "))]
    StatisticsUnavailable(Vec<String>),
}

/// Errors that fail a single prediction. No partial result is returned.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictError {
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictorOptions {
    pub top_features: usize,
    pub allow_missing_statistics: bool,
}

impl Default for PredictorOptions {
    fn default() -> Self {
        Self {
            top_features: DEFAULT_TOP_FEATURES,
            allow_missing_statistics: false,
        }
    }
}

#[derive(Debug)]
pub struct Predictor {
    schema: Arc<FeatureSchema>,
    statistics: Arc<ReferenceStatistics>,
    inference: InferenceAdapter,
    attribution: AttributionEngine,
    options: PredictorOptions,
}

impl Predictor {
    /// Checks the model against the reference schema, validates it, and builds
    /// the explainer. Models built in memory go through the same checks as
    /// models loaded from disk.
    pub fn new(
        model: TreeEnsemble,
        reference: ReferenceSet,
        options: PredictorOptions,
    ) -> Result<Self, EngineError> {
        let ReferenceSet {
            schema,
            statistics,
            rows,
        } = reference;

        check_compatibility(&model, &schema)?;
        let model = model.validated()?;

        let unavailable: Vec<String> = statistics
            .unavailable(&schema)
            .into_iter()
            .map(str::to_string)
            .collect();
        if !unavailable.is_empty() {
            if !options.allow_missing_statistics {
                return Err(EngineError::StatisticsUnavailable(unavailable));
            }
            log::warn!(
                "Starting without medians for {}; records missing these features will fail",
                unavailable.join(", ")
            );
        }

        let attribution = AttributionEngine::for_model(&model)?;
        log::info!(
            "Predictor ready: {} with {} tree(s), {} features, reference of {rows} rows",
            model.family(),
            model.n_trees(),
            schema.len()
        );

        Ok(Self {
            schema: Arc::new(schema),
            statistics: Arc::new(statistics),
            inference: InferenceAdapter::new(Arc::new(model)),
            attribution,
            options,
        })
    }

    /// Loads the model and reference set from disk.
    pub fn from_paths(
        model_path: &str,
        reference_path: &str,
        target_column: &str,
        options: PredictorOptions,
    ) -> Result<Self, EngineError> {
        log::info!("Loading model from '{model_path}'");
        let model = TreeEnsemble::load(model_path)?;
        let reference = load_reference_set(reference_path, target_column)?;
        Self::new(model, reference, options)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::from_paths(
            &config.model_path,
            &config.reference_path,
            &config.target_column,
            config.predictor_options(),
        )
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn statistics(&self) -> &ReferenceStatistics {
        &self.statistics
    }

    pub fn model(&self) -> &TreeEnsemble {
        self.inference.model()
    }

    pub fn options(&self) -> PredictorOptions {
        self.options
    }

    /// Attribution baseline per class.
    pub fn expected_values(&self) -> Vec<f64> {
        self.attribution.expected_values()
    }

    pub fn normalize(&self, record: &InputRecord) -> NormalizedRow {
        normalize(record, &self.schema)
    }

    pub fn impute(&self, row: &NormalizedRow) -> Result<ImputedRow, ImputeError> {
        impute(row, &self.schema, &self.statistics)
    }

    pub fn classify(&self, row: &ImputedRow) -> Result<PredictionResult, InferenceError> {
        self.inference.predict(&row.vector)
    }

    /// Attributes the raw output of `class` on the same vector the classifier saw.
    pub fn attribute(&self, row: &ImputedRow, class: Disposition) -> Result<Attribution, InferenceError> {
        self.attribution.explain(&row.vector, class)
    }

    pub fn assemble(
        &self,
        row: &ImputedRow,
        prediction: PredictionResult,
        attribution: Attribution,
    ) -> ExplanationRecord {
        ExplanationRecord::assemble(&self.schema, row, prediction, attribution)
    }

    /// Class and probabilities only, skipping attribution.
    pub fn predict(&self, record: &InputRecord) -> Result<PredictionResult, PredictError> {
        let imputed = self.impute(&self.normalize(record))?;
        Ok(self.classify(&imputed)?)
    }

    pub fn predict_with_explanation(
        &self,
        record: &InputRecord,
    ) -> Result<ExplanationRecord, PredictError> {
        let normalized = self.normalize(record);
        log::debug!(
            "Normalized record: {} of {} features missing",
            normalized.missing_count(),
            self.schema.len()
        );
        let imputed = self.impute(&normalized)?;
        let prediction = self.classify(&imputed)?;
        let attribution = self.attribute(&imputed, prediction.class)?;
        Ok(self.assemble(&imputed, prediction, attribution))
    }

    /// The JSON response view, truncated to the configured number of features.
    pub fn respond(&self, record: &InputRecord) -> Result<PredictionResponse, PredictError> {
        Ok(self
            .predict_with_explanation(record)?
            .to_response(self.options.top_features))
    }
}

fn check_compatibility(model: &TreeEnsemble, schema: &FeatureSchema) -> Result<(), EngineError> {
    if model.n_classes != Disposition::COUNT {
        return Err(EngineError::SchemaMismatch(format!(
            "model has {} classes, expected {}",
            model.n_classes,
            Disposition::COUNT
        )));
    }
    if model.n_features() != schema.len() {
        return Err(EngineError::SchemaMismatch(format!(
            "model expects {} features, reference set provides {}",
            model.n_features(),
            schema.len()
        )));
    }
    if let Some((i, (expected, found))) = model
        .feature_names
        .iter()
        .zip(schema.names())
        .enumerate()
        .find(|(_, (m, s))| m != s)
    {
        return Err(EngineError::SchemaMismatch(format!(
            "feature {i} is '{expected}' in the model but '{found}' in the reference set"
        )));
    }
    Ok(())
}

/// Shared, swappable access to the current `Predictor`. Callers take an `Arc`
/// snapshot; a reload replaces the engine for later callers only.
#[derive(Debug)]
pub struct PredictorHandle {
    current: RwLock<Arc<Predictor>>,
}

impl PredictorHandle {
    pub fn new(predictor: Predictor) -> Self {
        Self {
            current: RwLock::new(Arc::new(predictor)),
        }
    }

    pub fn current(&self) -> Arc<Predictor> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Installs `predictor` and returns the engine it replaced.
    pub fn replace(&self, predictor: Predictor) -> Arc<Predictor> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(predictor))
    }

    /// Builds a fresh engine from `config` and swaps it in. On failure the
    /// current engine stays in place.
    pub fn reload(&self, config: &EngineConfig) -> Result<(), EngineError> {
        let predictor = Predictor::from_config(config)?;
        self.replace(predictor);
        log::info!("Predictor reloaded from '{}'", config.model_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Ensemble, Node};
    use crate::test_fixtures::{decision_tree_model, koi_feature_names, reference_set};
    use approx::assert_abs_diff_eq;

    fn predictor() -> Predictor {
        Predictor::new(
            decision_tree_model(),
            reference_set().unwrap(),
            PredictorOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn predictor_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Predictor>();
        assert_send_sync::<PredictorHandle>();
    }

    #[test]
    fn mismatched_feature_names_are_rejected() {
        let mut model = decision_tree_model();
        model.feature_names.swap(0, 1);
        match Predictor::new(model, reference_set().unwrap(), PredictorOptions::default()) {
            Err(EngineError::SchemaMismatch(msg)) => assert!(msg.contains("feature 0")),
            other => panic!("Expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn mismatched_class_count_is_rejected() {
        let mut model = decision_tree_model();
        model.n_classes = 2;
        if let Ensemble::DecisionTree { tree } = &mut model.ensemble {
            for node in &mut tree.nodes {
                if let Node::Leaf { value, .. } = node {
                    value.truncate(2);
                }
            }
        }
        assert!(matches!(
            Predictor::new(model, reference_set().unwrap(), PredictorOptions::default()),
            Err(EngineError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn mismatched_feature_count_is_rejected() {
        let mut model = decision_tree_model();
        model.feature_names.push("koi_extra".into());
        match Predictor::new(model, reference_set().unwrap(), PredictorOptions::default()) {
            Err(EngineError::SchemaMismatch(msg)) => assert!(msg.contains("34 features")),
            other => panic!("Expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn out_of_range_split_feature_fails_startup() {
        let mut model = decision_tree_model();
        if let Ensemble::DecisionTree { tree } = &mut model.ensemble {
            if let Some(Node::Split { feature, .. }) = tree.nodes.first_mut() {
                *feature = 99;
            }
        }
        match Predictor::new(model, reference_set().unwrap(), PredictorOptions::default()) {
            Err(EngineError::Model(ModelError::MalformedTree { node: 0, reason, .. })) => {
                assert!(reason.contains("feature index 99"))
            }
            other => panic!("Expected MalformedTree, got {other:?}"),
        }
    }

    #[test]
    fn count_leaves_are_served_as_probabilities() {
        let mut counts = decision_tree_model();
        if let Ensemble::DecisionTree { tree } = &mut counts.ensemble {
            for node in &mut tree.nodes {
                if let Node::Leaf { value, .. } = node {
                    value.iter_mut().for_each(|v| *v *= 40.0);
                }
            }
        }
        let scaled = Predictor::new(counts, reference_set().unwrap(), PredictorOptions::default()).unwrap();
        let reference = predictor();

        for record in [
            InputRecord::new(),
            InputRecord::new().with("koi_fpflag_ss", 1.0),
            InputRecord::new().with("koi_model_snr", 3.0).with("koi_prad", 40.0),
        ] {
            let got = scaled.predict(&record).unwrap();
            let want = reference.predict(&record).unwrap();
            assert_abs_diff_eq!(got.probabilities.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            assert!(got.confidence <= 1.0);
            assert_eq!(got.class, want.class);
            for (g, w) in got.probabilities.iter().zip(&want.probabilities) {
                assert_abs_diff_eq!(*g, *w, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn unavailable_statistics_fail_startup_unless_allowed() {
        let build_reference = || {
            let mut reference = reference_set().unwrap();
            let mut medians: Vec<Option<f64>> = (0..reference.schema.len())
                .map(|i| reference.statistics.median_at(i))
                .collect();
            let teq = reference.schema.index_of("koi_teq").unwrap();
            medians[teq] = None;
            reference.statistics =
                ReferenceStatistics::from_medians(&reference.schema, medians).unwrap();
            reference
        };

        match Predictor::new(decision_tree_model(), build_reference(), PredictorOptions::default()) {
            Err(EngineError::StatisticsUnavailable(names)) => assert_eq!(names, vec!["koi_teq"]),
            other => panic!("Expected StatisticsUnavailable, got {other:?}"),
        }

        let tolerant = Predictor::new(
            decision_tree_model(),
            build_reference(),
            PredictorOptions {
                allow_missing_statistics: true,
                ..PredictorOptions::default()
            },
        )
        .unwrap();

        let complete: InputRecord = koi_feature_names().into_iter().map(|n| (n, 1.0)).collect();
        assert!(tolerant.predict_with_explanation(&complete).is_ok());

        let without_teq = InputRecord::new().with("koi_period", 3.0);
        assert_eq!(
            tolerant.predict_with_explanation(&without_teq).unwrap_err(),
            PredictError::Impute(ImputeError::StatisticsUnavailable {
                feature: "koi_teq".into()
            })
        );
    }

    #[test]
    fn response_is_truncated_to_configured_top_features() {
        let predictor = Predictor::new(
            decision_tree_model(),
            reference_set().unwrap(),
            PredictorOptions {
                top_features: 3,
                ..PredictorOptions::default()
            },
        )
        .unwrap();
        let response = predictor.respond(&InputRecord::new().with("koi_prad", 2.0)).unwrap();
        assert_eq!(response.top_features.len(), 3);
        assert_eq!(response.missing_features.len(), koi_feature_names().len() - 1);
    }

    #[test]
    fn handle_swaps_engines_without_disturbing_snapshots() {
        let handle = PredictorHandle::new(predictor());
        let before = handle.current();
        let old = handle.replace(predictor());
        assert!(Arc::ptr_eq(&before, &old));
        assert!(!Arc::ptr_eq(&before, &handle.current()));

        let record = InputRecord::new().with("koi_depth", 800.0);
        assert_eq!(
            before.predict_with_explanation(&record).unwrap(),
            handle.current().predict_with_explanation(&record).unwrap()
        );
    }

    #[test]
    fn failed_reload_keeps_current_engine() {
        let handle = PredictorHandle::new(predictor());
        let before = handle.current();
        let config = EngineConfig {
            model_path: "/nonexistent/model.toml".into(),
            ..EngineConfig::default()
        };
        assert!(matches!(handle.reload(&config), Err(EngineError::Model(_))));
        assert!(Arc::ptr_eq(&before, &handle.current()));
    }
}
