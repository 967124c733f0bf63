use approx::assert_abs_diff_eq;
use exovet::explain::ExplanationRecord;
use exovet::model::TreeEnsemble;
use exovet::normalize::{InputRecord, RawValue};
use exovet::predictor::{Predictor, PredictorOptions};
use exovet::schema::DEFAULT_TARGET_COLUMN;
use exovet::test_fixtures::{
    boosted_model, decision_tree_model, koi_feature_names, reference_median, write_fixture_files,
};
use ndarray::Array1;
use tempfile::{TempDir, tempdir};

/// Writes fixtures for `model` and loads a predictor from disk, so the whole
/// loading path (polars reference read, TOML model read) is exercised.
fn load_predictor(model: &TreeEnsemble) -> (TempDir, Predictor) {
    let dir = tempdir().expect("temporary directory");
    let paths = write_fixture_files(dir.path(), model).expect("write fixtures");
    let predictor = Predictor::from_paths(
        paths.model.to_str().expect("path str"),
        paths.reference.to_str().expect("path str"),
        DEFAULT_TARGET_COLUMN,
        PredictorOptions::default(),
    )
    .expect("predictor loads");
    (dir, predictor)
}

fn predictors() -> Vec<(TempDir, Predictor)> {
    vec![
        load_predictor(&decision_tree_model()),
        load_predictor(&boosted_model()),
    ]
}

fn complete_record(scale: f64) -> InputRecord {
    koi_feature_names()
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let value = if name.starts_with("koi_fpflag") {
                (i % 2) as f64
            } else {
                scale * (i + 1) as f64
            };
            (name, value)
        })
        .collect()
}

fn entry<'a>(record: &'a ExplanationRecord, feature: &str) -> &'a exovet::explain::AttributionEntry {
    record
        .attributions
        .iter()
        .find(|e| e.feature == feature)
        .unwrap_or_else(|| panic!("no attribution entry for {feature}"))
}

/// Rebuilds the imputed vector from the attribution entries, in schema order.
fn vector_of(record: &ExplanationRecord) -> Array1<f64> {
    Array1::from_vec(
        koi_feature_names()
            .iter()
            .map(|name| entry(record, name).value)
            .collect(),
    )
}

#[test]
fn missing_feature_takes_the_reference_median() {
    for (_dir, predictor) in predictors() {
        let mut record = complete_record(1.0);
        record.insert("koi_depth", RawValue::Null);
        let explanation = predictor.predict_with_explanation(&record).unwrap();

        let depth = entry(&explanation, "koi_depth");
        assert!(depth.was_missing);
        assert_abs_diff_eq!(depth.value, reference_median("koi_depth").unwrap(), epsilon = 1e-9);
        assert_eq!(explanation.missing_features, vec!["koi_depth"]);
        for e in explanation.attributions.iter().filter(|e| e.feature != "koi_depth") {
            assert!(!e.was_missing, "{} should not be imputed", e.feature);
        }
    }
}

#[test]
fn complete_record_is_not_imputed() {
    for (_dir, predictor) in predictors() {
        let record = complete_record(3.5);
        let explanation = predictor.predict_with_explanation(&record).unwrap();
        assert!(explanation.missing_features.is_empty());
        for e in &explanation.attributions {
            assert!(!e.was_missing);
            match record.get(&e.feature) {
                Some(RawValue::Number(v)) => assert_eq!(e.value.to_bits(), v.to_bits()),
                other => panic!("unexpected input for {}: {other:?}", e.feature),
            }
        }
    }
}

#[test]
fn probabilities_sum_to_one_and_confidence_is_the_winner() {
    for (_dir, predictor) in predictors() {
        for scale in [0.01, 1.0, 10.0, 100.0] {
            let explanation = predictor
                .predict_with_explanation(&complete_record(scale))
                .unwrap();
            let p = &explanation.prediction.probabilities;
            assert_eq!(p.len(), 3);
            assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-6);
            assert_eq!(explanation.confidence(), p[explanation.class().index()]);
            assert!(p.iter().all(|&x| x <= explanation.confidence()));
        }
    }
}

#[test]
fn top_features_are_sorted_by_magnitude() {
    for (_dir, predictor) in predictors() {
        let record = InputRecord::new()
            .with("koi_fpflag_ss", 1.0)
            .with("koi_depth", 40.0)
            .with("koi_prad", 22.0);
        let response = predictor.respond(&record).unwrap();
        assert_eq!(response.top_features.len(), 10);
        for pair in response.top_features.windows(2) {
            assert!(pair[0].importance.abs() >= pair[1].importance.abs());
        }
    }
}

#[test]
fn attributions_add_up_to_the_raw_output() {
    for (_dir, predictor) in predictors() {
        for scale in [0.05, 2.0, 40.0] {
            let mut record = complete_record(scale);
            record.insert("koi_teq", "not measured");
            let explanation = predictor.predict_with_explanation(&record).unwrap();

            let raw = predictor.model().raw_scores(vector_of(&explanation).view()).unwrap();
            let target = raw[explanation.class().index()];
            let total = explanation.baseline
                + explanation
                    .attributions
                    .iter()
                    .map(|e| e.contribution)
                    .sum::<f64>();
            assert_abs_diff_eq!(total, target, epsilon = 1e-9 * target.abs().max(1.0));
        }
    }
}

#[test]
fn repeated_prediction_is_bit_identical() {
    for (_dir, predictor) in predictors() {
        let record = InputRecord::new()
            .with("koi_period", 12.3)
            .with("koi_model_snr", "55.1")
            .with("koi_impact", true);
        let first = predictor.predict_with_explanation(&record).unwrap();
        for _ in 0..5 {
            let again = predictor.predict_with_explanation(&record).unwrap();
            assert_eq!(first, again);
            for (a, b) in first.attributions.iter().zip(&again.attributions) {
                assert_eq!(a.contribution.to_bits(), b.contribution.to_bits());
            }
        }
    }
}

#[test]
fn four_feature_record_reports_the_other_features_missing() {
    let provided = ["koi_period", "koi_prad", "koi_steff", "koi_depth"];
    for (_dir, predictor) in predictors() {
        let record = InputRecord::from_json(
            r#"{"koi_period": 365.25, "koi_prad": 1.2, "koi_steff": 5778.0, "koi_depth": 125.8}"#,
        )
        .unwrap();
        let response = predictor.respond(&record).unwrap();

        let expected: Vec<String> = koi_feature_names()
            .into_iter()
            .filter(|n| !provided.contains(&n.as_str()))
            .collect();
        assert_eq!(expected.len(), 29);
        assert_eq!(response.missing_features, expected);
        assert_eq!(response.probabilities.len(), 3);
        assert_abs_diff_eq!(response.probabilities.values().sum::<f64>(), 1.0, epsilon = 1e-6);
        assert!(["FALSE POSITIVE", "CANDIDATE", "CONFIRMED"].contains(&response.prediction_label.as_str()));
    }
}

#[test]
fn record_missing_only_depth_marks_only_depth() {
    for (_dir, predictor) in predictors() {
        let complete = complete_record(2.0);
        let record: InputRecord = koi_feature_names()
            .into_iter()
            .filter(|n| n != "koi_depth")
            .map(|n| {
                let value = complete.get(&n).cloned().unwrap();
                (n, value)
            })
            .collect();

        let explanation = predictor.predict_with_explanation(&record).unwrap();
        for e in &explanation.attributions {
            assert_eq!(e.was_missing, e.feature == "koi_depth", "{}", e.feature);
        }
        assert_abs_diff_eq!(
            entry(&explanation, "koi_depth").value,
            reference_median("koi_depth").unwrap(),
            epsilon = 1e-9
        );
    }
}

#[test]
fn all_imputed_record_still_gets_a_full_explanation() {
    for (_dir, predictor) in predictors() {
        let explanation = predictor.predict_with_explanation(&InputRecord::new()).unwrap();
        assert_eq!(explanation.attributions.len(), 33);
        assert_eq!(explanation.missing_features.len(), 33);
        assert!(explanation.attributions.iter().all(|e| e.was_missing));
    }
}

#[test]
fn predictor_is_shareable_across_threads() {
    let (_dir, predictor) = load_predictor(&boosted_model());
    let record = complete_record(1.5);
    let expected = predictor.predict_with_explanation(&record).unwrap();
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| predictor.predict_with_explanation(&record).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    });
}
