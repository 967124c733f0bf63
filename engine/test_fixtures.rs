//! Deterministic fixtures: the KOI feature list, a synthetic reference set,
//! and two small hand-built models (one per family) over that schema.
//!
//! Reference values are generated from a closed form, so the medians are known
//! without reading any file. Each non-flag feature sweeps its range in a fixed
//! permutation of `REFERENCE_ROWS` evenly spaced steps.

use crate::model::{
    BoostedTree, Ensemble, MODEL_FORMAT_VERSION, ModelError, Node, SplitRule, Tree, TreeEnsemble,
};
use crate::schema::{
    DEFAULT_TARGET_COLUMN, FeatureSchema, ReferenceSet, ReferenceStatistics, SchemaError, median,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Number of rows in the synthetic reference set.
pub const REFERENCE_ROWS: usize = 41;

/// KOI features with the range the synthetic reference set spans for each.
/// `koi_fpflag_*` are 0/1 flags.
const KOI_FEATURES: [(&str, f64, f64); 33] = [
    ("koi_dikco_msky", 0.0, 5.0),
    ("koi_dicco_msky", 0.0, 5.0),
    ("koi_max_mult_ev", 5.0, 500.0),
    ("koi_fwm_srao", -5.0, 5.0),
    ("koi_fwm_sdeco", -5.0, 5.0),
    ("koi_dikco_mra", -2.0, 2.0),
    ("koi_model_snr", 5.0, 400.0),
    ("koi_dikco_mdec", -2.0, 2.0),
    ("koi_dicco_mdec", -2.0, 2.0),
    ("koi_ror", 0.005, 0.5),
    ("koi_dicco_mra", -2.0, 2.0),
    ("koi_prad", 0.5, 30.0),
    ("koi_fpflag_ss", 0.0, 1.0),
    ("koi_dor", 2.0, 200.0),
    ("koi_fpflag_co", 0.0, 1.0),
    ("koi_max_sngle_ev", 2.0, 100.0),
    ("koi_period", 0.5, 400.0),
    ("koi_fwm_prao", -0.01, 0.01),
    ("koi_num_transits", 3.0, 1500.0),
    ("koi_ldm_coeff1", 0.2, 0.6),
    ("koi_incl", 75.0, 90.0),
    ("koi_fwm_stat_sig", 0.0, 1.0),
    ("koi_depth", 20.0, 20000.0),
    ("koi_fwm_pdeco", -0.01, 0.01),
    ("koi_ldm_coeff2", 0.1, 0.4),
    ("koi_bin_oedp_sig", 0.0, 1.0),
    ("koi_count", 1.0, 6.0),
    ("koi_fpflag_nt", 0.0, 1.0),
    ("koi_teq", 300.0, 2500.0),
    ("koi_insol", 0.5, 5000.0),
    ("koi_impact", 0.0, 1.2),
    ("koi_steff", 3500.0, 7500.0),
    ("koi_fwm_sra", 280.0, 300.0),
];

pub fn koi_feature_names() -> Vec<String> {
    KOI_FEATURES.iter().map(|(name, _, _)| name.to_string()).collect()
}

pub fn koi_schema() -> Result<FeatureSchema, SchemaError> {
    FeatureSchema::new(koi_feature_names())
}

pub fn feature_index(name: &str) -> Option<usize> {
    KOI_FEATURES.iter().position(|(n, _, _)| *n == name)
}

/// Synthetic reference value for `row` and feature index `feature`.
pub fn reference_value(row: usize, feature: usize) -> f64 {
    let (name, lo, hi) = KOI_FEATURES[feature];
    let step = (row * 7 + feature * 13) % REFERENCE_ROWS;
    let phase = step as f64 / REFERENCE_ROWS as f64;
    if name.starts_with("koi_fpflag") {
        if phase < 0.3 { 1.0 } else { 0.0 }
    } else {
        lo + (hi - lo) * phase
    }
}

/// Disposition index stored in the target column for `row`.
pub fn reference_target(row: usize) -> usize {
    row % 3
}

/// Median of the synthetic reference column for `feature`.
pub fn reference_median(feature: &str) -> Option<f64> {
    let index = feature_index(feature)?;
    median((0..REFERENCE_ROWS).map(|row| reference_value(row, index)))
}

/// The synthetic reference set as CSV text, target column last.
pub fn reference_csv() -> String {
    let mut header: Vec<&str> = KOI_FEATURES.iter().map(|(name, _, _)| *name).collect();
    header.push(DEFAULT_TARGET_COLUMN);
    let mut out = header.join(",");
    out.push('\n');
    for row in 0..REFERENCE_ROWS {
        let mut cells: Vec<String> = (0..KOI_FEATURES.len())
            .map(|f| reference_value(row, f).to_string())
            .collect();
        cells.push(reference_target(row).to_string());
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// The synthetic reference set, built in memory.
pub fn reference_set() -> Result<ReferenceSet, SchemaError> {
    let schema = koi_schema()?;
    let columns: Vec<Vec<Option<f64>>> = (0..KOI_FEATURES.len())
        .map(|f| (0..REFERENCE_ROWS).map(|row| Some(reference_value(row, f))).collect())
        .collect();
    let statistics = ReferenceStatistics::from_columns(&schema, &columns)?;
    Ok(ReferenceSet {
        schema,
        statistics,
        rows: REFERENCE_ROWS,
    })
}

/// Split on a named KOI feature. An unknown name gets the first out-of-range
/// index, so model validation rejects the tree.
fn split(feature: &str, threshold: f64, left: usize, right: usize, cover: f64) -> Node {
    Node::Split {
        feature: feature_index(feature).unwrap_or(KOI_FEATURES.len()),
        threshold,
        left,
        right,
        cover,
    }
}

/// Leaf holding the class distribution of `counts`, covered by their total.
fn class_leaf(counts: [f64; 3]) -> Node {
    let total: f64 = counts.iter().sum();
    Node::Leaf {
        value: counts.iter().map(|c| c / total).collect(),
        cover: total,
    }
}

/// CART tree over the false-positive flags, signal strength, size, and depth.
pub fn decision_tree_model() -> TreeEnsemble {
    let nodes = vec![
        split("koi_fpflag_ss", 0.5, 1, 2, 1000.0),
        split("koi_fpflag_co", 0.5, 3, 4, 700.0),
        class_leaf([280.0, 15.0, 5.0]),
        split("koi_model_snr", 30.0, 5, 6, 560.0),
        class_leaf([120.0, 15.0, 5.0]),
        split("koi_prad", 4.0, 7, 8, 220.0),
        split("koi_depth", 1500.0, 9, 10, 340.0),
        class_leaf([20.0, 90.0, 20.0]),
        class_leaf([50.0, 30.0, 10.0]),
        class_leaf([10.0, 60.0, 150.0]),
        split("koi_fpflag_nt", 0.5, 11, 12, 120.0),
        class_leaf([10.0, 30.0, 60.0]),
        class_leaf([15.0, 3.0, 2.0]),
    ];
    TreeEnsemble {
        format_version: MODEL_FORMAT_VERSION,
        feature_names: koi_feature_names(),
        n_classes: 3,
        split_rule: SplitRule::LessOrEqual,
        ensemble: Ensemble::DecisionTree {
            tree: Tree { nodes },
        },
    }
}

/// Depth-two tree: `root` splits into `left` and `right`, each ending in two
/// scalar leaves.
fn depth_two(
    root: (&str, f64),
    left: (&str, f64),
    right: (&str, f64),
    leaves: [f64; 4],
    covers: [f64; 4],
) -> Tree {
    let left_cover = covers[0] + covers[1];
    let right_cover = covers[2] + covers[3];
    let scalar = |i: usize| Node::Leaf {
        value: vec![leaves[i]],
        cover: covers[i],
    };
    Tree {
        nodes: vec![
            split(root.0, root.1, 1, 2, left_cover + right_cover),
            split(left.0, left.1, 3, 4, left_cover),
            split(right.0, right.1, 5, 6, right_cover),
            scalar(0),
            scalar(1),
            scalar(2),
            scalar(3),
        ],
    }
}

/// Three-class boosted ensemble, two or three trees per class. Class 2 reuses
/// `koi_depth` twice within one tree.
pub fn boosted_model() -> TreeEnsemble {
    let trees = vec![
        BoostedTree {
            class: 0,
            tree: depth_two(
                ("koi_fpflag_ss", 0.5),
                ("koi_fpflag_co", 0.5),
                ("koi_impact", 0.9),
                [-0.6, 0.9, 1.1, 1.4],
                [500.0, 150.0, 200.0, 150.0],
            ),
        },
        BoostedTree {
            class: 1,
            tree: depth_two(
                ("koi_model_snr", 40.0),
                ("koi_period", 50.0),
                ("koi_fpflag_nt", 0.5),
                [0.5, 0.2, 0.3, -0.7],
                [250.0, 250.0, 400.0, 100.0],
            ),
        },
        BoostedTree {
            class: 2,
            tree: depth_two(
                ("koi_fpflag_ss", 0.5),
                ("koi_count", 2.5),
                ("koi_steff", 6000.0),
                [-0.1, 0.9, -1.2, -1.0],
                [400.0, 250.0, 200.0, 150.0],
            ),
        },
        BoostedTree {
            class: 0,
            tree: depth_two(
                ("koi_depth", 1500.0),
                ("koi_model_snr", 25.0),
                ("koi_prad", 15.0),
                [0.3, -0.4, -0.2, 0.8],
                [200.0, 400.0, 300.0, 100.0],
            ),
        },
        BoostedTree {
            class: 1,
            tree: depth_two(
                ("koi_teq", 1200.0),
                ("koi_depth", 800.0),
                ("koi_insol", 1000.0),
                [0.4, 0.1, -0.1, -0.5],
                [300.0, 300.0, 250.0, 150.0],
            ),
        },
        BoostedTree {
            class: 2,
            tree: depth_two(
                ("koi_prad", 4.0),
                ("koi_depth", 1500.0),
                ("koi_teq", 900.0),
                [0.6, 0.2, 0.1, -0.4],
                [350.0, 250.0, 200.0, 200.0],
            ),
        },
        BoostedTree {
            class: 2,
            tree: depth_two(
                ("koi_depth", 2000.0),
                ("koi_depth", 300.0),
                ("koi_ror", 0.1),
                [0.1, 0.3, 0.2, -0.3],
                [150.0, 350.0, 300.0, 200.0],
            ),
        },
    ];
    TreeEnsemble {
        format_version: MODEL_FORMAT_VERSION,
        feature_names: koi_feature_names(),
        n_classes: 3,
        split_rule: SplitRule::LessThan,
        ensemble: Ensemble::GradientBoosted {
            base_score: vec![-0.2, 0.1, 0.0],
            trees,
        },
    }
}

/// Paths of fixture files written to disk.
#[derive(Debug, Clone)]
pub struct FixturePaths {
    pub reference: PathBuf,
    pub model: PathBuf,
}

/// Writes `reference.csv` and the given model (as `model.toml`) into `dir`.
pub fn write_fixture_files(dir: &Path, model: &TreeEnsemble) -> Result<FixturePaths, ModelError> {
    let reference = dir.join("reference.csv");
    fs::write(&reference, reference_csv())?;
    let model_path = dir.join("model.toml");
    model.save(&model_path.to_string_lossy())?;
    Ok(FixturePaths {
        reference,
        model: model_path,
    })
}
