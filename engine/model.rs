use crate::inference::InferenceError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the serialized format of a frozen tree ensemble. The
// external training pipeline writes them; this crate only loads and reads them.

/// Version of the artifact layout understood by this build.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// How a split compares a feature value with its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitRule {
    /// `x <= threshold` goes left (CART convention).
    #[default]
    LessOrEqual,
    /// `x < threshold` goes left (histogram boosting convention).
    LessThan,
}

impl SplitRule {
    #[inline]
    pub fn goes_left(self, value: f64, threshold: f64) -> bool {
        match self {
            SplitRule::LessOrEqual => value <= threshold,
            SplitRule::LessThan => value < threshold,
        }
    }
}

/// One node of a tree. Nodes live in a flat vector with the root at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        /// Training weight that reached this node.
        cover: f64,
    },
    Leaf {
        /// Per-output leaf value. Decision trees store one entry per class,
        /// boosted trees store a single margin contribution.
        value: Vec<f64>,
        cover: f64,
    },
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Split { cover, .. } | Node::Leaf { cover, .. } => *cover,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

/// A boosted tree contributes only to the margin of `class`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostedTree {
    pub class: usize,
    pub tree: Tree,
}

/// The model family together with its trees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Ensemble {
    /// A single CART classifier. Leaves hold class distributions.
    DecisionTree { tree: Tree },
    /// Multi-class gradient boosting. Each class margin is its base score plus
    /// the sum of its trees; probabilities are the softmax of the margins.
    GradientBoosted {
        base_score: Vec<f64>,
        trees: Vec<BoostedTree>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    DecisionTree,
    GradientBoosted,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelFamily::DecisionTree => f.write_str("decision tree"),
            ModelFamily::GradientBoosted => f.write_str("gradient-boosted ensemble"),
        }
    }
}

/// The top-level, self-contained, frozen model artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub format_version: u32,
    /// Feature order the trees index into.
    pub feature_names: Vec<String>,
    pub n_classes: usize,
    #[serde(default)]
    pub split_rule: SplitRule,
    pub ensemble: Ensemble,
}

/// Custom error type for model loading, saving, and validation.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Failed to read or write JSON model file: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Unsupported model file extension '{0}'. Expected .toml or .json.")]
    UnsupportedFormat(String),
    #[error("Model format version {found} is not supported (expected {expected}).")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("Model declares {0} classes; at least two are required.")]
    TooFewClasses(usize),
    #[error("Model declares no features.")]
    NoFeatures,
    #[error("Model feature '{0}' is listed more than once.")]
    DuplicateFeature(String),
    #[error("Gradient-boosted model has {found} base scores but {expected} classes.")]
    BaseScoreLength { found: usize, expected: usize },
    #[error("Model contains no trees.")]
    NoTrees,
    #[error("Tree {tree}, node {node}: {reason}")]
    MalformedTree {
        tree: usize,
        node: usize,
        reason: String,
    },
}

impl Tree {
    /// Index of the leaf reached by `x`.
    pub fn leaf_index(&self, x: ArrayView1<f64>, rule: SplitRule) -> usize {
        let mut idx = 0usize;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { .. } => return idx,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if rule.goes_left(x[*feature], *threshold) {
                        *left
                    } else {
                        *right
                    };
                }
            }
        }
    }

    /// Leaf value reached by `x`.
    pub fn leaf_value(&self, x: ArrayView1<f64>, rule: SplitRule) -> &[f64] {
        match &self.nodes[self.leaf_index(x, rule)] {
            Node::Leaf { value, .. } => value,
            Node::Split { .. } => unreachable!("leaf_index only stops at leaves"),
        }
    }

    /// Cover-weighted mean of `output` over all leaves: the value the tree is
    /// expected to produce for a draw from its training distribution.
    pub fn expected_value(&self, output: usize) -> f64 {
        self.expected_from(0, output)
    }

    fn expected_from(&self, idx: usize, output: usize) -> f64 {
        match &self.nodes[idx] {
            Node::Leaf { value, .. } => value[output],
            Node::Split {
                left, right, cover, ..
            } => {
                let left_cover = self.nodes[*left].cover();
                let right_cover = self.nodes[*right].cover();
                (left_cover * self.expected_from(*left, output)
                    + right_cover * self.expected_from(*right, output))
                    / cover
            }
        }
    }

    /// Longest root-to-leaf path, counted in split nodes.
    pub fn depth(&self) -> usize {
        self.depth_from(0)
    }

    fn depth_from(&self, idx: usize) -> usize {
        match &self.nodes[idx] {
            Node::Leaf { .. } => 0,
            Node::Split { left, right, .. } => {
                1 + self.depth_from(*left).max(self.depth_from(*right))
            }
        }
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n, Node::Leaf { .. }))
            .count()
    }

    /// Checks indices, leaf widths, and covers. Children must come after their
    /// parent, which rules out cycles and makes every node reachable at most once.
    fn validate(&self, tree: usize, n_features: usize, leaf_width: usize) -> Result<(), ModelError> {
        let malformed = |node: usize, reason: String| ModelError::MalformedTree { tree, node, reason };
        if self.nodes.is_empty() {
            return Err(malformed(0, "tree has no nodes".to_string()));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    cover,
                } => {
                    if *feature >= n_features {
                        return Err(malformed(
                            idx,
                            format!("feature index {feature} is out of range for {n_features} features"),
                        ));
                    }
                    if !threshold.is_finite() {
                        return Err(malformed(idx, "threshold is not finite".to_string()));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(malformed(idx, format!("child index {child} is invalid")));
                        }
                    }
                    if left == right {
                        return Err(malformed(idx, "both children point to the same node".to_string()));
                    }
                    if !(cover.is_finite() && *cover > 0.0) {
                        return Err(malformed(idx, format!("split cover {cover} must be positive")));
                    }
                }
                Node::Leaf { value, cover } => {
                    if value.len() != leaf_width {
                        return Err(malformed(
                            idx,
                            format!("leaf holds {} values, expected {leaf_width}", value.len()),
                        ));
                    }
                    if value.iter().any(|v| !v.is_finite()) {
                        return Err(malformed(idx, "leaf value is not finite".to_string()));
                    }
                    if !(cover.is_finite() && *cover >= 0.0) {
                        return Err(malformed(idx, format!("leaf cover {cover} must be non-negative")));
                    }
                }
            }
        }
        Ok(())
    }

    /// Rescales every leaf distribution to sum to one.
    fn normalize_leaves(&mut self, tree: usize) -> Result<(), ModelError> {
        for (idx, node) in self.nodes.iter_mut().enumerate() {
            if let Node::Leaf { value, .. } = node {
                if value.iter().any(|v| *v < 0.0) {
                    return Err(ModelError::MalformedTree {
                        tree,
                        node: idx,
                        reason: "class distribution has a negative entry".to_string(),
                    });
                }
                let total: f64 = value.iter().sum();
                if total <= 0.0 {
                    return Err(ModelError::MalformedTree {
                        tree,
                        node: idx,
                        reason: "class distribution is empty".to_string(),
                    });
                }
                value.iter_mut().for_each(|v| *v /= total);
            }
        }
        Ok(())
    }
}

impl TreeEnsemble {
    pub fn family(&self) -> ModelFamily {
        match self.ensemble {
            Ensemble::DecisionTree { .. } => ModelFamily::DecisionTree,
            Ensemble::GradientBoosted { .. } => ModelFamily::GradientBoosted,
        }
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn n_trees(&self) -> usize {
        match &self.ensemble {
            Ensemble::DecisionTree { .. } => 1,
            Ensemble::GradientBoosted { trees, .. } => trees.len(),
        }
    }

    /// Validates the artifact and brings it into canonical form (decision-tree
    /// leaf distributions are rescaled to probabilities).
    pub fn validated(mut self) -> Result<Self, ModelError> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelError::UnsupportedVersion {
                found: self.format_version,
                expected: MODEL_FORMAT_VERSION,
            });
        }
        if self.n_classes < 2 {
            return Err(ModelError::TooFewClasses(self.n_classes));
        }
        if self.feature_names.is_empty() {
            return Err(ModelError::NoFeatures);
        }
        let mut seen = HashSet::new();
        for name in &self.feature_names {
            if !seen.insert(name.as_str()) {
                return Err(ModelError::DuplicateFeature(name.clone()));
            }
        }

        let n_features = self.feature_names.len();
        let n_classes = self.n_classes;
        match &mut self.ensemble {
            Ensemble::DecisionTree { tree } => {
                tree.validate(0, n_features, n_classes)?;
                tree.normalize_leaves(0)?;
            }
            Ensemble::GradientBoosted { base_score, trees } => {
                if base_score.len() != n_classes {
                    return Err(ModelError::BaseScoreLength {
                        found: base_score.len(),
                        expected: n_classes,
                    });
                }
                if trees.is_empty() {
                    return Err(ModelError::NoTrees);
                }
                for (i, boosted) in trees.iter().enumerate() {
                    if boosted.class >= n_classes {
                        return Err(ModelError::MalformedTree {
                            tree: i,
                            node: 0,
                            reason: format!("tree targets class {} of {n_classes}", boosted.class),
                        });
                    }
                    boosted.tree.validate(i, n_features, 1)?;
                }
            }
        }
        Ok(self)
    }

    /// Per-class raw outputs: class probabilities for a decision tree, class
    /// margins for a boosted ensemble.
    pub fn raw_scores(&self, x: ArrayView1<f64>) -> Result<Vec<f64>, InferenceError> {
        self.check_dimension(x.len())?;
        Ok(match &self.ensemble {
            Ensemble::DecisionTree { tree } => tree.leaf_value(x, self.split_rule).to_vec(),
            Ensemble::GradientBoosted { base_score, trees } => {
                let mut scores = base_score.clone();
                for boosted in trees {
                    scores[boosted.class] += boosted.tree.leaf_value(x, self.split_rule)[0];
                }
                scores
            }
        })
    }

    /// Class probabilities for `x`.
    pub fn predict_proba(&self, x: ArrayView1<f64>) -> Result<Vec<f64>, InferenceError> {
        let raw = self.raw_scores(x)?;
        let probabilities = match self.ensemble {
            Ensemble::DecisionTree { .. } => raw,
            Ensemble::GradientBoosted { .. } => softmax(&raw),
        };
        let total: f64 = probabilities.iter().sum();
        if probabilities.iter().any(|p| !p.is_finite()) || total <= 0.0 {
            return Err(InferenceError::DegenerateProbabilities);
        }
        Ok(probabilities)
    }

    /// Most probable class for `x`, ties going to the lowest index.
    pub fn predict(&self, x: ArrayView1<f64>) -> Result<usize, InferenceError> {
        Ok(argmax(&self.predict_proba(x)?))
    }

    /// Number of split nodes that test each feature, across all trees.
    pub fn split_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_features()];
        let trees: Vec<&Tree> = match &self.ensemble {
            Ensemble::DecisionTree { tree } => vec![tree],
            Ensemble::GradientBoosted { trees, .. } => trees.iter().map(|b| &b.tree).collect(),
        };
        for tree in trees {
            for node in &tree.nodes {
                if let Node::Split { feature, .. } = node {
                    counts[*feature] += 1;
                }
            }
        }
        counts
    }

    fn check_dimension(&self, found: usize) -> Result<(), InferenceError> {
        if found != self.n_features() {
            return Err(InferenceError::DimensionMismatch {
                found,
                expected: self.n_features(),
            });
        }
        Ok(())
    }

    /// Saves the model, choosing TOML or JSON from the file extension.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let text = match extension(path).as_str() {
            "toml" => toml::to_string_pretty(self)?,
            "json" => serde_json::to_string_pretty(self)?,
            other => return Err(ModelError::UnsupportedFormat(other.to_string())),
        };
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Loads and validates a model from a `.toml` or `.json` file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let model: TreeEnsemble = match extension(path).as_str() {
            "toml" => toml::from_str(&fs::read_to_string(path)?)?,
            "json" => serde_json::from_str(&fs::read_to_string(path)?)?,
            other => return Err(ModelError::UnsupportedFormat(other.to_string())),
        };
        model.validated()
    }
}

fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

pub fn softmax(raw_scores: &[f64]) -> Vec<f64> {
    // Log-sum-exp trick for numerical stability
    let max_val = raw_scores
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = raw_scores.iter().map(|&s| (s - max_val).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|&e| e / sum).collect()
}

/// Index of the largest value; the first one wins on ties.
pub fn argmax(values: &[f64]) -> usize {
    let mut best = 0usize;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
