//! # Attribution Engine
//!
//! Exact path-dependent TreeSHAP (Lundberg et al., "From local explanations to
//! global understanding with explainable AI for trees", Algorithm 2). Node
//! covers stand in for the background distribution, so an explanation needs
//! nothing but the model.
//!
//! Each model family has its own `AttributionSource`. Both share the recursive
//! walk in [`tree_shap`] and differ only in which trees feed a class and what
//! constant sits under them. For every class `c` and input `x`:
//!
//! ```text
//! expected_value(c) + sum(contributions(x, c)) == raw_output(x, c)
//! ```

use crate::inference::InferenceError;
use crate::model::{Ensemble, ModelError, SplitRule, Tree, TreeEnsemble};
use crate::types::{Disposition, FeatureVector};
use ndarray::ArrayView1;

/// Per-feature attributions for one class of one input.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    /// Expected raw output for the class before any feature is known.
    pub baseline: f64,
    /// One signed contribution per schema feature.
    pub contributions: Vec<f64>,
}

impl Attribution {
    /// `baseline + sum(contributions)`, the raw output this attribution explains.
    pub fn reconstructed_output(&self) -> f64 {
        self.baseline + self.contributions.iter().sum::<f64>()
    }
}

/// A model-family-specific explainer, built once and shared between threads.
pub trait AttributionSource: Send + Sync {
    fn n_features(&self) -> usize;

    fn n_classes(&self) -> usize;

    /// Expected raw output for `class` under the training distribution.
    fn expected_value(&self, class: usize) -> f64;

    /// Signed TreeSHAP values of `x` toward the raw output of `class`.
    fn contributions(&self, x: ArrayView1<f64>, class: usize) -> Vec<f64>;
}

/// Explains a single CART tree. Raw output for a class is the leaf's class
/// probability.
#[derive(Debug, Clone)]
pub struct DecisionTreeExplainer {
    tree: Tree,
    split_rule: SplitRule,
    n_features: usize,
    expected: Vec<f64>,
}

impl DecisionTreeExplainer {
    pub fn new(tree: Tree, split_rule: SplitRule, n_features: usize, n_classes: usize) -> Self {
        let expected = (0..n_classes).map(|c| tree.expected_value(c)).collect();
        Self {
            tree,
            split_rule,
            n_features,
            expected,
        }
    }
}

impl AttributionSource for DecisionTreeExplainer {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn n_classes(&self) -> usize {
        self.expected.len()
    }

    fn expected_value(&self, class: usize) -> f64 {
        self.expected[class]
    }

    fn contributions(&self, x: ArrayView1<f64>, class: usize) -> Vec<f64> {
        let mut phi = vec![0.0; self.n_features];
        tree_shap(&self.tree, self.split_rule, class, x, &mut phi);
        phi
    }
}

/// Explains a multi-class boosted ensemble. Raw output for a class is its
/// margin before softmax.
#[derive(Debug, Clone)]
pub struct BoostedExplainer {
    trees_by_class: Vec<Vec<Tree>>,
    split_rule: SplitRule,
    n_features: usize,
    expected: Vec<f64>,
}

impl BoostedExplainer {
    pub fn new(
        base_score: &[f64],
        trees: impl IntoIterator<Item = (usize, Tree)>,
        split_rule: SplitRule,
        n_features: usize,
    ) -> Self {
        let mut trees_by_class = vec![Vec::new(); base_score.len()];
        for (class, tree) in trees {
            trees_by_class[class].push(tree);
        }
        let expected = trees_by_class
            .iter()
            .zip(base_score)
            .map(|(trees, base)| base + trees.iter().map(|t| t.expected_value(0)).sum::<f64>())
            .collect();
        Self {
            trees_by_class,
            split_rule,
            n_features,
            expected,
        }
    }
}

impl AttributionSource for BoostedExplainer {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn n_classes(&self) -> usize {
        self.expected.len()
    }

    fn expected_value(&self, class: usize) -> f64 {
        self.expected[class]
    }

    fn contributions(&self, x: ArrayView1<f64>, class: usize) -> Vec<f64> {
        let mut phi = vec![0.0; self.n_features];
        for tree in &self.trees_by_class[class] {
            tree_shap(tree, self.split_rule, 0, x, &mut phi);
        }
        phi
    }
}

/// Owns the explainer chosen for the loaded model.
pub struct AttributionEngine {
    source: Box<dyn AttributionSource>,
}

impl std::fmt::Debug for AttributionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributionEngine")
            .field("n_features", &self.source.n_features())
            .field("n_classes", &self.source.n_classes())
            .finish()
    }
}

impl AttributionEngine {
    pub fn new(source: Box<dyn AttributionSource>) -> Self {
        Self { source }
    }

    /// Builds the explainer matching the model's family. The model is validated
    /// first, so decision-tree leaves are explained as probabilities.
    pub fn for_model(model: &TreeEnsemble) -> Result<Self, ModelError> {
        let model = model.clone().validated()?;
        let n_features = model.n_features();
        let source: Box<dyn AttributionSource> = match &model.ensemble {
            Ensemble::DecisionTree { tree } => Box::new(DecisionTreeExplainer::new(
                tree.clone(),
                model.split_rule,
                n_features,
                model.n_classes,
            )),
            Ensemble::GradientBoosted { base_score, trees } => Box::new(BoostedExplainer::new(
                base_score,
                trees.iter().map(|b| (b.class, b.tree.clone())),
                model.split_rule,
                n_features,
            )),
        };
        log::debug!(
            "Attribution baselines for {}: {:?}",
            model.family(),
            (0..model.n_classes)
                .map(|c| source.expected_value(c))
                .collect::<Vec<_>>()
        );
        Ok(Self { source })
    }

    /// Baseline for every class, in class-index order.
    pub fn expected_values(&self) -> Vec<f64> {
        (0..self.source.n_classes())
            .map(|c| self.source.expected_value(c))
            .collect()
    }

    /// Attributes the raw output of `class` for `vector`.
    pub fn explain(
        &self,
        vector: &FeatureVector,
        class: Disposition,
    ) -> Result<Attribution, InferenceError> {
        if vector.len() != self.source.n_features() {
            return Err(InferenceError::DimensionMismatch {
                found: vector.len(),
                expected: self.source.n_features(),
            });
        }
        let index = class.index();
        if index >= self.source.n_classes() {
            return Err(InferenceError::UnknownClass(index));
        }
        Ok(Attribution {
            baseline: self.source.expected_value(index),
            contributions: self.source.contributions(vector.as_view(), index),
        })
    }
}

// --- TreeSHAP internals ---

#[derive(Debug, Clone, Copy)]
struct PathElement {
    /// `None` only for the sentinel element at the root.
    feature: Option<usize>,
    /// Fraction of paths flowing through here when the feature is unknown.
    zero_fraction: f64,
    /// 1 when `x` follows this branch, 0 otherwise.
    one_fraction: f64,
    /// Permutation weight for subsets of the current size.
    weight: f64,
}

/// Adds the attributions of one tree's output slot to `phi`.
pub fn tree_shap(tree: &Tree, rule: SplitRule, output: usize, x: ArrayView1<f64>, phi: &mut [f64]) {
    let walker = ShapWalker {
        tree,
        rule,
        output,
        x,
    };
    walker.recurse(0, &[], 1.0, 1.0, None, phi);
}

struct ShapWalker<'a, 'v> {
    tree: &'a Tree,
    rule: SplitRule,
    output: usize,
    x: ArrayView1<'v, f64>,
}

impl ShapWalker<'_, '_> {
    fn recurse(
        &self,
        node: usize,
        parent_path: &[PathElement],
        zero_fraction: f64,
        one_fraction: f64,
        feature: Option<usize>,
        phi: &mut [f64],
    ) {
        // Every weight downstream of an all-zero element is zero.
        if zero_fraction == 0.0 && one_fraction == 0.0 {
            return;
        }

        let mut path = parent_path.to_vec();
        extend(&mut path, zero_fraction, one_fraction, feature);

        match &self.tree.nodes[node] {
            crate::model::Node::Leaf { value, .. } => {
                let leaf_value = value[self.output];
                for i in 1..path.len() {
                    let el = path[i];
                    if let Some(f) = el.feature {
                        phi[f] += unwound_sum(&path, i) * (el.one_fraction - el.zero_fraction) * leaf_value;
                    }
                }
            }
            crate::model::Node::Split {
                feature: split_feature,
                threshold,
                left,
                right,
                cover,
            } => {
                let (hot, cold) = if self.rule.goes_left(self.x[*split_feature], *threshold) {
                    (*left, *right)
                } else {
                    (*right, *left)
                };
                let hot_zero = self.tree.nodes[hot].cover() / cover;
                let cold_zero = self.tree.nodes[cold].cover() / cover;

                // A feature already on the path is merged with its earlier split.
                let mut incoming_zero = 1.0;
                let mut incoming_one = 1.0;
                if let Some(k) = path.iter().position(|el| el.feature == Some(*split_feature)) {
                    incoming_zero = path[k].zero_fraction;
                    incoming_one = path[k].one_fraction;
                    unwind(&mut path, k);
                }

                self.recurse(
                    hot,
                    &path,
                    hot_zero * incoming_zero,
                    incoming_one,
                    Some(*split_feature),
                    phi,
                );
                self.recurse(
                    cold,
                    &path,
                    cold_zero * incoming_zero,
                    0.0,
                    Some(*split_feature),
                    phi,
                );
            }
        }
    }
}

fn extend(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let d = depth as f64;
    for i in (0..depth).rev() {
        let fi = i as f64;
        path[i + 1].weight += one_fraction * path[i].weight * (fi + 1.0) / (d + 1.0);
        path[i].weight = zero_fraction * path[i].weight * (d - fi) / (d + 1.0);
    }
}

/// Removes element `index` from the path, undoing its `extend`.
fn unwind(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let d = depth as f64;
    let mut next_one_portion = path[depth].weight;

    for i in (0..depth).rev() {
        let fi = i as f64;
        if one_fraction != 0.0 {
            let tmp = path[i].weight;
            path[i].weight = next_one_portion * (d + 1.0) / ((fi + 1.0) * one_fraction);
            next_one_portion = tmp - path[i].weight * zero_fraction * (d - fi) / (d + 1.0);
        } else {
            path[i].weight = path[i].weight * (d + 1.0) / (zero_fraction * (d - fi));
        }
    }

    for i in index..depth {
        path[i].feature = path[i + 1].feature;
        path[i].zero_fraction = path[i + 1].zero_fraction;
        path[i].one_fraction = path[i + 1].one_fraction;
    }
    path.pop();
}

/// Total permutation weight of the path with element `index` removed.
fn unwound_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let one_fraction = path[index].one_fraction;
    let zero_fraction = path[index].zero_fraction;
    let d = depth as f64;
    let mut next_one_portion = path[depth].weight;
    let mut total = 0.0;

    for i in (0..depth).rev() {
        let fi = i as f64;
        if one_fraction != 0.0 {
            let tmp = next_one_portion * (d + 1.0) / ((fi + 1.0) * one_fraction);
            total += tmp;
            next_one_portion = path[i].weight - tmp * zero_fraction * ((d - fi) / (d + 1.0));
        } else if zero_fraction != 0.0 {
            total += (path[i].weight / zero_fraction) / ((d - fi) / (d + 1.0));
        }
    }
    total
}
