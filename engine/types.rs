use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

/// Dense, fully populated feature values aligned to a `FeatureSchema`.
///
/// Only the imputation service builds these, so a `FeatureVector` never holds
/// a missing marker.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureVector(pub Array1<f64>);

impl FeatureVector {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn from_vec(values: Vec<f64>) -> Self {
        Self(Array1::from_vec(values))
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }
}

impl Deref for FeatureVector {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Array1<f64>> for FeatureVector {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

/// The three-way classification target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Disposition {
    FalsePositive,
    Candidate,
    Confirmed,
}

impl Disposition {
    /// All dispositions in class-index order.
    pub const ALL: [Disposition; 3] = [
        Disposition::FalsePositive,
        Disposition::Candidate,
        Disposition::Confirmed,
    ];

    /// Number of classes the engine works with.
    pub const COUNT: usize = 3;

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        match self {
            Disposition::FalsePositive => 0,
            Disposition::Candidate => 1,
            Disposition::Confirmed => 2,
        }
    }

    /// Human-readable label used in responses, tables, and reports.
    pub fn label(self) -> &'static str {
        match self {
            Disposition::FalsePositive => "FALSE POSITIVE",
            Disposition::Candidate => "CANDIDATE",
            Disposition::Confirmed => "CONFIRMED",
        }
    }

    /// Column-safe name used for `prob_<class>` output columns.
    pub fn column_key(self) -> &'static str {
        match self {
            Disposition::FalsePositive => "false_positive",
            Disposition::Candidate => "candidate",
            Disposition::Confirmed => "confirmed",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|d| d.label() == label)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
