//! # Imputation Service
//!
//! Fills every missing slot of a `NormalizedRow` with that feature's reference
//! median. Each feature is handled on its own, so every filled value can be
//! traced to one published statistic.

use crate::normalize::{NormalizedRow, Slot};
use crate::schema::{FeatureSchema, ReferenceStatistics};
use crate::types::FeatureVector;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImputeError {
    #[error("No reference statistic is available to impute feature '{feature}'.")]
    StatisticsUnavailable { feature: String },
    #[error("Normalized row has {found} slots, but the schema has {expected} features.")]
    RowLength { found: usize, expected: usize },
}

/// A fully populated vector plus the bookkeeping of which slots were filled.
#[derive(Debug, Clone, PartialEq)]
pub struct ImputedRow {
    pub vector: FeatureVector,
    /// One flag per schema feature; `true` where the median was used.
    pub imputed: Vec<bool>,
}

impl ImputedRow {
    /// Names of the imputed features, in schema order.
    pub fn imputed_names(&self, schema: &FeatureSchema) -> Vec<String> {
        schema
            .iter()
            .zip(&self.imputed)
            .filter(|(_, was_imputed)| **was_imputed)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    pub fn imputed_count(&self) -> usize {
        self.imputed.iter().filter(|f| **f).count()
    }
}

/// Replaces missing slots with reference medians.
pub fn impute(
    row: &NormalizedRow,
    schema: &FeatureSchema,
    statistics: &ReferenceStatistics,
) -> Result<ImputedRow, ImputeError> {
    if row.len() != schema.len() {
        return Err(ImputeError::RowLength {
            found: row.len(),
            expected: schema.len(),
        });
    }

    let mut values = Vec::with_capacity(row.len());
    let mut imputed = Vec::with_capacity(row.len());
    for (index, slot) in row.slots().iter().enumerate() {
        match slot {
            Slot::Value(v) => {
                values.push(*v);
                imputed.push(false);
            }
            Slot::Missing(_) => {
                let fill = statistics.median_at(index).ok_or_else(|| {
                    ImputeError::StatisticsUnavailable {
                        feature: schema.name(index).unwrap_or_default().to_string(),
                    }
                })?;
                values.push(fill);
                imputed.push(true);
            }
        }
    }

    Ok(ImputedRow {
        vector: FeatureVector::from_vec(values),
        imputed,
    })
}
