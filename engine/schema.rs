//! # Feature Schema Registry and Reference Statistics
//!
//! The reference training set is read exactly once, at engine initialization.
//! Its columns (minus the target column) become the `FeatureSchema`, and the
//! per-column medians become the `ReferenceStatistics` used as imputation fill
//! values. Neither is mutated afterwards.
//!
//! Loading follows the same approach as the other tabular readers in this crate:
//! polars reads the whole file, every feature column is cast to `Float64`
//! non-strictly (unparsable text becomes null), and only finite values take
//! part in the median.

use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Name of the target column in the KOI reference set.
pub const DEFAULT_TARGET_COLUMN: &str = "koi_disposition_num";

/// Errors raised while building the schema or reading the reference set.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The target column '{0}' was not found in the reference set.")]
    TargetColumnNotFound(String),
    #[error("The reference set has no feature columns besides the target column.")]
    EmptySchema,
    #[error("Feature '{0}' appears more than once in the schema.")]
    DuplicateFeature(String),
    #[error("The reference set at '{0}' contains no data rows.")]
    NoRows(String),
    #[error("Statistics were computed for {found} features, but the schema has {expected}.")]
    StatisticsLength { found: usize, expected: usize },
    #[error("Unsupported reference set format '{0}'. Expected a .csv or .tsv file.")]
    UnsupportedFormat(String),
}

/// Ordered, unique feature names the model consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    names: Vec<String>,
}

impl FeatureSchema {
    pub fn new(names: Vec<String>) -> Result<Self, SchemaError> {
        if names.is_empty() {
            return Err(SchemaError::EmptySchema);
        }
        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateFeature(name.clone()));
            }
        }
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, feature: &str) -> Option<usize> {
        self.names.iter().position(|n| n == feature)
    }

    pub fn contains(&self, feature: &str) -> bool {
        self.index_of(feature).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Per-feature medians, aligned with the schema.
///
/// `None` marks a feature whose reference column had no usable value.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceStatistics {
    medians: Vec<Option<f64>>,
}

impl ReferenceStatistics {
    /// Computes medians from raw reference columns. Each column holds the
    /// values of one schema feature, with `None` for missing cells.
    pub fn from_columns(
        schema: &FeatureSchema,
        columns: &[Vec<Option<f64>>],
    ) -> Result<Self, SchemaError> {
        if columns.len() != schema.len() {
            return Err(SchemaError::StatisticsLength {
                found: columns.len(),
                expected: schema.len(),
            });
        }
        let medians = columns
            .iter()
            .map(|column| median(column.iter().flatten().copied()))
            .collect();
        Ok(Self { medians })
    }

    pub fn from_medians(
        schema: &FeatureSchema,
        medians: Vec<Option<f64>>,
    ) -> Result<Self, SchemaError> {
        if medians.len() != schema.len() {
            return Err(SchemaError::StatisticsLength {
                found: medians.len(),
                expected: schema.len(),
            });
        }
        Ok(Self { medians })
    }

    pub fn median_at(&self, index: usize) -> Option<f64> {
        self.medians.get(index).copied().flatten()
    }

    pub fn median(&self, schema: &FeatureSchema, feature: &str) -> Option<f64> {
        schema.index_of(feature).and_then(|i| self.median_at(i))
    }

    pub fn len(&self) -> usize {
        self.medians.len()
    }

    pub fn is_empty(&self) -> bool {
        self.medians.is_empty()
    }

    /// Names of schema features without a usable median.
    pub fn unavailable<'a>(&self, schema: &'a FeatureSchema) -> Vec<&'a str> {
        schema
            .iter()
            .zip(&self.medians)
            .filter(|(_, m)| m.is_none())
            .map(|(name, _)| name)
            .collect()
    }
}

/// Median of the finite values, averaging the two middle values for even counts.
pub fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut finite: Vec<f64> = values.filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(f64::total_cmp);
    let mid = finite.len() / 2;
    if finite.len() % 2 == 0 {
        Some((finite[mid - 1] + finite[mid]) / 2.0)
    } else {
        Some(finite[mid])
    }
}

/// The schema and statistics derived from one reference training set.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    pub schema: FeatureSchema,
    pub statistics: ReferenceStatistics,
    /// Number of data rows the statistics were computed from.
    pub rows: usize,
}

/// Reads a CSV or TSV reference set and derives the schema and medians.
pub fn load_reference_set(path: &str, target_column: &str) -> Result<ReferenceSet, SchemaError> {
    let separator = separator_for(path)?;

    log::info!("Loading reference set from '{path}'");
    let df = CsvReader::new(File::open(Path::new(path))?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_infer_schema_length(None)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(SchemaError::NoRows(path.to_string()));
    }

    let column_names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    if !column_names.iter().any(|c| c == target_column) {
        return Err(SchemaError::TargetColumnNotFound(target_column.to_string()));
    }

    let feature_names: Vec<String> = column_names
        .into_iter()
        .filter(|c| c != target_column)
        .collect();
    let schema = FeatureSchema::new(feature_names)?;

    let mut columns = Vec::with_capacity(schema.len());
    for name in schema.iter() {
        columns.push(extract_numeric_column(&df, name)?);
    }
    let statistics = ReferenceStatistics::from_columns(&schema, &columns)?;

    let unavailable = statistics.unavailable(&schema);
    if !unavailable.is_empty() {
        log::warn!(
            "{} reference column(s) have no usable values: {unavailable:?}",
            unavailable.len()
        );
    }
    log::info!(
        "Reference set loaded: {} rows, {} features",
        df.height(),
        schema.len()
    );

    Ok(ReferenceSet {
        schema,
        statistics,
        rows: df.height(),
    })
}

fn separator_for(path: &str) -> Result<u8, SchemaError> {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => Ok(b','),
        "tsv" | "txt" => Ok(b'\t'),
        other => Err(SchemaError::UnsupportedFormat(other.to_string())),
    }
}

/// Casts one column to `Float64`, keeping nulls where the cast fails.
fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<Option<f64>>, SchemaError> {
    let series = df.column(column_name)?;
    let casted = series.cast(&DataType::Float64)?;
    let chunked = casted.f64()?;
    Ok(chunked
        .into_iter()
        .map(|v| v.filter(|x| x.is_finite()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn create_reference_file(content: &str, suffix: &str) -> io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        writeln!(file, "{content}")?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn median_ignores_non_finite_values() {
        let values = vec![3.0, f64::NAN, 1.0, f64::INFINITY, 2.0];
        assert_eq!(median(values.into_iter()), Some(2.0));
    }

    #[test]
    fn median_averages_even_counts() {
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0].into_iter()), Some(2.5));
        assert_eq!(median(Vec::<f64>::new().into_iter()), None);
    }

    #[test]
    fn schema_rejects_duplicates_and_empty() {
        assert!(matches!(
            FeatureSchema::new(vec![]),
            Err(SchemaError::EmptySchema)
        ));
        let err = FeatureSchema::new(vec!["a".into(), "b".into(), "a".into()]).unwrap_err();
        match err {
            SchemaError::DuplicateFeature(name) => assert_eq!(name, "a"),
            other => panic!("Expected DuplicateFeature, got {other:?}"),
        }
    }

    #[test]
    fn statistics_length_must_match_schema() {
        let schema = FeatureSchema::new(vec!["a".into(), "b".into()]).unwrap();
        let err = ReferenceStatistics::from_medians(&schema, vec![Some(1.0)]).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::StatisticsLength {
                found: 1,
                expected: 2
            }
        ));
    }

    #[test]
    fn load_reference_set_excludes_target_and_ignores_missing() {
        let content = "koi_period,koi_depth,koi_disposition_num,koi_prad\n\
                       10.0,100.0,0,1.0\n\
                       20.0,,1,2.0\n\
                       30.0,300.0,2,garbage\n\
                       40.0,500.0,2,4.0";
        let file = create_reference_file(content, ".csv").unwrap();
        let reference =
            load_reference_set(file.path().to_str().unwrap(), DEFAULT_TARGET_COLUMN).unwrap();

        assert_eq!(
            reference.schema.names(),
            &["koi_period", "koi_depth", "koi_prad"]
        );
        assert_eq!(reference.rows, 4);
        let stats = &reference.statistics;
        assert_abs_diff_eq!(stats.median_at(0).unwrap(), 25.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.median_at(1).unwrap(), 300.0, epsilon = 1e-12);
        assert_abs_diff_eq!(stats.median_at(2).unwrap(), 2.0, epsilon = 1e-12);
    }

    #[test]
    fn load_reference_set_reports_unusable_columns() {
        let content = "koi_period\tkoi_teq\tkoi_disposition_num\n\
                       1.5\t\t0\n\
                       2.5\t\t1";
        let file = create_reference_file(content, ".tsv").unwrap();
        let reference =
            load_reference_set(file.path().to_str().unwrap(), DEFAULT_TARGET_COLUMN).unwrap();
        assert_eq!(
            reference.statistics.unavailable(&reference.schema),
            vec!["koi_teq"]
        );
        assert_eq!(
            reference.statistics.median(&reference.schema, "koi_period"),
            Some(2.0)
        );
    }

    #[test]
    fn load_reference_set_requires_target_column() {
        let file = create_reference_file("a,b\n1,2", ".csv").unwrap();
        let err = load_reference_set(file.path().to_str().unwrap(), DEFAULT_TARGET_COLUMN)
            .unwrap_err();
        match err {
            SchemaError::TargetColumnNotFound(col) => assert_eq!(col, DEFAULT_TARGET_COLUMN),
            other => panic!("Expected TargetColumnNotFound, got {other:?}"),
        }
    }

    #[test]
    fn load_reference_set_rejects_unknown_extension() {
        let file = create_reference_file("a,b\n1,2", ".xlsx").unwrap();
        let err = load_reference_set(file.path().to_str().unwrap(), DEFAULT_TARGET_COLUMN)
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnsupportedFormat(ext) if ext == "xlsx"));
    }
}
