//! # Summary Report
//!
//! Read-only aggregation over batch output, either straight from a
//! `BatchResult` or from a results table written earlier.

use crate::batch::{
    BatchError, BatchResult, BatchRow, ERROR_COLUMN, ERROR_LABEL, RESULT_COLUMNS, TableFormat,
};
use csv::StringRecord;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use thiserror::Error;

/// How many entries the overall top-feature ranking shows.
pub const TOP_FEATURE_RANKING: usize = 5;

const RULE_WIDTH: usize = 70;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("Failed to read results table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Results table is missing the required column '{0}'.")]
    MissingColumn(String),
}

/// Per-label statistics for successfully classified rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSummary {
    pub label: String,
    pub count: usize,
    pub mean_confidence: f64,
    /// Most frequent first-ranked feature within the class.
    pub top_feature: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Label counts, failures included, most frequent first.
    pub distribution: Vec<(String, usize)>,
    /// Mean confidence over successful rows; `None` when none succeeded.
    pub mean_confidence: Option<f64>,
    /// Most frequent first-ranked features with their counts.
    pub top_features: Vec<(String, usize)>,
    pub classes: Vec<ClassSummary>,
}

impl SummaryReport {
    pub fn from_batch(result: &BatchResult) -> Self {
        Self::from_rows(&result.rows())
    }

    pub fn from_rows(rows: &[BatchRow]) -> Self {
        let total = rows.len();
        let successes: Vec<&BatchRow> = rows.iter().filter(|r| r.is_success()).collect();
        let succeeded = successes.len();

        let distribution = ranked_counts(rows.iter().map(|r| {
            if r.is_success() {
                r.prediction_label.as_str()
            } else {
                ERROR_LABEL
            }
        }));

        let mean_confidence = mean(successes.iter().map(|r| r.confidence));

        let mut top_features = ranked_counts(
            successes
                .iter()
                .filter_map(|r| r.top_feature_1.as_deref()),
        );
        top_features.truncate(TOP_FEATURE_RANKING);

        let classes = distribution
            .iter()
            .filter(|(label, _)| label != ERROR_LABEL)
            .map(|(label, count)| {
                let members: Vec<&&BatchRow> = successes
                    .iter()
                    .filter(|r| &r.prediction_label == label)
                    .collect();
                ClassSummary {
                    label: label.clone(),
                    count: *count,
                    mean_confidence: mean(members.iter().map(|r| r.confidence)).unwrap_or(0.0),
                    top_feature: ranked_counts(
                        members.iter().filter_map(|r| r.top_feature_1.as_deref()),
                    )
                    .into_iter()
                    .next()
                    .map(|(name, _)| name),
                }
            })
            .collect();

        Self {
            total,
            succeeded,
            failed: total - succeeded,
            distribution,
            mean_confidence,
            top_features,
            classes,
        }
    }

    /// Reads a results table written by `batch::write_results`. The result
    /// columns are the trailing ones; original columns in front of them may
    /// reuse the same names.
    pub fn from_results_file(path: &str) -> Result<Self, ReportError> {
        let format = TableFormat::from_path(path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .from_reader(File::open(path)?);

        let headers = rdr.headers()?.clone();
        let expected: Vec<&str> = RESULT_COLUMNS.iter().copied().chain([ERROR_COLUMN]).collect();
        let offset = headers.len().saturating_sub(expected.len());
        let tail: StringRecord = headers.iter().skip(offset).collect();
        if let Some(missing) = expected
            .iter()
            .enumerate()
            .find(|(i, name)| tail.get(*i) != Some(**name))
            .map(|(_, name)| name)
        {
            return Err(ReportError::MissingColumn(missing.to_string()));
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let cells: StringRecord = record.iter().skip(offset).collect();
            rows.push(cells.deserialize::<BatchRow>(Some(&tail))?);
        }
        log::info!("Read {} result rows from '{path}'", rows.len());
        Ok(Self::from_rows(&rows))
    }

    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Writes the rendered report to `path`.
    pub fn save(&self, path: &str) -> Result<(), ReportError> {
        std::fs::write(path, self.render())?;
        log::info!("Report saved to '{path}'");
        Ok(())
    }
}

impl fmt::Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(RULE_WIDTH);
        writeln!(f, "{rule}")?;
        writeln!(f, "BATCH CLASSIFICATION REPORT")?;
        writeln!(f, "{rule}")?;
        writeln!(f)?;

        writeln!(f, "SUMMARY")?;
        writeln!(f, "Total records analysed: {}", self.total)?;
        writeln!(f, "Succeeded: {} | Failed: {}", self.succeeded, self.failed)?;
        writeln!(f)?;

        writeln!(f, "CLASS DISTRIBUTION")?;
        for (label, count) in &self.distribution {
            writeln!(f, "  - {label}: {count} ({:.1}%)", percentage(*count, self.total))?;
        }
        writeln!(f)?;

        writeln!(f, "MEAN CONFIDENCE")?;
        match self.mean_confidence {
            Some(c) => writeln!(f, "  Overall: {:.1}%", c * 100.0)?,
            None => writeln!(f, "  Overall: n/a")?,
        }
        writeln!(f)?;

        writeln!(f, "TOP {TOP_FEATURE_RANKING} MOST INFLUENTIAL FEATURES")?;
        for (i, (feature, count)) in self.top_features.iter().enumerate() {
            writeln!(f, "  {}. {feature} (ranked first {count}x)", i + 1)?;
        }
        writeln!(f)?;

        writeln!(f, "PER-CLASS STATISTICS")?;
        for class in &self.classes {
            writeln!(f)?;
            writeln!(f, "  {}:", class.label)?;
            writeln!(f, "    - Mean confidence: {:.1}%", class.mean_confidence * 100.0)?;
            writeln!(
                f,
                "    - Most frequent top feature: {}",
                class.top_feature.as_deref().unwrap_or("n/a")
            )?;
        }
        Ok(())
    }
}

/// Occurrence counts, most frequent first, ties by name.
fn ranked_counts<'a>(items: impl Iterator<Item = &'a str>) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64 * 100.0
    }
}
