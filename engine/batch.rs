//! # Batch Orchestrator
//!
//! Runs every row of an input table through the predictor on its own. A row
//! that fails at any stage becomes a `RecordProcessingError` in the outcome
//! list and the batch moves on; only setup problems (unsupported format,
//! unreadable file, missing header) fail the batch call itself.
//!
//! Tables are read with the `csv` crate rather than polars so every cell keeps
//! its original text. Coercion is the normalizer's job, and the output table
//! echoes the input cells exactly.

use crate::explain::ExplanationRecord;
use crate::impute::ImputeError;
use crate::inference::InferenceError;
use crate::normalize::{InputRecord, RawValue, Slot, coerce};
use crate::predictor::Predictor;
use crate::schema::FeatureSchema;
use crate::types::Disposition;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Label written for rows that failed.
pub const ERROR_LABEL: &str = "ERROR";

/// Result columns appended after the original columns of the input table.
pub const RESULT_COLUMNS: [&str; 14] = [
    "id",
    "prediction",
    "prediction_label",
    "confidence",
    "prob_false_positive",
    "prob_candidate",
    "prob_confirmed",
    "top_feature_1",
    "top_feature_1_importance",
    "top_feature_2",
    "top_feature_2_importance",
    "top_feature_3",
    "top_feature_3_importance",
    "missing_features_count",
];

/// Trailing column carrying the failure reason.
pub const ERROR_COLUMN: &str = "error";

/// Errors that abort a whole batch before or after row processing.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Unsupported input format '{0}'. Expected a .csv or .tsv file.")]
    UnsupportedInputFormat(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to read or write table: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The input table has no header row.")]
    MissingHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Tsv,
}

impl TableFormat {
    /// Picks the format from the file extension.
    pub fn from_path(path: &str) -> Result<Self, BatchError> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(TableFormat::Csv),
            "tsv" | "txt" => Ok(TableFormat::Tsv),
            other => Err(BatchError::UnsupportedInputFormat(other.to_string())),
        }
    }

    pub fn delimiter(self) -> u8 {
        match self {
            TableFormat::Csv => b',',
            TableFormat::Tsv => b'\t',
        }
    }
}

/// A header row plus data rows, every cell kept as text.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl InputTable {
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { headers, rows }
    }

    pub fn read(path: &str) -> Result<Self, BatchError> {
        let format = TableFormat::from_path(path)?;
        log::info!("Reading input table from '{path}'");
        Self::from_reader(File::open(path)?, format)
    }

    pub fn from_reader<R: Read>(reader: R, format: TableFormat) -> Result<Self, BatchError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(format.delimiter())
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = rdr.headers()?.iter().map(|h| h.trim().to_string()).collect();
        if headers.iter().all(|h| h.is_empty()) {
            return Err(BatchError::MissingHeader);
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            rows.push(record?.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The row at `position` as an input record keyed by header.
    pub fn record(&self, position: usize) -> Result<InputRecord, RecordError> {
        let row = self.rows.get(position).ok_or(RecordError::NoSuchRow(position))?;
        if row.len() != self.headers.len() {
            return Err(RecordError::RaggedRow {
                found: row.len(),
                expected: self.headers.len(),
            });
        }
        Ok(self
            .headers
            .iter()
            .zip(row)
            .map(|(header, cell)| (header.clone(), RawValue::Text(cell.clone())))
            .collect())
    }

    /// Number of schema cells that will not coerce to a number and so will be
    /// imputed, counted over the first `limit` rows.
    pub fn non_numeric_cells(&self, schema: &FeatureSchema, limit: usize) -> usize {
        let columns: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, h)| schema.contains(h))
            .map(|(i, _)| i)
            .collect();
        self.rows
            .iter()
            .take(limit)
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|&c| row.get(c))
                    .filter(|cell| matches!(coerce(&RawValue::Text((*cell).clone())), Slot::Missing(_)))
                    .count()
            })
            .sum()
    }
}

/// How far a record got through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pending,
    Normalized,
    Imputed,
    Predicted,
    Assembled,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Normalized => "normalized",
            Stage::Imputed => "imputed",
            Stage::Predicted => "predicted",
            Stage::Assembled => "assembled",
        };
        f.write_str(name)
    }
}

/// Why a single row failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecordError {
    #[error("row has {found} fields but the header has {expected}")]
    RaggedRow { found: usize, expected: usize },
    #[error("none of the {cells} supplied feature value(s) could be read as a number")]
    Unreadable { cells: usize },
    #[error("row {0} does not exist")]
    NoSuchRow(usize),
    #[error(transparent)]
    Impute(#[from] ImputeError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// A row failure, tagged with its position and the last stage it reached.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Row {position} failed after stage '{stage}': {reason}")]
pub struct RecordProcessingError {
    pub position: usize,
    pub stage: Stage,
    #[source]
    pub reason: RecordError,
}

impl RecordProcessingError {
    pub fn new(position: usize, stage: Stage, reason: impl Into<RecordError>) -> Self {
        Self {
            position,
            stage,
            reason: reason.into(),
        }
    }
}

pub type RecordOutcome = Result<ExplanationRecord, RecordProcessingError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    /// Process rows on the rayon pool. Outcomes keep the input order.
    pub parallel: bool,
    /// Process at most this many rows; the rest are counted as skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_records: Option<usize>,
    /// Fail rows whose supplied feature cells are all unreadable.
    pub reject_unreadable_rows: bool,
    /// Log progress every this many rows; 0 disables it.
    pub progress_interval: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: false,
            max_records: None,
            reject_unreadable_rows: true,
            progress_interval: 100,
        }
    }
}

/// Outcomes in input-row order, plus the number of rows left unprocessed.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub outcomes: Vec<RecordOutcome>,
    pub skipped: usize,
}

impl BatchResult {
    pub fn processed(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.processed() - self.succeeded()
    }

    pub fn successes(&self) -> impl Iterator<Item = &ExplanationRecord> {
        self.outcomes.iter().filter_map(|o| o.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordProcessingError> {
        self.outcomes.iter().filter_map(|o| o.as_ref().err())
    }

    /// One output row per outcome, `id` being the row position.
    pub fn rows(&self) -> Vec<BatchRow> {
        self.outcomes
            .iter()
            .enumerate()
            .map(|(position, outcome)| BatchRow::from_outcome(position, outcome))
            .collect()
    }
}

pub struct BatchOrchestrator<'a> {
    predictor: &'a Predictor,
    options: BatchOptions,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(predictor: &'a Predictor, options: BatchOptions) -> Self {
        Self { predictor, options }
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    fn limit(&self, table: &InputTable) -> usize {
        self.options
            .max_records
            .map_or(table.len(), |cap| cap.min(table.len()))
    }

    /// Runs one row through normalize, impute, infer, and assemble.
    pub fn process_row(&self, table: &InputTable, position: usize) -> RecordOutcome {
        let record = table
            .record(position)
            .map_err(|e| RecordProcessingError::new(position, Stage::Pending, e))?;

        let normalized = self.predictor.normalize(&record);
        let readable = normalized.len() - normalized.missing_count();
        let unreadable = normalized.coercion_failures();
        if self.options.reject_unreadable_rows && readable == 0 && unreadable > 0 {
            return Err(RecordProcessingError::new(
                position,
                Stage::Normalized,
                RecordError::Unreadable { cells: unreadable },
            ));
        }

        let imputed = self
            .predictor
            .impute(&normalized)
            .map_err(|e| RecordProcessingError::new(position, Stage::Normalized, e))?;
        let prediction = self
            .predictor
            .classify(&imputed)
            .map_err(|e| RecordProcessingError::new(position, Stage::Imputed, e))?;
        let attribution = self
            .predictor
            .attribute(&imputed, prediction.class)
            .map_err(|e| RecordProcessingError::new(position, Stage::Predicted, e))?;

        let record = self.predictor.assemble(&imputed, prediction, attribution);
        log::trace!("Row {position} reached stage '{}'", Stage::Assembled);
        Ok(record)
    }

    /// Lazily processes rows from `start` up to the record cap. Calling it
    /// again with a later `start` resumes where a previous pass stopped.
    pub fn outcomes_from<'s>(
        &'s self,
        table: &'s InputTable,
        start: usize,
    ) -> impl Iterator<Item = (usize, RecordOutcome)> + 's {
        (start..self.limit(table)).map(move |position| (position, self.process_row(table, position)))
    }

    pub fn run(&self, table: &InputTable) -> BatchResult {
        let limit = self.limit(table);
        let skipped = table.len() - limit;
        if skipped > 0 {
            log::warn!("Record cap reached: processing {limit} of {} rows", table.len());
        }

        let non_numeric = table.non_numeric_cells(self.predictor.schema(), limit);
        if non_numeric > 0 {
            log::info!("{non_numeric} non-numeric or empty feature cells found; they will be imputed");
        }
        log::info!("Processing {limit} records");

        let interval = self.options.progress_interval;
        let done = AtomicUsize::new(0);
        let process = |position: usize| {
            let outcome = self.process_row(table, position);
            if let Err(e) = &outcome {
                log::warn!("{e}");
            }
            let count = done.fetch_add(1, Ordering::Relaxed) + 1;
            if interval > 0 && count % interval == 0 {
                log::info!("Processed {count}/{limit} records");
            }
            outcome
        };

        let outcomes: Vec<RecordOutcome> = if self.options.parallel {
            (0..limit).into_par_iter().map(process).collect()
        } else {
            (0..limit).map(process).collect()
        };

        let result = BatchResult { outcomes, skipped };
        log::info!(
            "Batch complete. Total: {} | Succeeded: {} | Failed: {} | Skipped: {}",
            result.processed(),
            result.succeeded(),
            result.failed(),
            result.skipped
        );
        result
    }

    /// Reads `input_path` and runs every row.
    pub fn run_file(&self, input_path: &str) -> Result<(InputTable, BatchResult), BatchError> {
        let table = InputTable::read(input_path)?;
        let result = self.run(&table);
        Ok((table, result))
    }
}

/// The result columns for one row of the output table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRow {
    pub id: usize,
    pub prediction: Option<usize>,
    pub prediction_label: String,
    pub confidence: f64,
    pub prob_false_positive: Option<f64>,
    pub prob_candidate: Option<f64>,
    pub prob_confirmed: Option<f64>,
    pub top_feature_1: Option<String>,
    pub top_feature_1_importance: Option<f64>,
    pub top_feature_2: Option<String>,
    pub top_feature_2_importance: Option<f64>,
    pub top_feature_3: Option<String>,
    pub top_feature_3_importance: Option<f64>,
    pub missing_features_count: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BatchRow {
    pub fn from_outcome(position: usize, outcome: &RecordOutcome) -> Self {
        match outcome {
            Ok(record) => {
                let top = |i: usize| record.attributions.get(i);
                let prob = |d: Disposition| Some(record.prediction.probability(d));
                BatchRow {
                    id: position,
                    prediction: Some(record.class().index()),
                    prediction_label: record.label().to_string(),
                    confidence: record.confidence(),
                    prob_false_positive: prob(Disposition::FalsePositive),
                    prob_candidate: prob(Disposition::Candidate),
                    prob_confirmed: prob(Disposition::Confirmed),
                    top_feature_1: top(0).map(|e| e.feature.clone()),
                    top_feature_1_importance: top(0).map(|e| e.contribution),
                    top_feature_2: top(1).map(|e| e.feature.clone()),
                    top_feature_2_importance: top(1).map(|e| e.contribution),
                    top_feature_3: top(2).map(|e| e.feature.clone()),
                    top_feature_3_importance: top(2).map(|e| e.contribution),
                    missing_features_count: Some(record.missing_features.len()),
                    error: None,
                }
            }
            Err(failure) => BatchRow {
                id: position,
                prediction: None,
                prediction_label: ERROR_LABEL.to_string(),
                confidence: 0.0,
                prob_false_positive: None,
                prob_candidate: None,
                prob_confirmed: None,
                top_feature_1: None,
                top_feature_1_importance: None,
                top_feature_2: None,
                top_feature_2_importance: None,
                top_feature_3: None,
                top_feature_3_importance: None,
                missing_features_count: None,
                error: Some(failure.to_string()),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.prediction.is_some() && self.error.as_deref().is_none_or(str::is_empty)
    }

    /// Cells in `RESULT_COLUMNS` order followed by the error cell.
    fn to_cells(&self) -> Vec<String> {
        fn opt<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(ToString::to_string).unwrap_or_default()
        }
        vec![
            self.id.to_string(),
            opt(&self.prediction),
            self.prediction_label.clone(),
            self.confidence.to_string(),
            opt(&self.prob_false_positive),
            opt(&self.prob_candidate),
            opt(&self.prob_confirmed),
            opt(&self.top_feature_1),
            opt(&self.top_feature_1_importance),
            opt(&self.top_feature_2),
            opt(&self.top_feature_2_importance),
            opt(&self.top_feature_3),
            opt(&self.top_feature_3_importance),
            opt(&self.missing_features_count),
            opt(&self.error),
        ]
    }
}

/// Writes the original columns of `table` followed by the result columns.
/// Rows past the record cap are not written.
pub fn write_results(path: &str, table: &InputTable, result: &BatchResult) -> Result<(), BatchError> {
    let format = TableFormat::from_path(path)?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(format.delimiter())
        .from_path(path)?;

    let width = table.headers().len();
    let mut header: Vec<&str> = table.headers().iter().map(String::as_str).collect();
    header.extend(RESULT_COLUMNS);
    header.push(ERROR_COLUMN);
    writer.write_record(&header)?;

    for (row, result_row) in table.rows().iter().zip(result.rows()) {
        let mut cells: Vec<String> = row.iter().take(width).cloned().collect();
        cells.resize(width, String::new());
        cells.extend(result_row.to_cells());
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    log::info!("Results saved to '{path}'");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::PredictorOptions;
    use crate::test_fixtures::{boosted_model, koi_feature_names, reference_set};

    fn predictor() -> Predictor {
        Predictor::new(boosted_model(), reference_set().unwrap(), PredictorOptions::default())
            .unwrap()
    }

    fn table(text: &str) -> InputTable {
        InputTable::from_reader(text.as_bytes(), TableFormat::Csv).unwrap()
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(TableFormat::from_path("a.CSV").unwrap(), TableFormat::Csv);
        assert_eq!(TableFormat::from_path("a.tsv").unwrap(), TableFormat::Tsv);
        match TableFormat::from_path("a.xlsx") {
            Err(BatchError::UnsupportedInputFormat(ext)) => assert_eq!(ext, "xlsx"),
            other => panic!("Expected UnsupportedInputFormat, got {other:?}"),
        }
    }

    #[test]
    fn ragged_and_unreadable_rows_fail_alone() {
        let predictor = predictor();
        let input = table(
            "kepoi_name,koi_period,koi_depth\n\
             K1,10.5,300\n\
             K2,abc,xyz\n\
             K3,,\n\
             K4,7.0\n\
             K5,22.0,n/a\n",
        );
        let result = BatchOrchestrator::new(&predictor, BatchOptions::default()).run(&input);

        assert_eq!(result.processed(), 5);
        assert_eq!(result.succeeded(), 3);
        assert_eq!(result.failed(), 2);

        let failures: Vec<&RecordProcessingError> = result.failures().collect();
        assert_eq!(failures[0].position, 1);
        assert_eq!(failures[0].stage, Stage::Normalized);
        assert_eq!(failures[0].reason, RecordError::Unreadable { cells: 2 });
        assert_eq!(failures[1].position, 3);
        assert_eq!(failures[1].stage, Stage::Pending);
        assert_eq!(
            failures[1].reason,
            RecordError::RaggedRow {
                found: 2,
                expected: 3
            }
        );

        // Fully empty row is imputed, not rejected.
        let empty = result.outcomes[2].as_ref().unwrap();
        assert_eq!(empty.missing_features.len(), koi_feature_names().len());
    }

    #[test]
    fn unreadable_rows_can_be_allowed_through() {
        let predictor = predictor();
        let input = table("koi_period,koi_depth\nabc,xyz\n");
        let options = BatchOptions {
            reject_unreadable_rows: false,
            ..BatchOptions::default()
        };
        let result = BatchOrchestrator::new(&predictor, options).run(&input);
        assert_eq!(result.succeeded(), 1);
    }

    #[test]
    fn record_cap_counts_skipped_rows() {
        let predictor = predictor();
        let input = table("koi_period\n1\n2\n3\n4\n");
        let options = BatchOptions {
            max_records: Some(3),
            ..BatchOptions::default()
        };
        let result = BatchOrchestrator::new(&predictor, options).run(&input);
        assert_eq!(result.processed(), 3);
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn lazy_outcomes_resume_from_an_offset() {
        let predictor = predictor();
        let input = table("koi_period\n1\nbad\n3\n4\n");
        let orchestrator = BatchOrchestrator::new(&predictor, BatchOptions::default());

        let first: Vec<(usize, RecordOutcome)> = orchestrator.outcomes_from(&input, 0).take(2).collect();
        assert_eq!(first[0].0, 0);
        assert!(first[1].1.is_err());

        let rest: Vec<usize> = orchestrator.outcomes_from(&input, 2).map(|(p, _)| p).collect();
        assert_eq!(rest, vec![2, 3]);

        let eager = orchestrator.run(&input);
        let (_, resumed) = orchestrator.outcomes_from(&input, 3).next().unwrap();
        assert_eq!(&resumed, &eager.outcomes[3]);
    }

    #[test]
    fn parallel_run_matches_sequential_order() {
        let predictor = predictor();
        let mut text = String::from("koi_period,koi_depth,koi_prad\n");
        for i in 0..60 {
            if i % 17 == 5 {
                text.push_str("oops,oops,oops\n");
            } else {
                text.push_str(&format!("{},{},{}\n", i as f64 * 3.1, i * 97 % 4000, i % 20));
            }
        }
        let input = table(&text);
        let sequential = BatchOrchestrator::new(&predictor, BatchOptions::default()).run(&input);
        let parallel = BatchOrchestrator::new(
            &predictor,
            BatchOptions {
                parallel: true,
                ..BatchOptions::default()
            },
        )
        .run(&input);
        assert_eq!(sequential.outcomes, parallel.outcomes);
        assert_eq!(parallel.failed(), 4);
    }

    #[test]
    fn non_numeric_cells_are_counted_for_schema_columns_only() {
        let schema = predictor().schema().clone();
        let input = table("name,koi_period,koi_depth\nfoo,1.0,\nbar,x,2\n");
        assert_eq!(input.non_numeric_cells(&schema, 10), 2);
        assert_eq!(input.non_numeric_cells(&schema, 1), 1);
    }

    #[test]
    fn results_table_keeps_original_columns() {
        let predictor = predictor();
        let input = table("kepoi_name,koi_period\nK1,10\nK2,junk\n");
        let result = BatchOrchestrator::new(&predictor, BatchOptions::default()).run(&input);

        let file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        let path = file.path().to_str().unwrap();
        write_results(path, &input, &result).unwrap();

        let written = InputTable::read(path).unwrap();
        assert_eq!(&written.headers()[..2], &["kepoi_name", "koi_period"]);
        assert_eq!(written.headers().len(), 2 + RESULT_COLUMNS.len() + 1);
        assert_eq!(written.rows()[0][0], "K1");
        assert_eq!(written.rows()[0][2], "0");
        assert_eq!(written.rows()[1][1], "junk");
        assert_eq!(written.rows()[1][4], ERROR_LABEL);
        assert_eq!(written.rows()[1][5], "0");
        assert!(written.rows()[1].last().unwrap().contains("Row 1"));
    }

    #[test]
    fn results_with_colliding_input_columns_read_back() {
        let predictor = predictor();
        let input = table("id,koi_period,confidence\n17,10,high\n18,junk,low\n19,300,\n");
        let result = BatchOrchestrator::new(&predictor, BatchOptions::default()).run(&input);

        let file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        let path = file.path().to_str().unwrap();
        write_results(path, &input, &result).unwrap();

        let written = InputTable::read(path).unwrap();
        assert_eq!(written.headers()[0], "id");
        assert_eq!(written.headers()[3], "id");
        assert_eq!(written.rows()[2][0], "19");
        assert_eq!(written.rows()[2][3], "2");

        let reread = crate::report::SummaryReport::from_results_file(path).unwrap();
        assert_eq!(reread, crate::report::SummaryReport::from_batch(&result));
        assert_eq!(reread.total, 3);
    }

    #[test]
    fn unsupported_output_format_is_rejected() {
        let predictor = predictor();
        let input = table("koi_period\n1\n");
        let result = BatchOrchestrator::new(&predictor, BatchOptions::default()).run(&input);
        assert!(matches!(
            write_results("out.xlsx", &input, &result),
            Err(BatchError::UnsupportedInputFormat(_))
        ));
    }
}
