#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::path::Path;
use std::process;

use exovet::batch::{BatchOrchestrator, write_results};
use exovet::config::EngineConfig;
use exovet::model::{Ensemble, MODEL_FORMAT_VERSION};
use exovet::normalize::InputRecord;
use exovet::predictor::Predictor;
use exovet::report::SummaryReport;
use exovet::types::Disposition;

/// Engine inputs. Each flag overrides the matching config file value.
#[derive(Args)]
pub struct EngineArgs {
    /// TOML config file; missing fields take their defaults
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Model artifact (.toml or .json)
    #[arg(long, value_name = "PATH")]
    pub model: Option<String>,

    /// Reference training set (.csv or .tsv) the medians are computed from
    #[arg(long, value_name = "PATH")]
    pub reference: Option<String>,

    /// Target column to exclude from the reference set
    #[arg(long, value_name = "NAME")]
    pub target_column: Option<String>,

    /// Start even if some reference medians are undefined
    #[arg(long)]
    pub allow_missing_statistics: bool,
}

impl EngineArgs {
    fn resolve(&self) -> Result<EngineConfig, Box<dyn Error>> {
        let mut config = match &self.config {
            Some(path) => {
                log::info!("Loading configuration from: {path}");
                EngineConfig::load(path)?
            }
            None => EngineConfig::default(),
        };
        if let Some(model) = &self.model {
            config.model_path = model.clone();
        }
        if let Some(reference) = &self.reference {
            config.reference_path = reference.clone();
        }
        if let Some(target) = &self.target_column {
            config.target_column = target.clone();
        }
        if self.allow_missing_statistics {
            config.allow_missing_statistics = true;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args)]
pub struct PredictArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// JSON object of feature values, or a path to a file containing one
    #[arg(value_name = "RECORD")]
    pub record: String,

    /// Number of ranked features to include in the response
    #[arg(long, value_name = "N")]
    pub top_features: Option<usize>,
}

#[derive(Args)]
pub struct BatchArgs {
    #[command(flatten)]
    pub engine: EngineArgs,

    /// Input table (.csv or .tsv)
    #[arg(value_name = "INPUT")]
    pub input: String,

    /// Where to write the results table (.csv or .tsv)
    #[arg(long, value_name = "PATH")]
    pub output: Option<String>,

    /// Process rows in parallel
    #[arg(long)]
    pub parallel: bool,

    /// Process at most N rows
    #[arg(long, value_name = "N")]
    pub max_records: Option<usize>,

    /// Impute rows whose feature cells are all unreadable instead of failing them
    #[arg(long)]
    pub keep_unreadable_rows: bool,

    /// Also write the summary report to this file
    #[arg(long, value_name = "PATH")]
    pub report_file: Option<String>,
}

#[derive(Parser)]
#[command(
    name = "exovet",
    about = "Explainable disposition classifier for Kepler Objects of Interest",
    long_about = "Classifies KOI observations as false positive, candidate, or confirmed with a \
                 frozen tree-ensemble model, imputing missing features from a reference set and \
                 attributing every prediction to its features with TreeSHAP."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify and explain a single record
    Predict(PredictArgs),

    /// Classify every row of a table and print a summary report
    Batch(BatchArgs),

    /// Print the summary report for a results table written by `batch`
    Report {
        #[arg(value_name = "RESULTS")]
        results: String,

        /// Also write the summary report to this file
        #[arg(long, value_name = "PATH")]
        report_file: Option<String>,
    },

    /// Show the schema, reference medians, and model summary
    Inspect(EngineArgs),

    /// Show version information
    Version,
}

fn predict(args: PredictArgs) -> Result<(), Box<dyn Error>> {
    let mut config = args.engine.resolve()?;
    if let Some(n) = args.top_features {
        config.top_features = n;
    }
    let predictor = Predictor::from_config(&config)?;

    let text = if Path::new(&args.record).is_file() {
        std::fs::read_to_string(&args.record)?
    } else {
        args.record.clone()
    };
    let record = InputRecord::from_json(&text)?;

    let response = predictor.respond(&record)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn batch(args: BatchArgs) -> Result<(), Box<dyn Error>> {
    let mut config = args.engine.resolve()?;
    if args.parallel {
        config.batch.parallel = true;
    }
    if args.max_records.is_some() {
        config.batch.max_records = args.max_records;
    }
    if args.keep_unreadable_rows {
        config.batch.reject_unreadable_rows = false;
    }
    config.validate()?;

    let predictor = Predictor::from_config(&config)?;
    let orchestrator = BatchOrchestrator::new(&predictor, config.batch.clone());

    println!("Processing records from: {}", args.input);
    let (table, result) = orchestrator.run_file(&args.input)?;
    println!(
        "Total: {} | Succeeded: {} | Failed: {}",
        result.processed(),
        result.succeeded(),
        result.failed()
    );
    if result.skipped > 0 {
        println!("Skipped {} rows beyond the record cap", result.skipped);
    }

    if let Some(output) = &args.output {
        write_results(output, &table, &result)?;
        println!("Results saved to: {output}");
    }

    println!();
    let summary = SummaryReport::from_batch(&result);
    print!("{summary}");
    if let Some(path) = &args.report_file {
        summary.save(path)?;
        println!("Report saved to: {path}");
    }
    Ok(())
}

fn report(results: &str, report_file: Option<&str>) -> Result<(), Box<dyn Error>> {
    println!("Loading results from: {results}");
    let summary = SummaryReport::from_results_file(results)?;
    print!("{summary}");
    if let Some(path) = report_file {
        summary.save(path)?;
        println!("Report saved to: {path}");
    }
    Ok(())
}

fn inspect(args: EngineArgs) -> Result<(), Box<dyn Error>> {
    let config = args.resolve()?;
    let predictor = Predictor::from_config(&config)?;
    let model = predictor.model();
    let schema = predictor.schema();
    let statistics = predictor.statistics();

    println!("Model: {} ({} tree(s), split rule {:?})", model.family(), model.n_trees(), model.split_rule);
    if let Ensemble::GradientBoosted { base_score, .. } = &model.ensemble {
        println!("Base scores: {base_score:?}");
    }
    println!("Expected raw output per class:");
    for (class, value) in Disposition::ALL.iter().zip(predictor.expected_values()) {
        println!("  {:<15} {value:.6}", class.label());
    }

    println!();
    println!("{:<4} {:<20} {:>16} {:>8}", "#", "feature", "median", "splits");
    for ((i, name), splits) in schema.iter().enumerate().zip(model.split_counts()) {
        let median = statistics
            .median_at(i)
            .map_or_else(|| "unavailable".to_string(), |m| format!("{m:.6}"));
        println!("{i:<4} {name:<20} {median:>16} {splits:>8}");
    }
    Ok(())
}

fn print_version_info() {
    println!("exovet {}", env!("CARGO_PKG_VERSION"));
    println!("Model format version: {MODEL_FORMAT_VERSION}");
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Batch(args)) => batch(args),
        Some(Commands::Report {
            results,
            report_file,
        }) => report(&results, report_file.as_deref()),
        Some(Commands::Inspect(args)) => inspect(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
