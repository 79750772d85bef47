//! Glyco CLI - Command-line interface for Glyco Flux
//!
//! Commands:
//! - analyze: Process one device export into feature and review tables
//! - batch: Process a directory or manifest of exports in parallel
//! - validate: Check an export has the columns each stage needs
//! - config: Print the effective pipeline configuration

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use glyco_flux::batch::{BatchInput, BatchRunner};
use glyco_flux::cache::StageCache;
use glyco_flux::config::{NeighborAggregation, PipelineConfig};
use glyco_flux::encoder::TableEncoder;
use glyco_flux::pipeline::Pipeline;
use glyco_flux::schema::RawEventAdapter;
use glyco_flux::types::ModelKind;
use glyco_flux::{ComputeError, GLYCO_FLUX_VERSION};

/// Glyco - Dose-event feature engineering and anomaly scoring
#[derive(Parser)]
#[command(name = "glyco")]
#[command(version = GLYCO_FLUX_VERSION)]
#[command(about = "Flag unusual insulin doses in diabetes device exports", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one export into feature and review tables
    Analyze {
        /// Input CSV export (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory; tables land in <out>/<identifier>/
        #[arg(short, long)]
        out: PathBuf,

        /// Identifier for the run (defaults to the input file stem)
        #[arg(long)]
        identifier: Option<String>,

        #[command(flatten)]
        settings: Settings,
    },

    /// Process many exports in parallel
    Batch {
        /// Directory of *.csv exports, or a manifest with one path per line
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Worker threads (defaults to available parallelism)
        #[arg(long)]
        workers: Option<usize>,

        #[command(flatten)]
        settings: Settings,
    },

    /// Check an export has the columns each stage needs
    Validate {
        /// Input CSV export (use - for stdin)
        #[arg(short, long)]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as JSON
    Config {
        #[command(flatten)]
        settings: Settings,
    },
}

/// Configuration file plus per-key overrides
#[derive(Args)]
struct Settings {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Outlier model
    #[arg(long)]
    model: Option<ModelArg>,

    /// SAX alphabet size (2-25)
    #[arg(long)]
    alphabet: Option<usize>,

    /// Minutes considered before and after each dose
    #[arg(long)]
    window: Option<i64>,

    /// Keep only the trailing N days of the export
    #[arg(long)]
    days: Option<u32>,

    /// Expected outlier fraction
    #[arg(long)]
    contamination: Option<f64>,

    /// Neighbors for the neighbor-distance model
    #[arg(long)]
    neighbors: Option<usize>,

    /// Neighbor distance aggregation
    #[arg(long)]
    aggregation: Option<AggregationArg>,

    /// Isolation forest seed
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for cached stage outputs
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    /// k-nearest-neighbor distance
    Knn,
    /// Isolation forest
    Isolation,
}

impl From<ModelArg> for ModelKind {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Knn => ModelKind::NeighborDistance,
            ModelArg::Isolation => ModelKind::IsolationBased,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum AggregationArg {
    Largest,
    Mean,
    Median,
}

impl From<AggregationArg> for NeighborAggregation {
    fn from(arg: AggregationArg) -> Self {
        match arg {
            AggregationArg::Largest => NeighborAggregation::Largest,
            AggregationArg::Mean => NeighborAggregation::Mean,
            AggregationArg::Median => NeighborAggregation::Median,
        }
    }
}

impl Settings {
    fn resolve(&self) -> Result<PipelineConfig, GlycoCliError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_path(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(model) = self.model {
            config.model_kind = model.into();
        }
        if let Some(alphabet) = self.alphabet {
            config.alphabet_size = alphabet;
        }
        if let Some(window) = self.window {
            config.consideration_window_minutes = window;
        }
        if let Some(days) = self.days {
            config.days_to_process = Some(days);
        }
        if let Some(contamination) = self.contamination {
            config.contamination = contamination;
        }
        if let Some(neighbors) = self.neighbors {
            config.n_neighbors = neighbors;
        }
        if let Some(aggregation) = self.aggregation {
            config.neighbor_aggregation = aggregation.into();
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

/// Install the stderr subscriber; `RUST_LOG` wins over `--verbose`
fn init_logging(verbose: u8, json: bool) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("glyco_flux={level},glyco={level}")));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        let layer = fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_ansi(atty::is(atty::Stream::Stderr));
        tracing_subscriber::registry().with(filter).with(layer).init();
    }
}

fn run(cli: Cli) -> Result<(), GlycoCliError> {
    match cli.command {
        Commands::Analyze {
            input,
            out,
            identifier,
            settings,
        } => cmd_analyze(&input, &out, identifier, &settings),

        Commands::Batch {
            input,
            out,
            workers,
            settings,
        } => cmd_batch(&input, &out, workers, &settings),

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Config { settings } => {
            println!("{}", settings.resolve()?.to_json()?);
            Ok(())
        }
    }
}

fn read_input(input: &Path) -> Result<Vec<u8>, GlycoCliError> {
    if input.to_string_lossy() == "-" {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        Ok(buffer)
    } else {
        Ok(fs::read(input)?)
    }
}

fn cmd_analyze(
    input: &Path,
    out: &Path,
    identifier: Option<String>,
    settings: &Settings,
) -> Result<(), GlycoCliError> {
    let config = settings.resolve()?;
    let mut pipeline = Pipeline::new(config)?;
    if let Some(dir) = &settings.cache_dir {
        pipeline = pipeline.with_cache(StageCache::open(dir)?);
    }

    let identifier = identifier.unwrap_or_else(|| {
        input
            .file_stem()
            .filter(|_| input.to_string_lossy() != "-")
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "stdin".to_string())
    });
    let bytes = read_input(input)?;
    let output = pipeline.run_bytes(&identifier, &bytes)?;

    let written = TableEncoder::new(out).write(&output)?;
    info!(files = written.len(), "Analysis complete");

    println!("{}", serde_json::to_string_pretty(&output.summary)?);
    Ok(())
}

fn cmd_batch(
    input: &Path,
    out: &Path,
    workers: Option<usize>,
    settings: &Settings,
) -> Result<(), GlycoCliError> {
    let mut runner = BatchRunner::new(settings.resolve()?, out)?;
    if let Some(workers) = workers {
        runner = runner.with_workers(workers);
    }
    if let Some(dir) = &settings.cache_dir {
        runner = runner.with_cache_dir(dir);
    }

    let report = runner.run(&BatchInput::from_path(input))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.failed > 0 {
        Err(GlycoCliError::BatchFailed(report.failed, report.total))
    } else {
        Ok(())
    }
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), GlycoCliError> {
    let bytes = read_input(input)?;
    let export = RawEventAdapter::read_csv(bytes.as_slice())?;
    let report = RawEventAdapter::validate(&export);

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Events:         {}", report.events);
        println!("Glucose events: {}", report.glucose_events);
        println!("Dose events:    {}", report.dose_events);
        println!("Dropped rows:   {}", report.dropped_rows);
        println!("Ignored rows:   {}", report.ignored_rows);

        let sections = [
            ("glucose", &report.missing_glucose_columns),
            ("dose", &report.missing_dose_columns),
            ("optional", &report.missing_optional_columns),
        ];
        for (stage, missing) in sections {
            if !missing.is_empty() {
                println!("\nMissing {} columns: {}", stage, missing.join(", "));
            }
        }
    }

    if report.is_usable() {
        Ok(())
    } else {
        Err(GlycoCliError::ValidationFailed)
    }
}

// Error types

#[derive(Debug)]
enum GlycoCliError {
    Io(io::Error),
    Compute(ComputeError),
    Json(serde_json::Error),
    ValidationFailed,
    BatchFailed(usize, usize),
}

impl From<io::Error> for GlycoCliError {
    fn from(e: io::Error) -> Self {
        GlycoCliError::Io(e)
    }
}

impl From<ComputeError> for GlycoCliError {
    fn from(e: ComputeError) -> Self {
        GlycoCliError::Compute(e)
    }
}

impl From<serde_json::Error> for GlycoCliError {
    fn from(e: serde_json::Error) -> Self {
        GlycoCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<GlycoCliError> for CliError {
    fn from(e: GlycoCliError) -> Self {
        match e {
            GlycoCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            GlycoCliError::Compute(e) => {
                let hint = match &e {
                    ComputeError::DataFormat(_) | ComputeError::Csv(_) => {
                        Some("Run 'glyco validate' on the export for details")
                    }
                    ComputeError::Configuration(_) => {
                        Some("Run 'glyco config' to see the effective configuration")
                    }
                    ComputeError::InsufficientData(_) => {
                        Some("Check the export covers the requested days")
                    }
                    ComputeError::Io(_) => Some("Check file paths and permissions"),
                    ComputeError::Json(_) => Some("Check JSON syntax"),
                };
                CliError {
                    code: e.kind().to_string(),
                    message: e.to_string(),
                    hint: hint.map(str::to_string),
                }
            }
            GlycoCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            GlycoCliError::ValidationFailed => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: "Export is missing columns required by the pipeline".to_string(),
                hint: Some("Fix the listed columns and retry".to_string()),
            },
            GlycoCliError::BatchFailed(failed, total) => CliError {
                code: "BATCH_FAILED".to_string(),
                message: format!("{failed} of {total} files failed"),
                hint: Some("Review the batch report for per-file errors".to_string()),
            },
        }
    }
}
