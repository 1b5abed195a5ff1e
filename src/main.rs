use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use venue_ingest::batch::{BatchReport, BatchSummary};
use venue_ingest::config::AppConfig;
use venue_ingest::confirm::{TerminalConfirm, WriteConfirmation};
use venue_ingest::ingestion::{load_queries, QueryFailure, VenueQuery};
use venue_ingest::store::VenueStore;
use venue_ingest::upsert::{Changeset, ConflictResolution};
use venue_ingest::{init_tracing, AppError, IngestContext};

const EXIT_PARTIAL_FAILURE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

/// Pull venues from the places directory into the local venue store.
#[derive(Parser, Debug)]
#[command(name = "venue-ingest")]
#[command(version)]
struct Args {
    /// Directory holding the venue database and audit log
    #[arg(long, global = true, default_value = "data", env = "VENUE_INGEST_DATA_DIR")]
    data_dir: PathBuf,

    /// What to do when a venue already exists
    #[arg(long, global = true, default_value_t = ConflictResolution::Merge)]
    resolution: ConflictResolution,

    /// Ask before each write
    #[arg(long, global = true)]
    interactive: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Text-search one or more queries and store the matches
    Search {
        #[arg(required = true)]
        queries: Vec<String>,
        #[arg(long, requires = "lng", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lng: Option<f64>,
        /// Bias radius in meters
        #[arg(long)]
        radius: Option<u32>,
    },
    /// Store venues of one category around a point
    Nearby {
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lng: f64,
        #[arg(long, default_value_t = 1_000)]
        radius: u32,
        #[arg(long, default_value = "bar")]
        category: String,
    },
    /// Run every query from a CSV or JSON file
    Import { file: PathBuf },
    /// Re-fetch venues that have not been refreshed recently
    Refresh {
        #[arg(long, default_value_t = 30)]
        older_than_days: i64,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Mark a stored venue as verified
    Verify {
        external_id: String,
        #[arg(long = "by")]
        verifier: String,
    },
    /// Print the effective configuration and store status
    Config,
}

#[derive(Serialize)]
struct RunOutput<'a> {
    summary: &'a BatchSummary,
    changeset: &'a Changeset,
    #[serde(skip_serializing_if = "is_empty")]
    unmatched_queries: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    failed_queries: &'a [QueryFailure],
}

fn is_empty<T>(items: &&[T]) -> bool {
    items.is_empty()
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            if matches!(err.downcast_ref::<AppError>(), Some(AppError::Cancelled)) {
                warn!("ingestion cancelled");
                return ExitCode::from(EXIT_CANCELLED);
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let config = AppConfig::from_env();
    let ctx = IngestContext::initialize(&args.data_dir, config)
        .with_context(|| format!("failed to open data dir {}", args.data_dir.display()))?;
    let confirmation: Option<Arc<dyn WriteConfirmation>> = if args.interactive {
        Some(Arc::new(TerminalConfirm::new()))
    } else {
        None
    };
    info!(resolution = %args.resolution, interactive = args.interactive, "starting");

    match args.command {
        Command::Search {
            queries,
            lat,
            lng,
            radius,
        } => {
            let queries: Vec<_> = queries
                .into_iter()
                .map(|query| VenueQuery {
                    latitude: lat,
                    longitude: lng,
                    radius_m: radius,
                    ..VenueQuery::new(query)
                })
                .collect();
            let pipeline = ctx.pipeline(args.resolution, confirmation)?;
            let report = pipeline.run(&queries).await?;
            emit(&report.batch, &report.unmatched_queries, &report.failed_queries)
        }
        Command::Nearby {
            lat,
            lng,
            radius,
            category,
        } => {
            let pipeline = ctx.pipeline(args.resolution, confirmation)?;
            let report = pipeline.run_nearby(lat, lng, radius, &category).await?;
            emit(&report, &[], &[])
        }
        Command::Import { file } => {
            let queries = load_queries(&file)
                .with_context(|| format!("failed to read queries from {}", file.display()))?;
            let pipeline = ctx.pipeline(args.resolution, confirmation)?;
            let report = pipeline.run(&queries).await?;
            emit(&report.batch, &report.unmatched_queries, &report.failed_queries)
        }
        Command::Refresh {
            older_than_days,
            limit,
        } => {
            let older_than = refresh_window(older_than_days)?;
            let pipeline = ctx.pipeline(args.resolution, confirmation)?;
            let report = pipeline.refresh_stale(older_than, limit).await?;
            emit(&report, &[], &[])
        }
        Command::Verify {
            external_id,
            verifier,
        } => {
            let record = ctx.store().verify(&external_id, &verifier)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&ctx.health()?)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn refresh_window(days: i64) -> Result<TimeDelta> {
    TimeDelta::try_days(days)
        .with_context(|| format!("--older-than-days {days} is out of range"))
}

/// Prints the run result; any per-item error makes the exit code non-zero.
fn emit(
    report: &BatchReport,
    unmatched_queries: &[String],
    failed_queries: &[QueryFailure],
) -> Result<ExitCode> {
    let output = RunOutput {
        summary: &report.summary,
        changeset: &report.changeset,
        unmatched_queries,
        failed_queries,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    if report.summary.is_clean() && failed_queries.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_PARTIAL_FAILURE))
    }
}
