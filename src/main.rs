//! Command-line front end for the batch analysis client.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use acrebatch::api::types::JobStatus;
use acrebatch::api::BatchApiClient;
use acrebatch::config::ClientConfig;
use acrebatch::error::AppError;
use acrebatch::poller::{PollEnd, PollerConfig};
use acrebatch::registry::{JobRecord, JobRegistry, JobUpdate, SqliteStore};
use acrebatch::tracker::JobTracker;
use acrebatch::upload::{
    parse_headers, submit_job, ColumnMapping, REQUIRED_FIELDS, SPREADSHEET_SUFFIXES,
};

#[derive(Parser)]
#[command(
    name = "acrebatch",
    about = "Batch analysis job client for the parcel valuation API"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a tabular file and start tracking the new job
    Submit {
        /// CSV or Excel file to analyze
        file: PathBuf,

        /// Column mappings in HEADER=FIELD form (fields: latitude, longitude)
        #[arg(long = "map", value_name = "HEADER=FIELD")]
        map: Vec<String>,

        /// Keep polling until the job finishes
        #[arg(long)]
        watch: bool,
    },

    /// List tracked jobs, refreshing in-flight ones first
    Jobs,

    /// Poll one job until it resolves
    Watch {
        job_id: String,
    },

    /// Request cancellation of a job (best-effort)
    Cancel {
        job_id: String,
    },

    /// Download the result CSV of a completed job
    Download {
        job_id: String,

        /// Output path (defaults to analysis_results_<job_id>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove a job from the tracked list
    Remove {
        job_id: String,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acrebatch=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run(Cli::parse()).await {
        let presentation = err.to_presentation();
        eprintln!("{}: {}", presentation.title, presentation.message);
        if let Some(action) = presentation.action {
            eprintln!("  -> {}", action);
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let config = ClientConfig::from_env()?;

    let store = Arc::new(SqliteStore::open(config.jobs_db_path()).await?);
    let registry = Arc::new(JobRegistry::load(store).await?);
    let client = Arc::new(BatchApiClient::from_config(&config)?);
    let tracker = JobTracker::new(registry.clone(), client.clone(), PollerConfig::from(&config));

    match cli.command {
        Command::Submit { file, map, watch } => {
            let headers = parse_headers(&file).await?;

            let mut mapping = ColumnMapping::infer(&headers, REQUIRED_FIELDS);
            mapping.apply_pairs(&map, REQUIRED_FIELDS)?;

            for field in mapping.missing(REQUIRED_FIELDS) {
                println!(
                    "note: no column mapped for {} (headers: {}); the service will try to auto-detect it",
                    field.name,
                    headers.join(", ")
                );
            }

            let record = submit_job(
                &client,
                &registry,
                &file,
                &mapping,
                config.user_id.as_deref(),
                config.email.as_deref(),
            )
            .await?;

            println!(
                "Submitted {} as job {} (~{} rows)",
                record.filename, record.job_id, record.total_rows
            );

            if watch {
                watch_job(&tracker, &registry, &record.job_id).await;
            }
        }

        Command::Jobs => {
            refresh_active(&client, &registry).await;

            let records = registry.list_by_filename_suffix(SPREADSHEET_SUFFIXES).await;
            if records.is_empty() {
                println!("No tracked jobs.");
            }
            for record in records {
                print_record(&record);
            }
        }

        Command::Watch { job_id } => {
            if registry.get(&job_id).await.is_none() {
                println!("Job {} is not tracked.", job_id);
            } else {
                watch_job(&tracker, &registry, &job_id).await;
            }
        }

        Command::Cancel { job_id } => match tracker.cancel(&job_id).await? {
            Some(record) => {
                println!("Cancellation requested for job {}", record.job_id);
                print_record(&record);
            }
            None => println!("Cancellation requested for untracked job {}", job_id),
        },

        Command::Download { job_id, output } => {
            let output = output
                .unwrap_or_else(|| PathBuf::from(format!("analysis_results_{}.csv", job_id)));
            let bytes = tracker.download(&job_id, &output).await?;
            println!("Saved {} bytes to {}", bytes, output.display());
        }

        Command::Remove { job_id } => {
            if tracker.remove(&job_id).await? {
                println!("Removed job {}", job_id);
            } else {
                println!("Job {} was not tracked", job_id);
            }
        }
    }

    tracker.shutdown().await;
    Ok(())
}

/// Attaches a poller to the job and blocks until it resolves.
async fn watch_job(tracker: &JobTracker, registry: &JobRegistry, job_id: &str) {
    tracker.attach(job_id).await;

    match tracker.wait(job_id).await {
        Some(PollEnd::Terminal(status)) => {
            println!("Job finished: {}", status.as_str());
        }
        Some(PollEnd::Gone) => println!("Job disappeared from the server."),
        Some(PollEnd::Transport) => println!("Gave up: lost contact with the analysis service."),
        Some(PollEnd::BudgetExhausted) => {
            println!("Stopped watching: the job did not resolve within the poll budget.")
        }
        Some(PollEnd::Stopped) | None => {}
    }

    if let Some(record) = registry.get(job_id).await {
        print_record(&record);
    }
}

/// One-shot refresh of every in-flight job before listing, so a short-lived
/// invocation still shows current numbers. Connectivity problems leave the
/// records as they were; a vanished job is marked failed like the poller
/// would mark it.
async fn refresh_active(client: &BatchApiClient, registry: &JobRegistry) {
    for job_id in registry.active_job_ids().await {
        match client.job_progress(&job_id).await {
            Ok(progress) => {
                let _ = registry.update(&job_id, JobUpdate::from(progress)).await;
            }
            Err(AppError::JobGone { .. }) => {
                let _ = registry
                    .update(
                        &job_id,
                        JobUpdate::status_with_error(
                            JobStatus::Failed,
                            "Job not found on the server — it may have been cancelled or deleted",
                        ),
                    )
                    .await;
            }
            Err(err) => {
                tracing::warn!("could not refresh job {}: {}", job_id, err);
            }
        }
    }
}

fn print_record(record: &JobRecord) {
    let progress = if record.total_rows > 0 {
        format!(
            "{}/{} ({}%)",
            record.completed_rows,
            record.total_rows,
            record.completed_rows * 100 / record.total_rows
        )
    } else {
        format!("{} rows", record.completed_rows)
    };

    println!(
        "{}  {:<10}  {}  {}  {}",
        record.job_id,
        record.status.as_str(),
        progress,
        record.filename,
        record.created_at
    );

    if let Some(error) = &record.error {
        println!("    {}", error);
    }
}
