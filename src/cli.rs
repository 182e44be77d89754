//! CLI interface for predictor

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::service::PredictorService;
use crate::types::{InputVersion, PredictionRecord, Subject};

#[derive(Parser)]
#[command(name = "predictor")]
#[command(about = "Keeps per-subject predictions fresh and durably stored", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "PREDICTOR_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the config file
    #[arg(long, global = true, env = "DB_PATH")]
    db: Option<PathBuf>,

    /// JSON inputs file, overriding `source.inputs_path`
    #[arg(long, global = true, env = "PREDICTOR_INPUTS")]
    inputs: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling loop until SIGINT/SIGTERM (default)
    Run {
        /// Run a single tick, wait for it to finish and exit
        #[arg(long)]
        once: bool,
    },
    /// Show the current committed prediction for a subject
    Query {
        subject: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show committed predictions for a subject, newest first
    History {
        subject: String,
        #[arg(short, long, default_value = "20")]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// List subjects that exhausted their attempts
    Failed,
    /// Close attempts left open by an unclean shutdown
    Recover,
    /// Purge expired ledger entries and history
    Gc,
    /// Record the realised value for a committed prediction
    Outcome {
        subject: String,
        /// Input version the prediction was computed from
        version: u64,
        actual: f64,
    },
    /// Show store statistics and accuracy
    Stats {
        #[arg(long)]
        json: bool,
    },
    /// Show or initialise configuration
    Config {
        /// Print the config file path
        #[arg(long)]
        path: bool,
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => {
            let service = open(config, cli.db).await?;
            run_service(&service, once).await?;
        }
        Commands::Query { subject, json } => {
            let service = open(config, cli.db).await?;
            match service.query(&Subject::parse(&subject)?).await? {
                Some(record) if json => println!("{}", serde_json::to_string_pretty(&record)?),
                Some(record) => print_record(&record),
                None => println!("No committed prediction for {}", subject),
            }
        }
        Commands::History { subject, limit, json } => {
            let service = open(config, cli.db).await?;
            let records = service.history(&Subject::parse(&subject)?, limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No history for {}", subject);
            } else {
                for record in &records {
                    print_record(record);
                }
            }
        }
        Commands::Failed => {
            let service = open(config, cli.db).await?;
            let failed = service.failed().await?;
            if failed.is_empty() {
                println!("No failed subjects");
            }
            for state in failed {
                println!(
                    "{}  at {}  {}",
                    state.subject,
                    state.failed_version.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
                    state.failure_reason.unwrap_or_default()
                );
            }
        }
        Commands::Recover => {
            let service = open(config, cli.db).await?;
            let report = service.recover().await?;
            println!(
                "Scanned {} open attempts: {} aborted, {} reconciled, {} stray pending rows removed",
                report.scanned, report.aborted, report.reconciled, report.stray_pending_removed
            );
        }
        Commands::Gc => {
            let service = open(config, cli.db).await?;
            let report = service.gc().await?;
            service.store().checkpoint().await?;
            println!(
                "Removed {} ledger entries and {} history rows",
                report.ledger_removed, report.history_removed
            );
        }
        Commands::Outcome { subject, version, actual } => {
            let service = open(config, cli.db).await?;
            let outcome = service
                .record_outcome(&Subject::parse(&subject)?, InputVersion(version), actual)
                .await?;
            println!(
                "{} at {}: predicted {:.4}, actual {:.4}, error {:.4}",
                outcome.subject,
                outcome.input_version,
                outcome.predicted,
                outcome.actual,
                outcome.abs_error()
            );
        }
        Commands::Stats { json } => {
            let service = open(config, cli.db).await?;
            let stats = service.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Subjects:        {} ({} failed)", stats.store.subjects, stats.store.failed_subjects);
                println!("Committed:       {}", stats.store.committed);
                println!("Superseded:      {}", stats.store.superseded);
                println!("Pending:         {}", stats.store.pending);
                println!("Open attempts:   {}", stats.store.open_attempts);
                println!("Ledger entries:  {}", stats.store.ledger_entries);
                match stats.accuracy.mean_abs_error {
                    Some(mae) => println!("Outcomes:        {} (MAE {:.4})", stats.accuracy.total, mae),
                    None => println!("Outcomes:        0"),
                }
            }
        }
        Commands::Config { path, init } => {
            let file = match cli.config {
                Some(file) => file,
                None => config::config_path()?,
            };
            if path {
                println!("{}", file.display());
            } else if init {
                if file.exists() {
                    println!("Config already exists at {}", file.display());
                } else {
                    Config::default().save_to(&file)?;
                    println!("Wrote default config to {}", file.display());
                }
            } else {
                config::show_config(&config)?;
            }
        }
    }

    Ok(())
}

/// Config file plus command-line and environment overrides
fn resolve_config(cli: &Cli) -> Result<Config> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(inputs) = &cli.inputs {
        config.source.inputs_path = Some(inputs.clone());
    }
    Ok(config)
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) if path.exists() => Config::load_from(path),
        Some(path) => {
            warn!("Config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
        None => Config::load(),
    }
}

async fn open(config: Config, db: Option<PathBuf>) -> Result<PredictorService> {
    PredictorService::open(config, db.as_deref())
        .await
        .context("Failed to open prediction store")
}

async fn run_service(service: &PredictorService, once: bool) -> Result<()> {
    let report = service.recover().await?;
    if report.scanned > 0 {
        info!("Startup recovery closed {} orphaned attempts", report.scanned);
    }

    let scheduler = service.scheduler()?;

    if once {
        let report = scheduler.tick().await?;
        scheduler.wait_idle().await;
        service.store().checkpoint().await?;
        println!(
            "Observed {}, dispatched {}, current {}",
            report.observed, report.dispatched, report.current
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
        }
        let _ = shutdown_tx.send(());
    });

    scheduler.run(shutdown_rx).await
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn print_record(record: &PredictionRecord) {
    println!(
        "{}  {}  value {:.4}  confidence {:.2}  computed {}",
        record.subject,
        record.input_version,
        record.value,
        record.confidence,
        record.computed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
}
