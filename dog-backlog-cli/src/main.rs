//! backlog - run workers and maintain a dog-backlog database

mod exec;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use dog_backlog::{
    init_tracing, CoordConfig, CoordCtx, CoordError, Monitor, SourceConfig, SqliteBackend, WorkerLoop,
    WorkerSettings,
};

use crate::exec::ExecProcessor;

/// Ten years; longer windows are rejected at parse time
const MAX_WINDOW_HOURS: u64 = 87_600;

#[derive(Debug, Parser)]
#[command(name = "backlog", version, about = "Distributed backlog worker and maintenance tool")]
struct Cli {
    /// Database URL, overriding BACKLOG__DATABASE__URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process a source until its backlog is drained
    Run {
        source: String,
        /// Consecutive empty pulls before exiting
        max_empty_attempts: Option<u32>,
        /// Messages per pull
        batch_size: Option<usize>,
        /// Command run per key, overriding BACKLOG__PROCESSOR__COMMAND
        #[arg(long)]
        exec: Option<String>,
    },
    /// Show backlog progress and active locks
    Stats {
        source: Option<String>,
        #[arg(default_value_t = 24, value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_HOURS))]
        hours: u64,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove expired locks, old enqueue-log entries and stale claims
    Clean { source: Option<String> },
    /// Make work claimed or enqueued in the last HOURS claimable again
    Reset {
        source: Option<String>,
        #[arg(default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..=MAX_WINDOW_HOURS))]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    init_tracing("info", cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = CoordConfig::from_env().context("invalid configuration")?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let backend = SqliteBackend::connect(&config.database_url)
        .await
        .with_context(|| format!("cannot open {}", config.database_url))?;
    backend.migrate().await.context("schema migration failed")?;

    match cli.command {
        Commands::Run {
            source,
            max_empty_attempts,
            batch_size,
            exec,
        } => {
            let source = resolve_source(&config, &source)?;
            let command = exec
                .or_else(|| config.processor_command.clone())
                .ok_or_else(|| anyhow!("no processor command: pass --exec or set BACKLOG__PROCESSOR__COMMAND"))?;
            let processor =
                ExecProcessor::parse(&command).ok_or_else(|| anyhow!("processor command is empty"))?;

            let mut settings = WorkerSettings::from_config(&config);
            if let Some(max) = max_empty_attempts {
                settings.max_empty_attempts = max;
            }
            if let Some(size) = batch_size {
                if size == 0 {
                    return Err(anyhow!("batch_size must be at least 1"));
                }
                settings.batch_size = size;
            }

            let ctx = CoordCtx::new(backend.stores(), config);
            run_worker(&ctx, source, processor, settings).await
        }
        Commands::Stats { source, hours, json } => {
            let ctx = CoordCtx::new(backend.stores(), config);
            let report = Monitor::new(&ctx).stats(source.as_deref(), hours).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{report}");
            }
            Ok(())
        }
        Commands::Clean { source } => {
            let ctx = CoordCtx::new(backend.stores(), config);
            let report = Monitor::new(&ctx).clean(source.as_deref()).await?;
            println!("{report}");
            Ok(())
        }
        Commands::Reset { source, hours } => {
            let ctx = CoordCtx::new(backend.stores(), config);
            let report = Monitor::new(&ctx).reset(source.as_deref(), hours).await?;
            println!("{report}");
            Ok(())
        }
    }
}

/// Configured source by name; defaults apply when no sources are configured at all
fn resolve_source(config: &CoordConfig, name: &str) -> Result<SourceConfig> {
    if config.sources.is_empty() {
        return Ok(SourceConfig::new(name));
    }
    match config.source(name) {
        Ok(source) => Ok(source.clone()),
        Err(err @ CoordError::UnknownSource(_)) => {
            let known: Vec<&str> = config.sources.iter().map(|s| s.name.as_str()).collect();
            Err(anyhow!("{err}; configured sources: {}", known.join(", ")))
        }
        Err(err) => Err(err.into()),
    }
}

async fn run_worker(
    ctx: &CoordCtx,
    source: SourceConfig,
    processor: ExecProcessor,
    settings: WorkerSettings,
) -> Result<()> {
    info!(source = %source.name, program = processor.program(), "starting worker");
    let mut handle = WorkerLoop::new(ctx, source, Arc::new(processor))
        .with_settings(settings)
        .spawn();

    let summary = tokio::select! {
        result = handle.wait() => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, stopping after the current batch");
            handle.shutdown().await?
        }
    };

    println!(
        "processed {} items: {} succeeded, {} dead-lettered ({} dead-letter publish failures), {} already complete",
        summary.processed,
        summary.succeeded,
        summary.dead_lettered,
        summary.dead_letter_publish_failures,
        summary.skipped
    );
    Ok(())
}
