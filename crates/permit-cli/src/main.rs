use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Args, Parser, Subcommand};
use permit_core::RunStatus;
use permit_sync::{
    build_scheduler, parse_lookback, verify_source, ConfigError, RunOptions, SourceRegistry, SourceSelection,
    SyncConfig, SyncPipeline,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "permit-cli")]
#[command(about = "Building-permit ETL: fetch, normalize and upsert municipal permit feeds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one or more sources once.
    Sync(SyncArgs),
    /// List the source registry.
    Sources,
    /// Count stored permits for a source.
    Verify { source: String },
    /// Run every enabled source on SYNC_CRON until Ctrl-C.
    Schedule,
}

#[derive(Debug, Args)]
struct SyncArgs {
    #[arg(required_unless_present = "all")]
    sources: Vec<String>,
    /// Every enabled source in the registry.
    #[arg(long, conflicts_with = "sources")]
    all: bool,
    /// Lookback such as 7d, 12h or 30m; overrides DAYS.
    #[arg(long, value_parser = parse_lookback)]
    since: Option<Duration>,
    /// Upsert into an in-memory table instead of the destination.
    #[arg(long)]
    dry_run: bool,
    /// Treat an empty result as success (same as ETL_ALLOW_EMPTY=1).
    #[arg(long)]
    allow_empty: bool,
    /// Start from the last successful run recorded in etl_state.
    #[arg(long)]
    incremental: bool,
}

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ConfigError>() {
        Some(config) if config.is_usage() => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "permit=info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = ?err, "permit-cli failed");
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = SyncConfig::from_env()?;
    match cli.command {
        Commands::Sync(args) => sync(config, args).await,
        Commands::Sources => list_sources(&config).await,
        Commands::Verify { source } => verify(config, &source).await,
        Commands::Schedule => schedule(config).await,
    }
}

async fn sync(config: SyncConfig, args: SyncArgs) -> Result<ExitCode> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let selection = if args.all {
        SourceSelection::All
    } else {
        SourceSelection::Named(args.sources)
    };
    let sources = registry.resolve(&selection, env_lookup)?;

    let pipeline = SyncPipeline::from_config(config, args.dry_run)?;
    let options = RunOptions {
        since: args.since,
        allow_empty: args.allow_empty,
        incremental: args.incremental,
    };
    let reports = pipeline.run_many(&sources, &options).await?;

    for report in &reports {
        println!("{}", report.summary_line());
    }
    let failed = reports.iter().filter(|r| r.status == RunStatus::Failed).count();
    if failed > 0 {
        error!(failed, total = reports.len(), "sync finished with failures");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn list_sources(config: &SyncConfig) -> Result<ExitCode> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    for source in &registry.sources {
        let feeds = source
            .feeds
            .iter()
            .map(|f| {
                let kind = f.kind.name();
                match &f.url_env {
                    Some(var) => format!("{kind}(${var})"),
                    None => kind.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<16} {:<18} {:<8} {:<32} {}",
            source.source_id,
            source.source_system,
            if source.enabled { "enabled" } else { "disabled" },
            feeds,
            source.display_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn verify(config: SyncConfig, source_id: &str) -> Result<ExitCode> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let source = registry
        .get(source_id)
        .ok_or_else(|| ConfigError::UnknownSource(source_id.to_string()))?;
    let table = config.permits_table.clone();
    let pipeline = SyncPipeline::from_config(config, false)?;
    let count = verify_source(pipeline.destination(), &table, &source.source_system)
        .await
        .with_context(|| format!("counting {} rows for {}", table, source.source_system))?;
    println!("{} ({}): {} rows in {}", source.source_id, source.source_system, count, table);
    Ok(ExitCode::SUCCESS)
}

async fn schedule(config: SyncConfig) -> Result<ExitCode> {
    let registry = SourceRegistry::load(&config.sources_file).await?;
    let sources = registry.resolve(&SourceSelection::All, env_lookup)?;
    let cron = config.sync_cron.clone();
    let pipeline = Arc::new(SyncPipeline::from_config(config, false)?);

    let mut sched = build_scheduler(pipeline, Arc::new(sources), RunOptions::default(), &cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %cron, "scheduler running; Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(ExitCode::SUCCESS)
}
