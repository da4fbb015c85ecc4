use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tpr_storage::{AccuracyLedger, PgResultSink};
use tpr_sync::{WorkerConfig, WorkerState};
use tpr_web::StatusState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "tpr-cli")]
#[command(about = "Temporal pattern recognition worker")]
struct Cli {
    /// Worker config file; defaults to $TPR_CONFIG or ./tpr.yaml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run cycles until interrupted.
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Apply database migrations.
    Migrate,
    /// Write predictions.parquet, accuracy.md and manifest.json.
    Export {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Serve stored accuracy without running a worker.
    Serve {
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = load_config(cli.config)?;
            run(config).await?;
        }
        Commands::Once => {
            let config = load_config(cli.config)?;
            let report = tpr_sync::run_once(&config).await?;
            println!(
                "cycle complete: fetched={} saved={} conflicts={} dropped={}",
                report.stats.fetched,
                report.stats.saved,
                report.stats.conflicts,
                report.stats.dropped()
            );
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let sink = PgResultSink::connect(&url)
                .await
                .context("connecting to the result store")?;
            sink.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Export { out } => {
            let config = load_config(cli.config)?;
            let out = out.unwrap_or_else(|| config.reports_dir.clone());
            let sinks = tpr_sync::connect_sinks(&config).await?;
            let manifest = tpr_sync::export_from_sink(sinks.results.as_ref(), &out).await?;
            println!(
                "exported {} predictions to {}",
                manifest.predictions,
                out.display()
            );
        }
        Commands::Serve { bind } => {
            let config = load_config(cli.config)?;
            let bind = bind
                .or_else(|| config.status_bind.clone())
                .unwrap_or_else(|| "127.0.0.1:8080".to_string());
            let sinks = tpr_sync::connect_sinks(&config).await?;
            let stored = sinks
                .results
                .load_all()
                .await
                .context("loading stored predictions")?;
            let mut state = WorkerState::new(config.worker_id.clone());
            state.accuracy = AccuracyLedger::from_predictions(&stored);
            tpr_web::serve(&bind, StatusState::fixed(state)).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<WorkerConfig> {
    match path {
        Some(path) => WorkerConfig::load_with_env(path),
        None => WorkerConfig::from_env(),
    }
}

async fn run(config: WorkerConfig) -> Result<()> {
    let scheduler = tpr_sync::build_scheduler(&config).await?;

    if let Some(bind) = config.status_bind.clone() {
        let state = StatusState::live(scheduler.subscribe());
        tokio::spawn(async move {
            if let Err(err) = tpr_web::serve(&bind, state).await {
                warn!(error = %err, "status server stopped");
            }
        });
    }

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("termination signal received");
        let _ = stop.send(true);
    });

    let state = scheduler.run(shutdown).await?;
    println!(
        "worker {} stopped: cycles={} saved={} hybrid_accuracy={:.3}",
        state.worker_id,
        state.cycles_completed,
        state.totals.saved,
        state.accuracy.hybrid_accuracy()
    );
    Ok(())
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
