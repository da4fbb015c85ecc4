//! Worker orchestration: configuration, the cycle pipeline, the scheduler loop
//! and report export.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tpr_adapters::{adapter_for_source, SourceAdapter};
use tpr_engine::{HeuristicEvaluator, HybridPredictor, SignatureExtractor};
use tpr_storage::{
    AccuracyLedger, DedupLedger, HttpFetcher, LogStatusSink, MemoryResultSink, PgResultSink,
    ResultSink, StatusSink,
};
use tracing::info;

pub mod config;
pub mod pipeline;
pub mod report;
pub mod scheduler;

pub use config::{ConfigError, SinkKind, WorkerConfig, DEFAULT_CONFIG_PATH};
pub use pipeline::{
    CycleError, CyclePhase, CycleReport, CycleStats, Pipeline, PipelineSettings, RotationState,
    SourceReport,
};
pub use report::{export_predictions, ReportManifest, ReportManifestFile};
pub use scheduler::{ScheduleConfig, Scheduler, WorkerState};

pub const CRATE_NAME: &str = "tpr-sync";

/// Result and heartbeat stores selected by the config.
#[derive(Clone)]
pub struct Sinks {
    pub results: Arc<dyn ResultSink>,
    pub status: Arc<dyn StatusSink>,
}

pub async fn connect_sinks(config: &WorkerConfig) -> Result<Sinks> {
    match config.sink {
        SinkKind::Memory => Ok(Sinks {
            results: Arc::new(MemoryResultSink::new()),
            status: Arc::new(LogStatusSink),
        }),
        SinkKind::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres sink")?;
            let pg = Arc::new(
                PgResultSink::connect(url)
                    .await
                    .context("connecting to the result store")?,
            );
            Ok(Sinks {
                results: pg.clone(),
                status: pg,
            })
        }
    }
}

pub fn build_adapters(config: &WorkerConfig) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    let policy = config.adapter_policy();
    config
        .enabled_sources()
        .map(|spec| {
            adapter_for_source(spec, policy)
                .with_context(|| format!("building adapter for {}", spec.id))
        })
        .collect()
}

/// Assembles a pipeline from config. Running accuracy is seeded from the
/// predictions the sink already holds.
pub async fn build_pipeline(config: &WorkerConfig, results: Arc<dyn ResultSink>) -> Result<Pipeline> {
    let adapters = build_adapters(config)?;
    let upstream = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let ledger = DedupLedger::open(&config.ledger.path, config.ledger.flush_every)
        .await
        .with_context(|| format!("opening ledger {}", config.ledger.path.display()))?;
    let stored = results
        .load_all()
        .await
        .context("loading stored predictions")?;
    let accuracy = AccuracyLedger::from_predictions(&stored);
    info!(
        worker_id = %config.worker_id,
        sources = adapters.len(),
        ledger_entries = ledger.len(),
        stored_predictions = stored.len(),
        enhanced = config.enhanced_signature,
        "pipeline ready"
    );

    Ok(Pipeline::new(
        adapters,
        upstream,
        ledger,
        results,
        config.pipeline_settings(),
    )
    .with_evaluator(Arc::new(HeuristicEvaluator::new(config.evaluator)))
    .with_predictor(HybridPredictor::new(config.predictor))
    .with_signatures(SignatureExtractor::enhanced(config.enhanced_signature))
    .with_accuracy(accuracy))
}

pub async fn build_scheduler(config: &WorkerConfig) -> Result<Scheduler> {
    let sinks = connect_sinks(config).await?;
    let pipeline = build_pipeline(config, sinks.results).await?;
    Ok(Scheduler::new(
        config.worker_id.clone(),
        pipeline,
        sinks.status,
        config.schedule_config(),
    ))
}

/// One cycle outside the scheduler loop; the ledger is flushed afterwards
/// even if the cycle failed.
pub async fn run_once(config: &WorkerConfig) -> Result<CycleReport> {
    let sinks = connect_sinks(config).await?;
    let mut pipeline = build_pipeline(config, sinks.results).await?;
    let mut rotation = RotationState::new();
    let outcome = pipeline.run_cycle(&mut rotation).await;
    pipeline
        .flush_ledger()
        .await
        .context("flushing dedup ledger")?;
    Ok(outcome?)
}

pub async fn export_from_sink(results: &dyn ResultSink, out: &Path) -> Result<ReportManifest> {
    let predictions = results
        .load_all()
        .await
        .context("loading stored predictions")?;
    let accuracy = AccuracyLedger::from_predictions(&predictions);
    export_predictions(out, &predictions, &accuracy).await
}
