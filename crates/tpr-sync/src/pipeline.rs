//! A single fetch, extract, predict and persist cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tpr_adapters::{AdapterError, FetchOutcome, FetchRequest, SourceAdapter, SourceStatus};
use tpr_core::{Checkpoint, ClassifiedOutput, Prediction, RawRecord, RecordId};
use tpr_engine::{
    Evaluator, ExtractError, HeuristicEvaluator, HybridPredictor, PositionExtractor,
    SignatureExtractor,
};
use tpr_storage::{AccuracyLedger, DedupLedger, LedgerError, ResultSink, Upstream};
use tracing::{debug, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    Fetching,
    Extracting,
    Predicting,
    Persisting,
    Reporting,
    Resting,
}

impl CyclePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            CyclePhase::Idle => "idle",
            CyclePhase::Fetching => "fetching",
            CyclePhase::Extracting => "extracting",
            CyclePhase::Predicting => "predicting",
            CyclePhase::Persisting => "persisting",
            CyclePhase::Reporting => "reporting",
            CyclePhase::Resting => "resting",
        }
    }
}

/// Counters for one cycle, or summed over a reporting interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub fetched: u64,
    pub saved: u64,
    pub baseline_correct: u64,
    pub hybrid_correct: u64,
    /// Already in the ledger when the cycle reached them.
    pub already_known: u64,
    pub conflicts: u64,
    pub unparseable: u64,
    pub too_short: u64,
    pub persistence_failures: u64,
    /// Marks that stayed in memory because the ledger file could not be written.
    pub ledger_write_failures: u64,
}

impl CycleStats {
    pub fn absorb(&mut self, other: &CycleStats) {
        self.fetched += other.fetched;
        self.saved += other.saved;
        self.baseline_correct += other.baseline_correct;
        self.hybrid_correct += other.hybrid_correct;
        self.already_known += other.already_known;
        self.conflicts += other.conflicts;
        self.unparseable += other.unparseable;
        self.too_short += other.too_short;
        self.persistence_failures += other.persistence_failures;
        self.ledger_write_failures += other.ledger_write_failures;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn dropped(&self) -> u64 {
        self.unparseable + self.too_short + self.persistence_failures
    }
}

/// Where each source resumes its identity rotation. Owned by the scheduler
/// and handed to every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RotationState {
    cursors: BTreeMap<String, usize>,
}

impl RotationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self, source_id: &str) -> usize {
        self.cursors.get(source_id).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, source_id: &str, next_identity: usize) {
        self.cursors.insert(source_id.to_string(), next_identity);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub status: SourceStatus,
    pub records: usize,
    pub identities_tried: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub stats: CycleStats,
    pub sources: Vec<SourceReport>,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("no source yielded usable records ({})", describe_sources(.sources))]
    SourceExhausted { sources: Vec<SourceReport> },
}

fn describe_sources(sources: &[SourceReport]) -> String {
    sources
        .iter()
        .map(|s| format!("{}={}", s.source_id, s.status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub target_ply: u32,
    /// Records requested from each source per cycle.
    pub batch_limit: usize,
    pub fetch_concurrency: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_ply: 20,
            batch_limit: 25,
            fetch_concurrency: 4,
        }
    }
}

pub struct Pipeline {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    upstream: Arc<dyn Upstream>,
    ledger: DedupLedger,
    sink: Arc<dyn ResultSink>,
    extractor: PositionExtractor,
    signatures: SignatureExtractor,
    evaluator: Arc<dyn Evaluator>,
    predictor: HybridPredictor,
    settings: PipelineSettings,
    accuracy: AccuracyLedger,
    phase: CyclePhase,
}

impl Pipeline {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        upstream: Arc<dyn Upstream>,
        ledger: DedupLedger,
        sink: Arc<dyn ResultSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            adapters,
            upstream,
            ledger,
            sink,
            extractor: PositionExtractor::new(),
            signatures: SignatureExtractor::default(),
            evaluator: Arc::new(HeuristicEvaluator::default()),
            predictor: HybridPredictor::default(),
            settings,
            accuracy: AccuracyLedger::default(),
            phase: CyclePhase::Idle,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_predictor(mut self, predictor: HybridPredictor) -> Self {
        self.predictor = predictor;
        self
    }

    pub fn with_signatures(mut self, signatures: SignatureExtractor) -> Self {
        self.signatures = signatures;
        self
    }

    /// Seeds the running accuracy, usually from what the sink already holds.
    pub fn with_accuracy(mut self, accuracy: AccuracyLedger) -> Self {
        self.accuracy = accuracy;
        self
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: CyclePhase) {
        self.phase = phase;
    }

    pub fn accuracy(&self) -> AccuracyLedger {
        self.accuracy
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.sink
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn flush_ledger(&mut self) -> Result<(), LedgerError> {
        self.ledger.flush().await
    }

    /// Runs the whole chain for one record's checkpoint.
    pub fn predict(&self, record: &RawRecord, checkpoint: &Checkpoint) -> Prediction {
        let profile = self.signatures.extract(checkpoint);
        let baseline = self.evaluator.evaluate(checkpoint);
        let decision = self.predictor.predict(&profile, &baseline);
        Prediction::new(
            record.id.clone(),
            checkpoint.content_hash.clone(),
            ClassifiedOutput {
                class: baseline.class,
                confidence: baseline.confidence,
            },
            ClassifiedOutput {
                class: decision.class,
                confidence: decision.confidence,
            },
            decision.archetype.tag(),
            decision.overrule_reason,
            record.declared_outcome,
        )
    }

    /// Per-record failures are counted and logged, never returned. The cycle
    /// only fails when no source produced anything.
    pub async fn run_cycle(
        &mut self,
        rotation: &mut RotationState,
    ) -> Result<CycleReport, CycleError> {
        let span = info_span!("cycle", sources = self.adapters.len());
        self.run_cycle_inner(rotation).instrument(span).await
    }

    async fn run_cycle_inner(
        &mut self,
        rotation: &mut RotationState,
    ) -> Result<CycleReport, CycleError> {
        let mut stats = CycleStats::default();

        self.phase = CyclePhase::Fetching;
        let (records, sources) = self.fetch_all(rotation).await;
        stats.fetched = records.len() as u64;
        if records.is_empty() {
            self.phase = CyclePhase::Idle;
            return Err(CycleError::SourceExhausted { sources });
        }

        self.phase = CyclePhase::Extracting;
        let mut in_cycle = HashSet::new();
        let mut extracted = Vec::with_capacity(records.len());
        for record in records {
            if self.ledger.is_known(&record.id)
                || !in_cycle.insert(record.id.storage_key().to_string())
            {
                stats.already_known += 1;
                debug!(record_id = %record.id, "record already processed");
                continue;
            }
            match self.extractor.extract(&record, self.settings.target_ply) {
                Ok(checkpoint) => extracted.push((record, checkpoint)),
                Err(err) => {
                    match err {
                        ExtractError::InsufficientLength { .. } => {
                            stats.too_short += 1;
                            info!(record_id = %record.id, error = %err, "dropping short record");
                        }
                        ExtractError::Unparseable { .. } => {
                            stats.unparseable += 1;
                            warn!(record_id = %record.id, error = %err, "dropping unparseable record");
                        }
                    }
                    // Replaying it again would fail the same way.
                    self.mark_processed(&record.id, &mut stats).await;
                }
            }
        }

        self.phase = CyclePhase::Predicting;
        let predictions: Vec<Prediction> = extracted
            .iter()
            .map(|(record, checkpoint)| self.predict(record, checkpoint))
            .collect();

        self.phase = CyclePhase::Persisting;
        for prediction in &predictions {
            match self.sink.save(prediction).await {
                Ok(true) => {
                    stats.saved += 1;
                    if prediction.baseline_correct {
                        stats.baseline_correct += 1;
                    }
                    if prediction.hybrid_correct {
                        stats.hybrid_correct += 1;
                    }
                    self.accuracy.record(prediction);
                    self.mark_processed(&prediction.record_id, &mut stats).await;
                }
                Ok(false) => {
                    stats.conflicts += 1;
                    debug!(record_id = %prediction.record_id, "prediction already stored");
                    self.mark_processed(&prediction.record_id, &mut stats).await;
                }
                Err(err) => {
                    // Left unmarked so a later cycle retries it.
                    stats.persistence_failures += 1;
                    warn!(record_id = %prediction.record_id, error = %err, "failed to persist prediction");
                }
            }
        }

        self.phase = CyclePhase::Reporting;
        info!(
            fetched = stats.fetched,
            saved = stats.saved,
            conflicts = stats.conflicts,
            already_known = stats.already_known,
            dropped = stats.dropped(),
            ledger_write_failures = stats.ledger_write_failures,
            baseline_accuracy = self.accuracy.baseline_accuracy(),
            hybrid_accuracy = self.accuracy.hybrid_accuracy(),
            "cycle complete"
        );
        Ok(CycleReport { stats, sources })
    }

    /// The in-memory mark always lands; a failed file write is retried by the
    /// next flush.
    async fn mark_processed(&mut self, id: &RecordId, stats: &mut CycleStats) {
        if let Err(err) = self.ledger.mark_known(id).await {
            stats.ledger_write_failures += 1;
            warn!(record_id = %id, error = %err, "dedup ledger write failed");
        }
    }

    /// Fans out to every adapter, bounded by `fetch_concurrency`, and folds the
    /// outcomes back in configuration order.
    async fn fetch_all(
        &self,
        rotation: &mut RotationState,
    ) -> (Vec<RawRecord>, Vec<SourceReport>) {
        let exclude = Arc::new(self.ledger.build_exclusion_set());
        let permits = Arc::new(Semaphore::new(self.settings.fetch_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for (index, adapter) in self.adapters.iter().enumerate() {
            let adapter = Arc::clone(adapter);
            let upstream = Arc::clone(&self.upstream);
            let exclude = Arc::clone(&exclude);
            let permits = Arc::clone(&permits);
            let limit = self.settings.batch_limit;
            let start_identity = rotation.cursor(adapter.source_id());
            let span = info_span!("fetch_source", source_id = %adapter.source_id());
            tasks.spawn(
                async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (
                                index,
                                Err(AdapterError::Message("fetch limiter closed".to_string())),
                            )
                        }
                    };
                    let request = FetchRequest {
                        exclude: exclude.as_ref(),
                        limit,
                        start_identity,
                    };
                    (index, adapter.fetch_batch(upstream.as_ref(), request).await)
                }
                .instrument(span),
            );
        }

        let mut outcomes: HashMap<usize, Result<FetchOutcome, AdapterError>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    outcomes.insert(index, outcome);
                }
                Err(err) => warn!(error = %err, "fetch task aborted"),
            }
        }

        let mut records = Vec::new();
        let mut reports = Vec::with_capacity(self.adapters.len());
        for (index, adapter) in self.adapters.iter().enumerate() {
            let source_id = adapter.source_id().to_string();
            let report = match outcomes.remove(&index) {
                Some(Ok(outcome)) => {
                    rotation.advance(&source_id, outcome.next_identity);
                    if outcome.status != SourceStatus::Ok {
                        warn!(
                            source_id = %source_id,
                            status = outcome.status.as_str(),
                            identities_tried = outcome.identities_tried,
                            "source exhausted"
                        );
                    }
                    let report = SourceReport {
                        source_id,
                        status: outcome.status,
                        records: outcome.records.len(),
                        identities_tried: outcome.identities_tried,
                        error: None,
                    };
                    records.extend(outcome.records);
                    report
                }
                Some(Err(err)) => {
                    warn!(source_id = %source_id, error = %err, "source adapter failed");
                    SourceReport {
                        source_id,
                        status: SourceStatus::Unavailable,
                        records: 0,
                        identities_tried: 0,
                        error: Some(err.to_string()),
                    }
                }
                None => SourceReport {
                    source_id,
                    status: SourceStatus::Unavailable,
                    records: 0,
                    identities_tried: 0,
                    error: Some("fetch task aborted".to_string()),
                },
            };
            reports.push(report);
        }
        (records, reports)
    }
}
