//! Repeats cycles with failure backoff, adaptive rest and graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tpr_storage::{AccuracyLedger, StatusSink, WorkerHeartbeat};
use tracing::{info, warn};

use crate::pipeline::{CycleError, CyclePhase, CycleReport, CycleStats, Pipeline, RotationState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub target_cycle: Duration,
    pub min_rest: Duration,
    /// How long an in-flight cycle may keep running after shutdown is requested.
    pub shutdown_grace: Duration,
    pub report_every_cycles: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(300),
            target_cycle: Duration::from_secs(120),
            min_rest: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(30),
            report_every_cycles: 10,
        }
    }
}

impl ScheduleConfig {
    /// `base * 2^(failures - 1)`, capped. Zero failures means no backoff.
    pub fn failure_backoff(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32
            .checked_shl(consecutive_failures - 1)
            .unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    /// Rest after a successful cycle, aiming for one cycle per `target_cycle`.
    pub fn adaptive_rest(&self, elapsed: Duration) -> Duration {
        self.target_cycle.saturating_sub(elapsed).max(self.min_rest)
    }
}

/// Everything a monitor needs to know about this worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerState {
    pub worker_id: String,
    pub phase: CyclePhase,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    /// Process lifetime totals.
    pub totals: CycleStats,
    /// Totals since the last status report.
    pub interval: CycleStats,
    pub accuracy: AccuracyLedger,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl WorkerState {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            phase: CyclePhase::Idle,
            cycles_completed: 0,
            cycles_failed: 0,
            consecutive_failures: 0,
            totals: CycleStats::default(),
            interval: CycleStats::default(),
            accuracy: AccuracyLedger::default(),
            last_error: None,
            last_cycle_at: None,
        }
    }

    pub fn record_success(&mut self, report: &CycleReport, accuracy: AccuracyLedger, at: DateTime<Utc>) {
        self.cycles_completed += 1;
        self.consecutive_failures = 0;
        self.totals.absorb(&report.stats);
        self.interval.absorb(&report.stats);
        self.accuracy = accuracy;
        self.last_error = None;
        self.last_cycle_at = Some(at);
    }

    pub fn record_failure(&mut self, error: &CycleError, at: DateTime<Utc>) {
        self.cycles_failed += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.last_cycle_at = Some(at);
    }

    /// Returns the interval counters and starts a new interval.
    pub fn take_interval(&mut self) -> CycleStats {
        std::mem::take(&mut self.interval)
    }

    pub fn heartbeat(&self, at: DateTime<Utc>) -> WorkerHeartbeat {
        WorkerHeartbeat {
            worker_id: self.worker_id.clone(),
            cycles_completed: self.cycles_completed,
            records_saved: self.totals.saved,
            baseline_accuracy: self.accuracy.baseline_accuracy(),
            hybrid_accuracy: self.accuracy.hybrid_accuracy(),
            last_heartbeat_at: at,
        }
    }
}

/// True once shutdown was requested or its sender is gone.
fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct Scheduler {
    pipeline: Pipeline,
    status: Arc<dyn StatusSink>,
    config: ScheduleConfig,
    rotation: RotationState,
    state: WorkerState,
    snapshots: watch::Sender<WorkerState>,
}

impl Scheduler {
    pub fn new(
        worker_id: impl Into<String>,
        pipeline: Pipeline,
        status: Arc<dyn StatusSink>,
        config: ScheduleConfig,
    ) -> Self {
        let mut state = WorkerState::new(worker_id);
        state.accuracy = pipeline.accuracy();
        let (snapshots, _) = watch::channel(state.clone());
        Self {
            pipeline,
            status,
            config,
            rotation: RotationState::new(),
            state,
            snapshots,
        }
    }

    /// Live view of the worker state, updated at every phase change that the
    /// scheduler observes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.snapshots.subscribe()
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Loops until `shutdown` flips to `true` (or its sender is dropped). The
    /// ledger is flushed before returning, whatever the last cycle did.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<WorkerState> {
        info!(worker_id = %self.state.worker_id, "worker starting");
        self.run_loop(&mut shutdown).await;

        self.set_phase(CyclePhase::Idle);
        self.pipeline
            .flush_ledger()
            .await
            .context("flushing dedup ledger on shutdown")?;
        info!(
            worker_id = %self.state.worker_id,
            cycles = self.state.cycles_completed,
            saved = self.state.totals.saved,
            ledger_entries = self.pipeline.ledger().len(),
            "worker stopped"
        );
        Ok(self.state)
    }

    async fn run_loop(&mut self, shutdown: &mut watch::Receiver<bool>) {
        let grace = self.config.shutdown_grace;
        loop {
            if shutdown_requested(shutdown) {
                break;
            }

            let started = Instant::now();
            self.set_phase(CyclePhase::Fetching);
            let mut stopping = false;
            let outcome = {
                let cycle = self.pipeline.run_cycle(&mut self.rotation);
                tokio::pin!(cycle);
                tokio::select! {
                    result = &mut cycle => Some(result),
                    _ = wait_for_shutdown(shutdown) => {
                        stopping = true;
                        info!(grace_secs = grace.as_secs(), "shutdown requested, letting cycle finish");
                        match tokio::time::timeout(grace, &mut cycle).await {
                            Ok(result) => Some(result),
                            Err(_) => {
                                warn!("cycle did not finish within the shutdown grace period");
                                None
                            }
                        }
                    }
                }
            };
            let Some(outcome) = outcome else {
                break;
            };

            let delay = match outcome {
                Ok(report) => {
                    self.on_success(&report).await;
                    self.config.adaptive_rest(started.elapsed())
                }
                Err(err) => self.on_failure(&err).await,
            };

            if stopping || shutdown_requested(shutdown) {
                break;
            }
            self.set_phase(CyclePhase::Resting);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(shutdown) => break,
            }
        }
    }

    async fn on_success(&mut self, report: &CycleReport) {
        self.set_phase(CyclePhase::Reporting);
        self.state
            .record_success(report, self.pipeline.accuracy(), Utc::now());

        if self.state.cycles_completed % self.config.report_every_cycles.max(1) == 0 {
            let interval = self.state.take_interval();
            info!(
                worker_id = %self.state.worker_id,
                cycles = self.state.cycles_completed,
                fetched = interval.fetched,
                saved = interval.saved,
                baseline_correct = interval.baseline_correct,
                hybrid_correct = interval.hybrid_correct,
                conflicts = interval.conflicts,
                dropped = interval.dropped(),
                "status report"
            );
        }
        self.send_heartbeat().await;
    }

    /// Returns the backoff to wait before the next attempt.
    async fn on_failure(&mut self, err: &CycleError) -> Duration {
        self.state.record_failure(err, Utc::now());
        let backoff = self.config.failure_backoff(self.state.consecutive_failures);
        warn!(
            worker_id = %self.state.worker_id,
            error = %err,
            consecutive_failures = self.state.consecutive_failures,
            backoff_secs = backoff.as_secs_f64(),
            "cycle aborted"
        );
        if let Err(err) = self.pipeline.flush_ledger().await {
            warn!(error = %err, "ledger flush after failed cycle");
        }
        self.send_heartbeat().await;
        backoff
    }

    async fn send_heartbeat(&mut self) {
        let heartbeat = self.state.heartbeat(Utc::now());
        if let Err(err) = self.status.upsert_heartbeat(&heartbeat).await {
            warn!(worker_id = %heartbeat.worker_id, error = %err, "heartbeat upsert failed");
        }
        self.publish();
    }

    fn set_phase(&mut self, phase: CyclePhase) {
        self.pipeline.set_phase(phase);
        self.state.phase = phase;
        self.publish();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.state.clone());
    }
}
