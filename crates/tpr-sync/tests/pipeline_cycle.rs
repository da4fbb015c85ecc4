mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{fixture_adapter, log_capture, vanished_lichess, NotFoundUpstream, UnreachableSink};
use tokio::sync::watch;
use tpr_adapters::SourceStatus;
use tpr_storage::{DedupLedger, MemoryResultSink, MemoryStatusSink, ResultSink};
use tpr_sync::{
    CycleError, CyclePhase, Pipeline, PipelineSettings, RotationState, ScheduleConfig, Scheduler,
};
use tracing::Level;

const SAMPLE_PLAYABLE: u64 = 5;

fn pipeline(ledger: DedupLedger, sink: Arc<dyn ResultSink>) -> Pipeline {
    Pipeline::new(
        vec![fixture_adapter()],
        Arc::new(NotFoundUpstream),
        ledger,
        sink,
        PipelineSettings::default(),
    )
}

#[tokio::test]
async fn fallback_chain_keeps_going_when_one_source_is_exhausted() {
    let (logs, _guard) = log_capture::capture();
    let sink = Arc::new(MemoryResultSink::new());
    let mut pipeline = Pipeline::new(
        vec![vanished_lichess(), fixture_adapter()],
        Arc::new(NotFoundUpstream),
        DedupLedger::in_memory(),
        sink.clone(),
        PipelineSettings::default(),
    );
    let mut rotation = RotationState::new();

    let report = pipeline.run_cycle(&mut rotation).await.unwrap();

    assert_eq!(report.stats.fetched, SAMPLE_PLAYABLE);
    assert_eq!(report.sources[0].source_id, "lichess");
    assert_eq!(report.sources[0].status, SourceStatus::Exhausted);
    assert_eq!(report.sources[0].identities_tried, 3);
    assert_eq!(report.sources[1].status, SourceStatus::Ok);
    assert_eq!(report.sources[1].records, 5);
    assert_eq!(
        report.stats.saved + report.stats.too_short + report.stats.unparseable,
        SAMPLE_PLAYABLE
    );
    assert_eq!(sink.len().await as u64, report.stats.saved);
    logs.assert_logged(Level::WARN, "source exhausted", "source_id=lichess");
    assert!(logs.records().iter().all(|r| r.level != Level::ERROR));
}

#[tokio::test]
async fn every_stored_prediction_respects_confidence_bounds() {
    let sink = Arc::new(MemoryResultSink::new());
    let mut pipeline = pipeline(DedupLedger::in_memory(), sink.clone());
    pipeline.run_cycle(&mut RotationState::new()).await.unwrap();

    let stored = sink.load_all().await.unwrap();
    assert!(!stored.is_empty());
    for prediction in stored {
        assert!((0.0..=0.98).contains(&prediction.baseline_confidence));
        assert!((0.0..=0.98).contains(&prediction.hybrid_confidence));
        assert_eq!(prediction.checkpoint_hash.len(), 64);
        assert_eq!(
            prediction.hybrid_correct,
            prediction.hybrid_class == prediction.actual_outcome
        );
    }
}

#[tokio::test]
async fn flushed_ledger_filters_everything_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    let sink = Arc::new(MemoryResultSink::new());

    let mut first = pipeline(DedupLedger::open(&path, 100).await.unwrap(), sink.clone());
    let report = first.run_cycle(&mut RotationState::new()).await.unwrap();
    first.flush_ledger().await.unwrap();
    let stored = sink.len().await;
    assert_eq!(stored as u64, report.stats.saved);
    drop(first);

    let mut second = pipeline(DedupLedger::open(&path, 100).await.unwrap(), sink.clone());
    assert_eq!(second.ledger().len(), SAMPLE_PLAYABLE as usize);
    let err = second.run_cycle(&mut RotationState::new()).await.unwrap_err();
    match err {
        CycleError::SourceExhausted { sources } => {
            assert_eq!(sources.len(), 1);
            assert_eq!(sources[0].status, SourceStatus::Exhausted);
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(sink.len().await, stored);
}

#[tokio::test]
async fn crash_before_flush_replays_into_conflicts_not_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    let sink = Arc::new(MemoryResultSink::new());

    let mut first = pipeline(DedupLedger::open(&path, 100).await.unwrap(), sink.clone());
    let report = first.run_cycle(&mut RotationState::new()).await.unwrap();
    // Dropped without a flush: nothing reached the ledger file.
    drop(first);
    let stored = sink.len().await;

    let mut replay = pipeline(DedupLedger::open(&path, 100).await.unwrap(), sink.clone());
    assert!(replay.ledger().is_empty());
    let replayed = replay.run_cycle(&mut RotationState::new()).await.unwrap();

    assert_eq!(replayed.stats.saved, 0);
    assert_eq!(replayed.stats.conflicts, report.stats.saved);
    assert_eq!(sink.len().await, stored);
    assert_eq!(replay.accuracy().total, 0);
}

#[tokio::test]
async fn concurrent_workers_store_each_record_once() {
    let sink = Arc::new(MemoryResultSink::new());
    let mut a = pipeline(DedupLedger::in_memory(), sink.clone());
    let mut b = pipeline(DedupLedger::in_memory(), sink.clone());
    let mut rotation_a = RotationState::new();
    let mut rotation_b = RotationState::new();

    let (ra, rb) = tokio::join!(a.run_cycle(&mut rotation_a), b.run_cycle(&mut rotation_b));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let stored = sink.len().await as u64;
    assert!(stored > 0);
    assert_eq!(ra.stats.saved + rb.stats.saved, stored);
    assert_eq!(ra.stats.conflicts + rb.stats.conflicts, stored);
    assert_eq!(a.accuracy().total + b.accuracy().total, stored);
}

#[tokio::test]
async fn unreachable_sink_counts_failures_and_leaves_records_retryable() {
    let mut pipeline = pipeline(DedupLedger::in_memory(), Arc::new(UnreachableSink));
    let report = pipeline.run_cycle(&mut RotationState::new()).await.unwrap();

    assert_eq!(report.stats.saved, 0);
    assert!(report.stats.persistence_failures > 0);
    assert_eq!(
        pipeline.ledger().len() as u64,
        report.stats.too_short + report.stats.unparseable
    );
    assert_eq!(pipeline.accuracy().total, 0);
}

#[tokio::test]
async fn unwritable_ledger_file_does_not_abort_the_cycle() {
    let (logs, _guard) = log_capture::capture();
    let dir = tempfile::tempdir().unwrap();
    let blocked = dir.path().join("state");
    let path = blocked.join("ledger.json");
    let sink = Arc::new(MemoryResultSink::new());
    let mut pipeline = pipeline(DedupLedger::open(&path, 1).await.unwrap(), sink.clone());
    // A plain file where the ledger directory should be makes every flush fail.
    std::fs::write(&blocked, b"not a directory").unwrap();

    let report = pipeline.run_cycle(&mut RotationState::new()).await.unwrap();

    assert_eq!(report.stats.saved, SAMPLE_PLAYABLE);
    assert_eq!(sink.len().await as u64, SAMPLE_PLAYABLE);
    assert_eq!(report.stats.ledger_write_failures, SAMPLE_PLAYABLE);
    assert_eq!(pipeline.accuracy().total, SAMPLE_PLAYABLE);
    assert_eq!(pipeline.ledger().len(), SAMPLE_PLAYABLE as usize);
    logs.assert_logged(Level::WARN, "dedup ledger write failed", "record_id=");

    // Once the path is usable again the buffered marks reach disk.
    std::fs::remove_file(&blocked).unwrap();
    pipeline.flush_ledger().await.unwrap();
    let reopened = DedupLedger::open(&path, 1).await.unwrap();
    assert_eq!(reopened.len(), SAMPLE_PLAYABLE as usize);
}

#[tokio::test]
async fn scheduler_backs_off_when_sources_dry_up_and_flushes_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    let sink = Arc::new(MemoryResultSink::new());
    let status = Arc::new(MemoryStatusSink::default());
    let pipeline = pipeline(DedupLedger::open(&path, 1_000).await.unwrap(), sink.clone());
    let scheduler = Scheduler::new(
        "worker-test",
        pipeline,
        status.clone(),
        ScheduleConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(40),
            target_cycle: Duration::from_millis(5),
            min_rest: Duration::from_millis(1),
            shutdown_grace: Duration::from_secs(5),
            report_every_cycles: 1,
        },
    );
    let mut snapshots = scheduler.subscribe();
    let (stop, shutdown) = watch::channel(false);
    let worker = tokio::spawn(scheduler.run(shutdown));

    // First cycle stores the fixture games, later ones find nothing new.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let state = snapshots.borrow_and_update();
                if state.cycles_completed >= 1 && state.consecutive_failures >= 2 {
                    break;
                }
            }
            snapshots.changed().await.unwrap();
        }
    })
    .await
    .expect("worker never reached the backoff state");

    stop.send(true).unwrap();
    let state = worker.await.unwrap().unwrap();

    assert_eq!(state.cycles_completed, 1);
    assert_eq!(state.phase, CyclePhase::Idle);
    assert!(state.last_error.unwrap().contains("no source yielded usable records"));
    assert_eq!(state.totals.saved, sink.len().await as u64);

    let heartbeat = status.latest("worker-test").await.unwrap();
    assert_eq!(heartbeat.cycles_completed, 1);
    assert_eq!(heartbeat.records_saved, state.totals.saved);

    let reopened = DedupLedger::open(&path, 1_000).await.unwrap();
    assert_eq!(reopened.len(), SAMPLE_PLAYABLE as usize);
}
