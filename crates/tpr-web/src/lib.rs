//! Read-only status server for the heartbeat monitor.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tpr_storage::AccuracyLedger;
use tpr_sync::{CyclePhase, CycleStats, WorkerState};
use tracing::info;

pub const CRATE_NAME: &str = "tpr-web";

#[derive(Clone)]
pub struct StatusState {
    worker: watch::Receiver<WorkerState>,
}

impl StatusState {
    /// Follows a running scheduler.
    pub fn live(worker: watch::Receiver<WorkerState>) -> Self {
        Self { worker }
    }

    /// Serves a snapshot that never changes, for monitoring without a worker.
    pub fn fixed(state: WorkerState) -> Self {
        let (_, worker) = watch::channel(state);
        Self { worker }
    }

    fn snapshot(&self) -> WorkerState {
        self.worker.borrow().clone()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub worker_id: String,
    pub phase: CyclePhase,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
    pub records_saved: u64,
    pub totals: CycleStats,
    pub last_error: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub seconds_since_last_cycle: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccuracyView {
    pub total: u64,
    pub baseline_correct: u64,
    pub hybrid_correct: u64,
    pub baseline_accuracy: f64,
    pub hybrid_accuracy: f64,
}

impl From<AccuracyLedger> for AccuracyView {
    fn from(ledger: AccuracyLedger) -> Self {
        Self {
            total: ledger.total,
            baseline_correct: ledger.baseline_correct,
            hybrid_correct: ledger.hybrid_correct,
            baseline_accuracy: ledger.baseline_accuracy(),
            hybrid_accuracy: ledger.hybrid_accuracy(),
        }
    }
}

pub fn app(state: StatusState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/accuracy", get(accuracy_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(bind: &str, state: StatusState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind = %listener.local_addr()?, "status server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<Arc<StatusState>>) -> Json<StatusView> {
    let worker = state.snapshot();
    let seconds_since_last_cycle = worker
        .last_cycle_at
        .map(|at| (Utc::now() - at).num_seconds());
    Json(StatusView {
        worker_id: worker.worker_id,
        phase: worker.phase,
        cycles_completed: worker.cycles_completed,
        cycles_failed: worker.cycles_failed,
        consecutive_failures: worker.consecutive_failures,
        records_saved: worker.totals.saved,
        totals: worker.totals,
        last_error: worker.last_error,
        last_cycle_at: worker.last_cycle_at,
        seconds_since_last_cycle,
    })
}

async fn accuracy_handler(State(state): State<Arc<StatusState>>) -> Json<AccuracyView> {
    Json(state.snapshot().accuracy.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn worker() -> WorkerState {
        let mut state = WorkerState::new("worker-7");
        state.cycles_completed = 3;
        state.totals.saved = 12;
        state.accuracy = AccuracyLedger {
            total: 12,
            baseline_correct: 6,
            hybrid_correct: 9,
        };
        state
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE].to_str().unwrap(),
            "application/json"
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let resp = app(StatusState::fixed(worker()))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn status_reports_worker_snapshot() {
        let json = get_json(app(StatusState::fixed(worker())), "/status").await;
        assert_eq!(json["worker_id"], "worker-7");
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["cycles_completed"], 3);
        assert_eq!(json["records_saved"], 12);
        assert!(json["last_cycle_at"].is_null());
    }

    #[tokio::test]
    async fn accuracy_reports_both_predictors() {
        let json = get_json(app(StatusState::fixed(worker())), "/accuracy").await;
        assert_eq!(json["total"], 12);
        assert_eq!(json["baseline_accuracy"], 0.5);
        assert_eq!(json["hybrid_accuracy"], 0.75);
    }

    #[tokio::test]
    async fn live_state_follows_updates() {
        let (tx, rx) = watch::channel(WorkerState::new("worker-live"));
        let app = app(StatusState::live(rx));

        let mut next = worker();
        next.worker_id = "worker-live".into();
        next.phase = CyclePhase::Resting;
        tx.send_replace(next);

        let json = get_json(app, "/status").await;
        assert_eq!(json["phase"], "resting");
        assert_eq!(json["cycles_completed"], 3);
    }
}
