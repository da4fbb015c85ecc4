//! Idempotent prediction storage, accuracy bookkeeping and worker heartbeats.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tpr_core::{Classification, Prediction, RecordId};
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row for {record_id} is invalid: {reason}")]
    Decode { record_id: String, reason: String },
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

/// Connection-level failures become `Unavailable`; everything else is a
/// database error against a reachable server.
impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => SinkError::Unavailable(err.to_string()),
            other => SinkError::Database(other),
        }
    }
}

/// Stores predictions keyed by record id. A repeated save for an id that is
/// already stored is a no-op reported as `Ok(false)`, never an error.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn save(&self, prediction: &Prediction) -> Result<bool, SinkError>;

    async fn load_all(&self) -> Result<Vec<Prediction>, SinkError>;
}

#[derive(Debug, Default)]
pub struct MemoryResultSink {
    rows: Mutex<BTreeMap<String, Prediction>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, id: &RecordId) -> Option<Prediction> {
        self.rows.lock().await.get(id.storage_key()).cloned()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn save(&self, prediction: &Prediction) -> Result<bool, SinkError> {
        let mut rows = self.rows.lock().await;
        let key = prediction.record_id.storage_key().to_string();
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, prediction.clone());
        Ok(true)
    }

    async fn load_all(&self) -> Result<Vec<Prediction>, SinkError> {
        Ok(self.rows.lock().await.values().cloned().collect())
    }
}

/// Postgres-backed sink; the primary key on `record_id` is what keeps
/// concurrent workers from storing a record twice.
#[derive(Debug, Clone)]
pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub async fn connect(database_url: &str) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("applied prediction store migrations");
        Ok(())
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    async fn save(&self, prediction: &Prediction) -> Result<bool, SinkError> {
        let result = sqlx::query(
            r#"
            INSERT INTO predictions (
                record_id, record_qualified_id, checkpoint_hash,
                baseline_class, baseline_confidence,
                hybrid_class, hybrid_confidence,
                archetype_tag, overrule_reason, actual_outcome,
                baseline_correct, hybrid_correct
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (record_id) DO NOTHING
            "#,
        )
        .bind(prediction.record_id.storage_key())
        .bind(prediction.record_id.qualified())
        .bind(&prediction.checkpoint_hash)
        .bind(prediction.baseline_class.as_str())
        .bind(prediction.baseline_confidence)
        .bind(prediction.hybrid_class.as_str())
        .bind(prediction.hybrid_confidence)
        .bind(&prediction.archetype_tag)
        .bind(prediction.overrule_reason.as_deref())
        .bind(prediction.actual_outcome.as_str())
        .bind(prediction.baseline_correct)
        .bind(prediction.hybrid_correct)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn load_all(&self) -> Result<Vec<Prediction>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT record_id, record_qualified_id, checkpoint_hash,
                   baseline_class, baseline_confidence,
                   hybrid_class, hybrid_confidence,
                   archetype_tag, overrule_reason, actual_outcome,
                   baseline_correct, hybrid_correct
              FROM predictions
             ORDER BY record_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(prediction_from_row).collect()
    }
}

/// The source is whatever the qualified column adds in front of the raw id.
fn record_id_from_columns(raw: &str, qualified: Option<&str>) -> RecordId {
    let source = qualified
        .and_then(|q| q.strip_suffix(raw))
        .and_then(|prefix| prefix.strip_suffix('_'))
        .filter(|source| !source.is_empty());
    match source {
        Some(source) => RecordId::new(source, raw),
        None => RecordId::raw_only(raw),
    }
}

fn prediction_from_row(row: &PgRow) -> Result<Prediction, SinkError> {
    let raw: String = row.try_get("record_id")?;
    let qualified: Option<String> = row.try_get("record_qualified_id")?;
    let record_id = record_id_from_columns(&raw, qualified.as_deref());

    let class = |column: &str| -> Result<Classification, SinkError> {
        let text: String = row.try_get(column)?;
        Classification::parse(&text).ok_or_else(|| SinkError::Decode {
            record_id: raw.clone(),
            reason: format!("{column}={text}"),
        })
    };

    Ok(Prediction {
        checkpoint_hash: row.try_get("checkpoint_hash")?,
        baseline_class: class("baseline_class")?,
        baseline_confidence: row.try_get("baseline_confidence")?,
        hybrid_class: class("hybrid_class")?,
        hybrid_confidence: row.try_get("hybrid_confidence")?,
        archetype_tag: row.try_get("archetype_tag")?,
        overrule_reason: row.try_get("overrule_reason")?,
        actual_outcome: class("actual_outcome")?,
        baseline_correct: row.try_get("baseline_correct")?,
        hybrid_correct: row.try_get("hybrid_correct")?,
        record_id,
    })
}

/// Running accuracy of baseline vs hybrid predictions. Only confirmed inserts
/// are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyLedger {
    pub total: u64,
    pub baseline_correct: u64,
    pub hybrid_correct: u64,
}

impl AccuracyLedger {
    pub fn from_predictions<'a>(predictions: impl IntoIterator<Item = &'a Prediction>) -> Self {
        let mut ledger = Self::default();
        for prediction in predictions {
            ledger.record(prediction);
        }
        ledger
    }

    pub fn record(&mut self, prediction: &Prediction) {
        self.total += 1;
        if prediction.baseline_correct {
            self.baseline_correct += 1;
        }
        if prediction.hybrid_correct {
            self.hybrid_correct += 1;
        }
    }

    pub fn baseline_accuracy(&self) -> f64 {
        ratio(self.baseline_correct, self.total)
    }

    pub fn hybrid_accuracy(&self) -> f64 {
        ratio(self.hybrid_correct, self.total)
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub cycles_completed: u64,
    pub records_saved: u64,
    pub baseline_accuracy: f64,
    pub hybrid_accuracy: f64,
    pub last_heartbeat_at: DateTime<Utc>,
}

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), SinkError>;
}

#[async_trait]
impl StatusSink for PgResultSink {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (
                worker_id, cycles_completed, records_saved,
                baseline_accuracy, hybrid_accuracy, last_heartbeat_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (worker_id) DO UPDATE
               SET cycles_completed = EXCLUDED.cycles_completed,
                   records_saved = EXCLUDED.records_saved,
                   baseline_accuracy = EXCLUDED.baseline_accuracy,
                   hybrid_accuracy = EXCLUDED.hybrid_accuracy,
                   last_heartbeat_at = EXCLUDED.last_heartbeat_at
            "#,
        )
        .bind(&heartbeat.worker_id)
        .bind(heartbeat.cycles_completed as i64)
        .bind(heartbeat.records_saved as i64)
        .bind(heartbeat.baseline_accuracy)
        .bind(heartbeat.hybrid_accuracy)
        .bind(heartbeat.last_heartbeat_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Heartbeat sink for workers running without a database.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), SinkError> {
        info!(
            worker_id = %heartbeat.worker_id,
            cycles = heartbeat.cycles_completed,
            saved = heartbeat.records_saved,
            baseline_accuracy = heartbeat.baseline_accuracy,
            hybrid_accuracy = heartbeat.hybrid_accuracy,
            "heartbeat"
        );
        Ok(())
    }
}

/// Keeps the latest heartbeat per worker.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    latest: Mutex<BTreeMap<String, WorkerHeartbeat>>,
}

impl MemoryStatusSink {
    pub async fn latest(&self, worker_id: &str) -> Option<WorkerHeartbeat> {
        self.latest.lock().await.get(worker_id).cloned()
    }
}

#[async_trait]
impl StatusSink for MemoryStatusSink {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), SinkError> {
        self.latest
            .lock()
            .await
            .insert(heartbeat.worker_id.clone(), heartbeat.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tpr_core::ClassifiedOutput;

    fn prediction(id: RecordId, hybrid: Classification) -> Prediction {
        Prediction::new(
            id,
            "0f".repeat(32),
            ClassifiedOutput {
                class: Classification::Draw,
                confidence: 0.4,
            },
            ClassifiedOutput {
                class: hybrid,
                confidence: 0.7,
            },
            "balanced",
            None,
            Classification::White,
        )
    }

    #[tokio::test]
    async fn repeated_saves_store_exactly_one_row() {
        let sink = MemoryResultSink::new();
        let id = RecordId::new("lichess", "dup00001");
        assert!(sink.save(&prediction(id.clone(), Classification::White)).await.unwrap());
        for _ in 0..4 {
            assert!(!sink.save(&prediction(id.clone(), Classification::Black)).await.unwrap());
        }
        assert_eq!(sink.len().await, 1);
        assert_eq!(
            sink.get(&id).await.unwrap().hybrid_class,
            Classification::White,
            "conflicting insert must not update the stored row"
        );
    }

    #[tokio::test]
    async fn raw_and_qualified_forms_share_one_row() {
        let sink = MemoryResultSink::new();
        assert!(sink
            .save(&prediction(RecordId::new("chesscom", "777"), Classification::White))
            .await
            .unwrap());
        assert!(!sink
            .save(&prediction(RecordId::raw_only("777"), Classification::White))
            .await
            .unwrap());
        assert_eq!(sink.len().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_saves_insert_once() {
        let sink = Arc::new(MemoryResultSink::new());
        let id = RecordId::new("lichess", "race0001");

        let a = {
            let sink = sink.clone();
            let p = prediction(id.clone(), Classification::White);
            tokio::spawn(async move { sink.save(&p).await })
        };
        let b = {
            let sink = sink.clone();
            let p = prediction(id.clone(), Classification::White);
            tokio::spawn(async move { sink.save(&p).await })
        };

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(a ^ b, "exactly one insert wins");
        assert_eq!(sink.len().await, 1);
    }

    #[test]
    fn accuracy_ledger_counts_correct_predictions() {
        let mut ledger = AccuracyLedger::default();
        assert_eq!(ledger.hybrid_accuracy(), 0.0);
        ledger.record(&prediction(RecordId::raw_only("a"), Classification::White));
        ledger.record(&prediction(RecordId::raw_only("b"), Classification::Black));
        assert_eq!(ledger.total, 2);
        assert_eq!(ledger.baseline_correct, 0);
        assert_eq!(ledger.hybrid_correct, 1);
        assert!((ledger.hybrid_accuracy() - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn memory_status_sink_keeps_latest_heartbeat() {
        let sink = MemoryStatusSink::default();
        let mut hb = WorkerHeartbeat {
            worker_id: "w1".into(),
            cycles_completed: 1,
            records_saved: 3,
            baseline_accuracy: 0.5,
            hybrid_accuracy: 0.6,
            last_heartbeat_at: Utc::now(),
        };
        sink.upsert_heartbeat(&hb).await.unwrap();
        hb.cycles_completed = 2;
        sink.upsert_heartbeat(&hb).await.unwrap();
        assert_eq!(sink.latest("w1").await.unwrap().cycles_completed, 2);
    }

    #[test]
    fn connection_failures_map_to_unavailable() {
        assert!(matches!(
            SinkError::from(sqlx::Error::PoolTimedOut),
            SinkError::Unavailable(_)
        ));
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            SinkError::from(sqlx::Error::Io(refused)),
            SinkError::Unavailable(_)
        ));
        assert!(matches!(
            SinkError::from(sqlx::Error::RowNotFound),
            SinkError::Database(_)
        ));
    }

    #[test]
    fn stored_columns_rebuild_the_record_id() {
        let id = record_id_from_columns("live_981234", Some("chesscom_live_981234"));
        assert_eq!(id, RecordId::new("chesscom", "live_981234"));
        assert_eq!(
            record_id_from_columns("club_7", None),
            RecordId::raw_only("club_7")
        );
        assert_eq!(
            record_id_from_columns("a1", Some("unrelated")),
            RecordId::raw_only("a1")
        );
    }
}
