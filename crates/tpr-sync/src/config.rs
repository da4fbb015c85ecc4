//! Worker configuration: `tpr.yaml` with environment overrides on top.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tpr_adapters::{AdapterPolicy, SourceKind, SourceSpec};
use tpr_engine::{EvaluatorConfig, PredictorThresholds};
use tpr_storage::{HttpClientConfig, RetryPolicy, TokenBucketConfig};

use crate::pipeline::PipelineSettings;
use crate::scheduler::ScheduleConfig;

pub const DEFAULT_CONFIG_PATH: &str = "tpr.yaml";

/// Highest advantage (in pawns) a threshold may meaningfully name.
const MAX_ADVANTAGE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no enabled sources configured")]
    NoEnabledSources,
    #[error("source {source_id} has an empty identity pool")]
    EmptyIdentityPool { source_id: String },
    #[error("fixture source {source_id} has no fixture_path")]
    MissingFixturePath { source_id: String },
    #[error("source id {source_id} is configured twice")]
    DuplicateSource { source_id: String },
    #[error("{name} must be at least 1")]
    NotPositive { name: &'static str },
    #[error("min_record_length {min_record_length} is below target_ply {target_ply}")]
    RecordLengthBelowTarget {
        min_record_length: usize,
        target_ply: u32,
    },
    #[error("{name} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("backoff base {base_secs}s exceeds cap {cap_secs}s")]
    BackoffRange { base_secs: u64, cap_secs: u64 },
    #[error("DATABASE_URL is required for the postgres sink")]
    MissingDatabaseUrl,
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    pub path: PathBuf,
    /// New marks buffered before the ledger writes itself to disk.
    pub flush_every: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/ledger.json"),
            flush_every: 25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout_secs: u64,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    /// Request budget shared by every source; unset means unthrottled.
    pub requests_per_minute: Option<u32>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: "tpr-worker/0.1".to_string(),
            timeout_secs: 20,
            global_concurrency: 8,
            per_source_concurrency: 2,
            requests_per_minute: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: usize,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub rate_limit_pause_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_secs: 2,
            max_delay_secs: 8,
            rate_limit_pause_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub target_cycle_secs: u64,
    pub min_rest_secs: u64,
    pub shutdown_grace_secs: u64,
    pub report_every_cycles: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            backoff_base_secs: 30,
            backoff_cap_secs: 300,
            target_cycle_secs: 120,
            min_rest_secs: 10,
            shutdown_grace_secs: 30,
            report_every_cycles: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub target_ply: u32,
    pub min_record_length: usize,
    pub enhanced_signature: bool,
    /// Records requested from each source per cycle.
    pub batch_limit: usize,
    /// Sources fetched in parallel within one cycle.
    pub fetch_concurrency: usize,
    pub sink: SinkKind,
    #[serde(skip_serializing)]
    pub database_url: Option<String>,
    pub status_bind: Option<String>,
    pub reports_dir: PathBuf,
    pub ledger: LedgerSettings,
    pub http: HttpSettings,
    pub retry: RetrySettings,
    pub schedule: ScheduleSettings,
    pub evaluator: EvaluatorConfig,
    pub predictor: PredictorThresholds,
    pub sources: Vec<SourceSpec>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "tpr-worker-1".to_string(),
            target_ply: 20,
            min_record_length: 20,
            enhanced_signature: false,
            batch_limit: 25,
            fetch_concurrency: 4,
            sink: SinkKind::Memory,
            database_url: None,
            status_bind: None,
            reports_dir: PathBuf::from("./reports"),
            ledger: LedgerSettings::default(),
            http: HttpSettings::default(),
            retry: RetrySettings::default(),
            schedule: ScheduleSettings::default(),
            evaluator: EvaluatorConfig::default(),
            predictor: PredictorThresholds::default(),
            sources: Vec::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(raw).context("parsing worker config")
    }

    /// Reads a config file. Relative fixture paths are resolved against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        if let Some(base) = path.parent() {
            for source in &mut config.sources {
                let resolved = source
                    .fixture_path
                    .as_ref()
                    .filter(|p| p.is_relative())
                    .map(|p| base.join(p));
                if resolved.is_some() {
                    source.fixture_path = resolved;
                }
            }
        }
        Ok(config)
    }

    /// `TPR_CONFIG` (default `tpr.yaml`), then environment overrides, then
    /// validation. Any failure here is fatal to the worker.
    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("TPR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_with_env(path)
    }

    pub fn load_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(worker_id) = var("TPR_WORKER_ID") {
            self.worker_id = worker_id;
        }
        if let Some(path) = var("TPR_LEDGER_PATH") {
            self.ledger.path = PathBuf::from(path);
        }
        if let Some(value) = var("TPR_TARGET_PLY") {
            self.target_ply = parse_env("TPR_TARGET_PLY", value)?;
        }
        if let Some(value) = var("TPR_ENHANCED_SIGNATURE") {
            self.enhanced_signature = parse_flag("TPR_ENHANCED_SIGNATURE", value)?;
        }
        if let Some(user_agent) = var("TPR_USER_AGENT") {
            self.http.user_agent = user_agent;
        }
        if let Some(value) = var("TPR_HTTP_TIMEOUT_SECS") {
            self.http.timeout_secs = parse_env("TPR_HTTP_TIMEOUT_SECS", value)?;
        }
        if let Some(bind) = var("TPR_STATUS_BIND") {
            self.status_bind = Some(bind).filter(|b| !b.trim().is_empty());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled: Vec<&SourceSpec> = self.enabled_sources().collect();
        if enabled.is_empty() {
            return Err(ConfigError::NoEnabledSources);
        }
        let mut ids = HashSet::new();
        for source in &enabled {
            if !ids.insert(source.id.as_str()) {
                return Err(ConfigError::DuplicateSource {
                    source_id: source.id.clone(),
                });
            }
            match source.kind {
                SourceKind::Lichess | SourceKind::Chesscom if source.identities.is_empty() => {
                    return Err(ConfigError::EmptyIdentityPool {
                        source_id: source.id.clone(),
                    });
                }
                SourceKind::Fixture if source.fixture_path.is_none() => {
                    return Err(ConfigError::MissingFixturePath {
                        source_id: source.id.clone(),
                    });
                }
                _ => {}
            }
        }

        if self.target_ply == 0 {
            return Err(ConfigError::NotPositive { name: "target_ply" });
        }
        if self.min_record_length < self.target_ply as usize {
            return Err(ConfigError::RecordLengthBelowTarget {
                min_record_length: self.min_record_length,
                target_ply: self.target_ply,
            });
        }
        for (name, value) in [
            ("batch_limit", self.batch_limit as u64),
            ("fetch_concurrency", self.fetch_concurrency as u64),
            ("ledger.flush_every", self.ledger.flush_every as u64),
            ("schedule.report_every_cycles", self.schedule.report_every_cycles),
        ] {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        if self.schedule.backoff_base_secs > self.schedule.backoff_cap_secs {
            return Err(ConfigError::BackoffRange {
                base_secs: self.schedule.backoff_base_secs,
                cap_secs: self.schedule.backoff_cap_secs,
            });
        }

        let e = &self.evaluator;
        let p = &self.predictor;
        within("evaluator.decisive_margin", e.decisive_margin, f64::EPSILON, MAX_ADVANTAGE)?;
        within("evaluator.confidence_floor", e.confidence_floor, 0.0, 0.98)?;
        within("evaluator.confidence_ceiling", e.confidence_ceiling, e.confidence_floor, 1.0)?;
        within("evaluator.confidence_scale", e.confidence_scale, f64::EPSILON, MAX_ADVANTAGE)?;
        within("evaluator.confidence_cap", e.confidence_cap, 0.0, 0.98)?;
        within("predictor.closeness", p.closeness, 0.0, MAX_ADVANTAGE)?;
        within("predictor.override_threshold", p.override_threshold, 0.0, 1.0)?;
        within("predictor.override_base", p.override_base, 0.0, 0.98)?;
        within("predictor.override_gain", p.override_gain, 0.0, 10.0)?;
        within("predictor.agreement_boost", p.agreement_boost, 0.0, 0.5)?;
        within("predictor.draw_bias_max", p.draw_bias_max, 0.0, 1.0)?;
        within("predictor.draw_advantage_max", p.draw_advantage_max, 0.0, MAX_ADVANTAGE)?;
        within("predictor.draw_tension_min", p.draw_tension_min, 0.0, 1.0)?;
        within("predictor.draw_confidence", p.draw_confidence, 0.0, 0.98)?;
        within("predictor.confidence_cap", p.confidence_cap, 0.0, 0.98)?;
        within("predictor.archetype_min_skew", p.archetype_min_skew, 0.0, 8.0)?;

        if self.sink == SinkKind::Postgres && self.database_url.is_none() {
            return Err(ConfigError::MissingDatabaseUrl);
        }
        Ok(())
    }

    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceSpec> {
        self.sources.iter().filter(|s| s.enabled)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            base_delay: Duration::from_secs(self.retry.base_delay_secs),
            max_delay: Duration::from_secs(self.retry.max_delay_secs),
        }
    }

    pub fn adapter_policy(&self) -> AdapterPolicy {
        AdapterPolicy {
            retry: self.retry_policy(),
            rate_limit_pause: Duration::from_secs(self.retry.rate_limit_pause_secs),
            min_record_length: self.min_record_length,
            ..AdapterPolicy::default()
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http.timeout_secs),
            user_agent: Some(self.http.user_agent.clone()),
            global_concurrency: self.http.global_concurrency,
            per_source_concurrency: self.http.per_source_concurrency,
            token_bucket: self
                .http
                .requests_per_minute
                .filter(|rpm| *rpm > 0)
                .map(|rpm| TokenBucketConfig {
                    capacity: rpm,
                    refill_every: Duration::from_millis(60_000 / u64::from(rpm)),
                }),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            target_ply: self.target_ply,
            batch_limit: self.batch_limit,
            fetch_concurrency: self.fetch_concurrency,
        }
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        let s = &self.schedule;
        ScheduleConfig {
            backoff_base: Duration::from_secs(s.backoff_base_secs),
            backoff_cap: Duration::from_secs(s.backoff_cap_secs),
            target_cycle: Duration::from_secs(s.target_cycle_secs),
            min_rest: Duration::from_secs(s.min_rest_secs),
            shutdown_grace: Duration::from_secs(s.shutdown_grace_secs),
            report_every_cycles: s.report_every_cycles,
        }
    }
}

fn within(name: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        })
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

fn parse_flag(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" | "on" => Ok(true),
        "0" | "false" | "FALSE" | "False" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { key, value }),
    }
}
