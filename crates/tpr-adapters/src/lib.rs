//! Source adapter contract, identity rotation and provider implementations.

use std::collections::HashSet;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tpr_core::{Classification, MoveSource, RatingMeta, RawRecord, RecordId};
use tpr_storage::{
    retry_with_backoff, ExclusionSet, FetchError, FetchedResponse, RetryDisposition, RetryPolicy,
    Upstream,
};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "tpr-adapters";

pub use tpr_core::{CHESSCOM_SOURCE_ID, FIXTURE_SOURCE_ID, LICHESS_SOURCE_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Ok,
    Exhausted,
    RateLimited,
    Unavailable,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Ok => "ok",
            SourceStatus::Exhausted => "exhausted",
            SourceStatus::RateLimited => "rate_limited",
            SourceStatus::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub exclude: &'a ExclusionSet,
    pub limit: usize,
    /// Rotation index to start from; wrapped into the identity pool.
    pub start_identity: usize,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub status: SourceStatus,
    pub next_identity: usize,
    pub identities_tried: usize,
}

impl FetchOutcome {
    pub fn empty(status: SourceStatus, next_identity: usize) -> Self {
        Self {
            records: Vec::new(),
            status,
            next_identity,
            identities_tried: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Failure while pulling one identity's games.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("undecodable payload from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl IdentityError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            IdentityError::Fetch(err) => err.disposition(),
            IdentityError::Decode { .. } => RetryDisposition::AbandonIdentity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterPolicy {
    pub retry: RetryPolicy,
    /// Single pause after an HTTP 429 before moving to the next identity.
    pub rate_limit_pause: Duration,
    /// Records with fewer move tokens never reach the checkpoint and are dropped.
    pub min_record_length: usize,
    /// Games requested per identity.
    pub page_size: usize,
}

impl Default for AdapterPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            rate_limit_pause: Duration::from_secs(10),
            min_record_length: 20,
            page_size: 50,
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Upstream identities (players) this adapter rotates through.
    fn identities(&self) -> &[String];

    /// Upstream faults never surface as `Err`; they are folded into the
    /// outcome's status. `Err` is reserved for misconfiguration.
    async fn fetch_batch(
        &self,
        upstream: &dyn Upstream,
        request: FetchRequest<'_>,
    ) -> Result<FetchOutcome, AdapterError>;
}

/// Applies the exclusion set, the minimum length and the batch limit, and
/// drops duplicates within the batch.
pub fn filter_records(
    records: impl IntoIterator<Item = RawRecord>,
    exclude: &ExclusionSet,
    min_record_length: usize,
    limit: usize,
    seen: &mut HashSet<String>,
    out: &mut Vec<RawRecord>,
) {
    for record in records {
        if out.len() >= limit {
            return;
        }
        if exclude.contains(&record.id) {
            continue;
        }
        let length = record.ply_count();
        if length < min_record_length {
            debug!(record_id = %record.id, length, min_record_length, "dropping short record");
            continue;
        }
        if !seen.insert(record.id.storage_key().to_string()) {
            continue;
        }
        out.push(record);
    }
}

/// Walks the identity pool once starting at `request.start_identity`, applying
/// the 404/429/retry rules to each identity. Stops early once `limit` records
/// have been collected.
pub async fn rotate_identities<F, Fut>(
    source_id: &str,
    identities: &[String],
    policy: &AdapterPolicy,
    request: &FetchRequest<'_>,
    mut fetch_identity: F,
) -> FetchOutcome
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<Vec<RawRecord>, IdentityError>>,
{
    let pool = identities.len();
    if pool == 0 || request.limit == 0 {
        return FetchOutcome::empty(SourceStatus::Exhausted, 0);
    }

    let start = request.start_identity % pool;
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut tried = 0usize;
    let mut rate_limited = false;
    let mut failed = 0usize;

    for step in 0..pool {
        let identity = identities[(start + step) % pool].clone();
        tried += 1;

        let result = retry_with_backoff(
            &policy.retry,
            |err: &IdentityError| err.disposition() == RetryDisposition::Retryable,
            |attempt| {
                if attempt > 0 {
                    debug!(source_id, identity = %identity, attempt, "retrying identity");
                }
                fetch_identity(identity.clone())
            },
        )
        .await;

        match result {
            Ok(batch) => {
                let fetched = batch.len();
                let before = records.len();
                filter_records(
                    batch,
                    request.exclude,
                    policy.min_record_length,
                    request.limit,
                    &mut seen,
                    &mut records,
                );
                debug!(
                    source_id,
                    identity = %identity,
                    fetched,
                    accepted = records.len() - before,
                    "identity batch"
                );
            }
            Err(err) => match err.disposition() {
                RetryDisposition::AbandonIdentity => {
                    info!(source_id, identity = %identity, error = %err, "abandoning identity");
                }
                RetryDisposition::RateLimited => {
                    rate_limited = true;
                    warn!(
                        source_id,
                        identity = %identity,
                        pause_ms = policy.rate_limit_pause.as_millis() as u64,
                        "rate limited, pausing before next identity"
                    );
                    tokio::time::sleep(policy.rate_limit_pause).await;
                }
                RetryDisposition::Retryable => {
                    failed += 1;
                    warn!(source_id, identity = %identity, error = %err, "identity failed after retries");
                }
            },
        }

        if records.len() >= request.limit {
            break;
        }
    }

    let status = if !records.is_empty() {
        SourceStatus::Ok
    } else if rate_limited {
        SourceStatus::RateLimited
    } else if failed == tried {
        SourceStatus::Unavailable
    } else {
        SourceStatus::Exhausted
    };

    FetchOutcome {
        records,
        status,
        next_identity: (start + tried) % pool,
        identities_tried: tried,
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_u32(value: &JsonValue, path: &[&str]) -> Option<u32> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_u64().and_then(|v| u32::try_from(v).ok())
}

fn decode_error(response: &FetchedResponse, reason: impl ToString) -> IdentityError {
    IdentityError::Decode {
        url: response.final_url.clone(),
        reason: reason.to_string(),
    }
}

/// Lichess user game export (NDJSON, one game per line, SAN moves).
#[derive(Debug, Clone)]
pub struct LichessAdapter {
    identities: Vec<String>,
    policy: AdapterPolicy,
    base_url: String,
}

impl LichessAdapter {
    pub fn new(identities: Vec<String>, policy: AdapterPolicy) -> Self {
        Self {
            identities,
            policy,
            base_url: "https://lichess.org".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn games_url(&self, identity: &str) -> String {
        format!(
            "{}/api/games/user/{identity}?max={}&moves=true&clocks=false&evals=false&opening=false",
            self.base_url, self.policy.page_size
        )
    }

    async fn fetch_identity(
        &self,
        upstream: &dyn Upstream,
        identity: String,
    ) -> Result<Vec<RawRecord>, IdentityError> {
        let url = self.games_url(&identity);
        let response = upstream
            .get(LICHESS_SOURCE_ID, &url, Some("application/x-ndjson"))
            .await?;
        parse_lichess_ndjson(&response)
    }
}

/// Parses a Lichess NDJSON export. Non-standard variants and unfinished games
/// are skipped; a line that is not JSON fails the whole payload.
pub fn parse_lichess_ndjson(response: &FetchedResponse) -> Result<Vec<RawRecord>, IdentityError> {
    let text = std::str::from_utf8(&response.body).map_err(|e| decode_error(response, e))?;
    let fetched_at = Utc::now();
    let mut out = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let game: JsonValue = serde_json::from_str(line).map_err(|e| decode_error(response, e))?;
        let Some(id) = json_str(&game, &["id"]) else {
            continue;
        };
        if json_str(&game, &["variant"]).is_some_and(|v| v != "standard") {
            continue;
        }
        let outcome = match json_str(&game, &["winner"]) {
            Some("white") => Classification::White,
            Some("black") => Classification::Black,
            Some(_) => continue,
            None => match json_str(&game, &["status"]) {
                Some("draw" | "stalemate") => Classification::Draw,
                _ => continue,
            },
        };
        let Some(moves) = json_str(&game, &["moves"]) else {
            continue;
        };
        let time_control = match (
            json_u32(&game, &["clock", "initial"]),
            json_u32(&game, &["clock", "increment"]),
        ) {
            (Some(initial), Some(increment)) => Some(format!("{initial}+{increment}")),
            _ => json_str(&game, &["speed"]).map(ToString::to_string),
        };

        out.push(RawRecord {
            id: RecordId::new(LICHESS_SOURCE_ID, id),
            provider_name: LICHESS_SOURCE_ID.to_string(),
            moves: MoveSource::List(moves.split_whitespace().map(ToString::to_string).collect()),
            declared_outcome: outcome,
            rating: RatingMeta {
                white_rating: json_u32(&game, &["players", "white", "rating"]),
                black_rating: json_u32(&game, &["players", "black", "rating"]),
                time_control,
            },
            fetched_at,
        });
    }
    Ok(out)
}

#[async_trait]
impl SourceAdapter for LichessAdapter {
    fn source_id(&self) -> &str {
        LICHESS_SOURCE_ID
    }

    fn identities(&self) -> &[String] {
        &self.identities
    }

    async fn fetch_batch(
        &self,
        upstream: &dyn Upstream,
        request: FetchRequest<'_>,
    ) -> Result<FetchOutcome, AdapterError> {
        Ok(rotate_identities(
            LICHESS_SOURCE_ID,
            &self.identities,
            &self.policy,
            &request,
            |identity| self.fetch_identity(upstream, identity),
        )
        .await)
    }
}

/// Chess.com published-data API: the player's archive list, then the most
/// recent monthly archive (JSON games carrying PGN text).
#[derive(Debug, Clone)]
pub struct ChessComAdapter {
    identities: Vec<String>,
    policy: AdapterPolicy,
    base_url: String,
}

impl ChessComAdapter {
    pub fn new(identities: Vec<String>, policy: AdapterPolicy) -> Self {
        Self {
            identities,
            policy,
            base_url: "https://api.chess.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn archives_url(&self, identity: &str) -> String {
        format!(
            "{}/pub/player/{}/games/archives",
            self.base_url,
            identity.to_ascii_lowercase()
        )
    }

    async fn fetch_identity(
        &self,
        upstream: &dyn Upstream,
        identity: String,
    ) -> Result<Vec<RawRecord>, IdentityError> {
        let archives = upstream
            .get(CHESSCOM_SOURCE_ID, &self.archives_url(&identity), Some("application/json"))
            .await?;
        let Some(latest) = latest_archive(&archives)? else {
            return Ok(Vec::new());
        };
        let games = upstream
            .get(CHESSCOM_SOURCE_ID, &latest, Some("application/json"))
            .await?;
        parse_chesscom_archive(&games)
    }
}

fn latest_archive(response: &FetchedResponse) -> Result<Option<String>, IdentityError> {
    let value: JsonValue =
        serde_json::from_slice(&response.body).map_err(|e| decode_error(response, e))?;
    let archives = value
        .get("archives")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| decode_error(response, "missing archives array"))?;
    Ok(archives
        .iter()
        .filter_map(JsonValue::as_str)
        .max()
        .map(ToString::to_string))
}

fn chesscom_result(result: Option<&str>) -> Option<bool> {
    match result? {
        "win" => Some(true),
        "agreed" | "repetition" | "stalemate" | "insufficient" | "50move"
        | "timevsinsufficient" => Some(false),
        _ => None,
    }
}

/// Parses one monthly archive. Games whose result cannot be classified are skipped.
pub fn parse_chesscom_archive(response: &FetchedResponse) -> Result<Vec<RawRecord>, IdentityError> {
    let value: JsonValue =
        serde_json::from_slice(&response.body).map_err(|e| decode_error(response, e))?;
    let games = value
        .get("games")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| decode_error(response, "missing games array"))?;

    let fetched_at = Utc::now();
    let mut out = Vec::new();
    for game in games {
        if json_str(game, &["rules"]).is_some_and(|r| r != "chess") {
            continue;
        }
        let (Some(url), Some(pgn)) = (json_str(game, &["url"]), json_str(game, &["pgn"])) else {
            continue;
        };
        let Some(id) = url.trim_end_matches('/').rsplit('/').next().filter(|s| !s.is_empty())
        else {
            continue;
        };

        let white = chesscom_result(json_str(game, &["white", "result"]));
        let black = chesscom_result(json_str(game, &["black", "result"]));
        let outcome = match (white, black) {
            (Some(true), _) => Classification::White,
            (_, Some(true)) => Classification::Black,
            (Some(false), Some(false)) => Classification::Draw,
            _ => match pgn_result(pgn) {
                Some(class) => class,
                None => continue,
            },
        };

        out.push(RawRecord {
            id: RecordId::new(CHESSCOM_SOURCE_ID, id),
            provider_name: CHESSCOM_SOURCE_ID.to_string(),
            moves: MoveSource::Annotated(pgn.to_string()),
            declared_outcome: outcome,
            rating: RatingMeta {
                white_rating: json_u32(game, &["white", "rating"]),
                black_rating: json_u32(game, &["black", "rating"]),
                time_control: json_str(game, &["time_control"])
                    .or_else(|| json_str(game, &["time_class"]))
                    .map(ToString::to_string),
            },
            fetched_at,
        });
    }
    Ok(out)
}

/// Reads the `[Result "..."]` tag of a PGN.
pub fn pgn_result(pgn: &str) -> Option<Classification> {
    pgn.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("[Result \""))
        .filter_map(|rest| rest.split('"').next())
        .find_map(Classification::from_pgn_result)
}

#[async_trait]
impl SourceAdapter for ChessComAdapter {
    fn source_id(&self) -> &str {
        CHESSCOM_SOURCE_ID
    }

    fn identities(&self) -> &[String] {
        &self.identities
    }

    async fn fetch_batch(
        &self,
        upstream: &dyn Upstream,
        request: FetchRequest<'_>,
    ) -> Result<FetchOutcome, AdapterError> {
        Ok(rotate_identities(
            CHESSCOM_SOURCE_ID,
            &self.identities,
            &self.policy,
            &request,
            |identity| self.fetch_identity(upstream, identity),
        )
        .await)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureGame {
    pub id: String,
    #[serde(default)]
    pub moves: Option<Vec<String>>,
    #[serde(default)]
    pub pgn: Option<String>,
    pub outcome: Classification,
    #[serde(default)]
    pub white_rating: Option<u32>,
    #[serde(default)]
    pub black_rating: Option<u32>,
    #[serde(default)]
    pub time_control: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    pub source_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub games: Vec<FixtureGame>,
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub fn load_fixture_file(path: impl AsRef<Path>) -> Result<FixtureFile> {
    read_json_file(path)
}

/// Serves games from a captured fixture file without touching the network.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    records: Vec<RawRecord>,
    policy: AdapterPolicy,
    identities: Vec<String>,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, records: Vec<RawRecord>, policy: AdapterPolicy) -> Self {
        let source_id = source_id.into();
        Self {
            identities: vec![source_id.clone()],
            source_id,
            records,
            policy,
        }
    }

    pub fn load(path: impl AsRef<Path>, policy: AdapterPolicy) -> Result<Self> {
        let path = path.as_ref();
        let file = load_fixture_file(path)?;
        let fetched_at = file.captured_at.unwrap_or(DateTime::UNIX_EPOCH);
        let records = file
            .games
            .into_iter()
            .map(|game| fixture_game_to_record(&file.source_id, game, fetched_at))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("converting fixture games in {}", path.display()))?;
        Ok(Self::new(file.source_id, records, policy))
    }

    pub fn records(&self) -> &[RawRecord] {
        &self.records
    }
}

fn fixture_game_to_record(
    source_id: &str,
    game: FixtureGame,
    fetched_at: DateTime<Utc>,
) -> Result<RawRecord> {
    let moves = match (game.moves, game.pgn) {
        (Some(list), _) => MoveSource::List(list),
        (None, Some(pgn)) => MoveSource::Annotated(pgn),
        (None, None) => anyhow::bail!("fixture game {} has neither moves nor pgn", game.id),
    };
    Ok(RawRecord {
        id: RecordId::new(source_id, game.id),
        provider_name: source_id.to_string(),
        moves,
        declared_outcome: game.outcome,
        rating: RatingMeta {
            white_rating: game.white_rating,
            black_rating: game.black_rating,
            time_control: game.time_control,
        },
        fetched_at,
    })
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn identities(&self) -> &[String] {
        &self.identities
    }

    async fn fetch_batch(
        &self,
        _upstream: &dyn Upstream,
        request: FetchRequest<'_>,
    ) -> Result<FetchOutcome, AdapterError> {
        let mut records = Vec::new();
        filter_records(
            self.records.iter().cloned(),
            request.exclude,
            self.policy.min_record_length,
            request.limit,
            &mut HashSet::new(),
            &mut records,
        );
        let status = if records.is_empty() {
            SourceStatus::Exhausted
        } else {
            SourceStatus::Ok
        };
        Ok(FetchOutcome {
            records,
            status,
            next_identity: 0,
            identities_tried: 1,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Lichess,
    Chesscom,
    Fixture,
}

/// Configured source, as read from the worker config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_enabled() -> bool {
    true
}

pub fn adapter_for_source(
    spec: &SourceSpec,
    policy: AdapterPolicy,
) -> Result<Arc<dyn SourceAdapter>> {
    let adapter: Arc<dyn SourceAdapter> = match spec.kind {
        SourceKind::Lichess => {
            let adapter = LichessAdapter::new(spec.identities.clone(), policy);
            Arc::new(match &spec.base_url {
                Some(url) => adapter.with_base_url(url.clone()),
                None => adapter,
            })
        }
        SourceKind::Chesscom => {
            let adapter = ChessComAdapter::new(spec.identities.clone(), policy);
            Arc::new(match &spec.base_url {
                Some(url) => adapter.with_base_url(url.clone()),
                None => adapter,
            })
        }
        SourceKind::Fixture => {
            let path = spec
                .fixture_path
                .as_ref()
                .with_context(|| format!("fixture source {} has no fixture_path", spec.id))?;
            Arc::new(FixtureAdapter::load(path, policy)?)
        }
    };
    Ok(adapter)
}
