//! Shared fixtures for the worker integration tests.

pub mod log_capture;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tpr_adapters::{AdapterPolicy, FixtureAdapter, LichessAdapter, SourceAdapter};
use tpr_core::Prediction;
use tpr_storage::{FetchError, FetchedResponse, ResultSink, SinkError, Upstream};

pub fn sample_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/games/sample.json")
}

pub fn fixture_adapter() -> Arc<dyn SourceAdapter> {
    Arc::new(FixtureAdapter::load(sample_fixture(), AdapterPolicy::default()).unwrap())
}

/// A remote source whose every identity is unknown upstream.
pub fn vanished_lichess() -> Arc<dyn SourceAdapter> {
    Arc::new(
        LichessAdapter::new(
            vec!["ghost-1".into(), "ghost-2".into(), "ghost-3".into()],
            AdapterPolicy::default(),
        )
        .with_base_url("http://upstream.invalid"),
    )
}

/// Answers 404 to everything.
pub struct NotFoundUpstream;

#[async_trait]
impl Upstream for NotFoundUpstream {
    async fn get(
        &self,
        _source_id: &str,
        url: &str,
        _accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        Err(FetchError::NotFound {
            url: url.to_string(),
        })
    }
}

/// A result store that is down.
pub struct UnreachableSink;

#[async_trait]
impl ResultSink for UnreachableSink {
    async fn save(&self, _prediction: &Prediction) -> Result<bool, SinkError> {
        Err(SinkError::Unavailable("connection refused".into()))
    }

    async fn load_all(&self) -> Result<Vec<Prediction>, SinkError> {
        Err(SinkError::Unavailable("connection refused".into()))
    }
}
