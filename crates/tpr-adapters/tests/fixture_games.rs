use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tpr_adapters::{
    adapter_for_source, AdapterPolicy, FetchRequest, FixtureAdapter, SourceAdapter, SourceKind,
    SourceSpec, SourceStatus,
};
use tpr_core::{Classification, RecordId};
use tpr_storage::{ExclusionSet, FetchError, FetchedResponse, Upstream};

struct OfflineUpstream;

#[async_trait]
impl Upstream for OfflineUpstream {
    async fn get(
        &self,
        _source_id: &str,
        url: &str,
        _accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        panic!("fixture adapters must not fetch {url}");
    }
}

fn sample_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/games/sample.json")
}

#[tokio::test]
async fn sample_fixture_loads_and_filters_short_games() {
    let adapter = FixtureAdapter::load(sample_fixture(), AdapterPolicy::default()).unwrap();
    assert_eq!(adapter.records().len(), 6);

    let exclude = ExclusionSet::default();
    let outcome = adapter
        .fetch_batch(
            &OfflineUpstream,
            FetchRequest {
                exclude: &exclude,
                limit: 50,
                start_identity: 0,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, SourceStatus::Ok);
    let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.raw()).collect();
    assert!(!ids.contains(&"scholars-mate"));
    assert_eq!(ids.len(), 5);
    assert!(outcome
        .records
        .iter()
        .any(|r| r.id.raw() == "qgd-capablanca" && r.declared_outcome == Classification::Draw));
}

#[tokio::test]
async fn registry_builds_fixture_adapter_and_honours_exclusions() {
    let spec = SourceSpec {
        id: "fixture".into(),
        kind: SourceKind::Fixture,
        enabled: true,
        identities: Vec::new(),
        fixture_path: Some(sample_fixture()),
        base_url: None,
    };
    let adapter = adapter_for_source(&spec, AdapterPolicy::default()).unwrap();
    assert_eq!(adapter.source_id(), "fixture");

    let exclude: ExclusionSet = ["opera-1858", "fixture_ruy-chigorin"]
        .into_iter()
        .map(RecordId::parse)
        .collect();
    let outcome = adapter
        .fetch_batch(
            &OfflineUpstream,
            FetchRequest {
                exclude: &exclude,
                limit: 2,
                start_identity: 0,
            },
        )
        .await
        .unwrap();
    let ids: Vec<&str> = outcome.records.iter().map(|r| r.id.raw()).collect();
    assert_eq!(ids, vec!["najdorf-english-attack", "qgd-capablanca"]);
}

#[test]
fn fixture_source_without_path_is_rejected() {
    let spec = SourceSpec {
        id: "broken".into(),
        kind: SourceKind::Fixture,
        enabled: true,
        identities: Vec::new(),
        fixture_path: None,
        base_url: None,
    };
    assert!(adapter_for_source(&spec, AdapterPolicy::default()).is_err());
}
