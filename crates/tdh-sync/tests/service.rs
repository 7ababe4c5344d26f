mod common;

use std::sync::Arc;

use common::{catalogue_tag, rules, Behaviour, ScriptedChannel, RECORD_TYPE, SOURCE};
use serde_json::json;
use tdh_storage::{DocumentStore, InMemoryDocumentStore, InMemoryTagCatalogue};
use tdh_sync::config::load_source_registry;
use tdh_sync::report::report_daily_markdown;
use tdh_sync::service::http_client;
use tdh_sync::{CancelFlag, ChannelRegistry, SyncConfig, SyncService};

const SOURCES: &str = r#"
sources:
  - source_id: suedtirolwein
    display_name: Suedtirol Wein
    enabled: true
    record_type: odhactivitypoi
    feed_kind: closed
    remove_missing: true
    location:
      mode: fixture
      path: fixtures/suedtirolwein/sample.json
  - source_id: dormant
    display_name: Dormant feed
    enabled: false
    record_type: event
    location:
      mode: fixture
      path: fixtures/dormant/sample.json
"#;

fn write_feed(root: &std::path::Path, ids: &[&str]) {
    let dir = root.join("fixtures").join(SOURCE);
    std::fs::create_dir_all(&dir).expect("fixture dir");
    let items = ids
        .iter()
        .map(|id| json!({ "Id": id, "TagIds": ["t1"] }))
        .collect::<Vec<_>>();
    std::fs::write(
        dir.join("sample.json"),
        json!({
            "fixture_id": "wine",
            "captured_from_url": "https://example.org/wine",
            "fetched_at": "2026-02-24T12:00:00Z",
            "items": items,
        })
        .to_string(),
    )
    .expect("write fixture");
}

#[tokio::test]
async fn run_once_imports_enabled_sources_and_writes_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("sources.yaml"), SOURCES).expect("sources");
    write_feed(dir.path(), &["w1", "w2"]);

    let config = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let marketplace = ScriptedChannel::new("idm-marketplace", Behaviour::Accept);
    let mut channels = ChannelRegistry::new();
    channels.register(marketplace.clone());
    let store = Arc::new(InMemoryDocumentStore::new());
    let sources = load_source_registry(dir.path()).await.expect("registry");
    let http = http_client(&config).expect("http");

    let service = SyncService::with_parts(
        config,
        sources,
        store.clone(),
        Arc::new(InMemoryTagCatalogue::new([catalogue_tag("t1", "Wine")])),
        channels,
        rules(&["idm-marketplace"]),
        http,
    )
    .await
    .expect("service");

    let summary = service.run_once(&CancelFlag::new()).await.expect("run");
    assert!(summary.success());
    assert_eq!(summary.sources.len(), 1);
    assert_eq!(summary.sources[0].outcome.result.created, 2);
    assert_eq!(marketplace.received().len(), 2);

    let stored = store.get("W1").await.expect("get").expect("row");
    assert_eq!(stored.record_type(), RECORD_TYPE);
    assert_eq!(stored.published_on, vec!["idm-marketplace"]);
    assert!(stored.raw_data_id.is_some());

    let reports_dir = std::path::PathBuf::from(&summary.reports_dir);
    assert!(reports_dir.join("update_result.json").exists());
    assert!(reports_dir.join("summary.md").exists());
    assert!(reports_dir.join("snapshots/record_outcomes.parquet").exists());
    assert!(std::path::Path::new(&summary.parquet_manifest).exists());

    // closed feed: missing records are disabled, not removed
    write_feed(dir.path(), &["w1"]);
    let second = service.sync_source(SOURCE, &CancelFlag::new()).await.expect("sync");
    assert_eq!((second.outcome.result.updated, second.outcome.result.deleted), (1, 0));
    let disabled = store.get("W2").await.expect("get").expect("row kept");
    assert!(!disabled.active);

    assert!(service.sync_source("dormant", &CancelFlag::new()).await.is_err());
    assert!(service.sync_source("nope", &CancelFlag::new()).await.is_err());
    assert!(service.retry_queue().await.expect("queue").is_empty());

    let daily = report_daily_markdown(5, Some(dir.path().to_path_buf())).expect("daily");
    assert!(daily.contains(&summary.run_id.to_string()));
}
