use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use jobfeed_core::FixedClock;
use jobfeed_sync::{load_source_registry, run_collect_with, CollectOutcome, PipelineConfig, SyncSettings};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

#[tokio::test]
async fn bundled_registry_parses_with_only_the_fixture_enabled() {
    let registry = load_source_registry(&repo_root().join("sources.yaml"))
        .await
        .expect("registry");
    let enabled = registry
        .sources
        .iter()
        .filter(|s| s.enabled)
        .map(|s| s.source_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(enabled, vec!["sample-fixture"]);
    assert_eq!(registry.sources.len(), 3);
}

#[tokio::test]
async fn bundled_fixture_collects_into_a_sorted_dataset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = repo_root();
    let settings = SyncSettings {
        dataset_path: dir.path().join("jobs.json"),
        retention_days: 30,
        sources_path: root.join("sources.yaml"),
        workspace_root: root,
        user_agent: "jobfeed-test".into(),
        http_timeout_secs: 5,
        scheduler_enabled: false,
        schedule_cron: "0 0 6 * * *".into(),
    };
    let now = Utc.with_ymd_and_hms(2025, 1, 4, 0, 0, 0).single().unwrap();
    let config = PipelineConfig::new(&settings.dataset_path).with_clock(Arc::new(FixedClock(now)));

    let summary = run_collect_with(&settings, &config).await.expect("collect");
    assert_eq!(summary.enabled_sources, 1);
    assert_eq!(summary.fetched_records, 4);

    let CollectOutcome::Saved(dataset) = summary.outcome else {
        panic!("expected a saved dataset");
    };
    let ids = dataset.items.iter().map(|r| r.id.as_str()).collect::<Vec<_>>();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], "9001");
    assert!(ids[1].starts_with("https://www.example.com/posts/7150000000000000002::author-42::"));
    assert_eq!(ids[2], "urn:li:activity:7150000000000000001");
    assert_eq!(
        dataset.items[2].post_date.as_deref(),
        Some("2025-01-01T00:00:00.000Z")
    );
    assert!(dataset.items.iter().all(|r| r.field_str(&["source"]) == Some("Sample Feed")));
}
