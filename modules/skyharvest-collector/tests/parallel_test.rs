//! Integration test: parallel collection across identities and time windows.
//!
//! Each worker authenticates through `MockConnector`, collects its own window
//! and writes worker-scoped artifacts; the orchestrator merges them into one
//! corpus and one registry update.

use std::collections::BTreeSet;
use std::sync::Arc;

use skyharvest_collector::testing::{identity, post_at, MockConnector, MockPlatform};
use skyharvest_collector::{partition, HarvestDeps, Orchestrator};
use skyharvest_common::{parse_timestamp, CollectorSettings, PartitionStrategy, Target};

fn dated_posts() -> Vec<bsky_client::PostView> {
    [
        ("d1", "2024-02-01T12:00:00Z"),
        ("d2", "2024-02-02T12:00:00Z"),
        ("d3", "2024-02-03T12:00:00Z"),
        ("d4", "2024-02-04T12:00:00Z"),
    ]
    .into_iter()
    .map(|(rkey, at)| post_at("did:plc:a", "a.test", rkey, at))
    .collect()
}

fn deps(dir: &std::path::Path) -> HarvestDeps {
    HarvestDeps::for_data_dir(dir, CollectorSettings::default())
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overlapping_windows_merge_without_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().on_search("rust", dated_posts()));
    let connector = Arc::new(MockConnector::new(platform));
    let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];
    let (start, end) = (
        parse_timestamp("2024-02-01").unwrap(),
        parse_timestamp("2024-02-05").unwrap(),
    );
    // 3-day windows sharing 2 days: [02-01, 02-04) and [02-02, 02-05)
    let windows = partition(start, end, 2, &PartitionStrategy::Overlap { percent: 50.0 });

    let result = Orchestrator::new(connector.clone(), deps(dir.path()))
        .run_parallel(&Target::keyword("rust"), 0, &identities, &windows)
        .await
        .unwrap();

    assert!(result.errors.is_empty());
    assert_eq!(result.stats.items_collected, 6);
    assert_eq!(result.items.len(), 4);
    let unique: BTreeSet<_> = result.items.iter().map(|i| i.uri.as_str()).collect();
    assert_eq!(unique.len(), result.items.len());
    assert_eq!(connector.connected().len(), 2);

    let merged = result.final_path.unwrap();
    assert!(merged.ends_with("keywords/search_rust_2024-02-01_to_2024-02-05.json"));
    assert!(merged.exists());
    let leftovers: Vec<_> = std::fs::read_dir(merged.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains("_worker_"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[tokio::test]
async fn merged_participants_reach_the_registry_once() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().on_search("rust", dated_posts()));
    let connector = Arc::new(MockConnector::new(platform));
    let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];
    let windows = partition(
        parse_timestamp("2024-02-01").unwrap(),
        parse_timestamp("2024-02-05").unwrap(),
        2,
        &PartitionStrategy::Equal,
    );
    let deps = deps(dir.path());

    let result = Orchestrator::new(connector, deps.clone())
        .run_parallel(&Target::keyword("rust"), 0, &identities, &windows)
        .await
        .unwrap();

    assert_eq!(result.participants.len(), 1);
    let registry = deps.registry.read().await.unwrap();
    assert_eq!(registry, BTreeSet::from(["a.test".to_string()]));
    assert_eq!(deps.registry.read_topic("rust").await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rejected_identity_fails_alone() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().on_search("rust", dated_posts()));
    let connector = Arc::new(MockConnector::new(platform).reject("w1.test"));
    let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];
    let windows = partition(
        parse_timestamp("2024-02-01").unwrap(),
        parse_timestamp("2024-02-05").unwrap(),
        2,
        &PartitionStrategy::Equal,
    );

    let result = Orchestrator::new(connector, deps(dir.path()))
        .run_parallel(&Target::keyword("rust"), 0, &identities, &windows)
        .await
        .unwrap();

    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("w1.test"));
    assert_eq!(result.stats.jobs_succeeded, 1);
    assert_eq!(result.stats.jobs_failed, 1);

    assert!(result.workers[0].succeeded());
    assert_eq!(result.workers[0].collected, 2);
    assert!(!result.workers[1].succeeded());
    assert_eq!(result.workers[1].collected, 0);

    // Only worker 0's window [02-01, 02-03) made it into the corpus.
    let rkeys: BTreeSet<_> = result
        .items
        .iter()
        .map(|i| i.uri.rsplit('/').next().unwrap().to_string())
        .collect();
    assert_eq!(rkeys, BTreeSet::from(["d1".to_string(), "d2".to_string()]));
}

#[tokio::test]
async fn expired_session_mid_run_does_not_stop_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = Arc::new(MockPlatform::new().on_search("rust", dated_posts()));
    let expired = Arc::new(MockPlatform::new().expire_session());
    let connector = Arc::new(MockConnector::new(healthy).on_identity("w0.test", expired));
    let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];
    let windows = partition(
        parse_timestamp("2024-02-01").unwrap(),
        parse_timestamp("2024-02-05").unwrap(),
        2,
        &PartitionStrategy::Equal,
    );

    let result = Orchestrator::new(connector, deps(dir.path()))
        .run_parallel(&Target::keyword("rust"), 0, &identities, &windows)
        .await
        .unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.items.len(), 2);
    assert!(result.final_path.is_some());
}

#[tokio::test]
async fn limit_is_split_across_workers() {
    let dir = tempfile::tempdir().unwrap();
    let platform = Arc::new(MockPlatform::new().on_search("rust", dated_posts()));
    let connector = Arc::new(MockConnector::new(platform));
    let identities = vec![identity(0, "w0.test"), identity(1, "w1.test")];
    let windows = partition(
        parse_timestamp("2024-02-01").unwrap(),
        parse_timestamp("2024-02-05").unwrap(),
        2,
        &PartitionStrategy::Equal,
    );

    // ceil(3 / 2) = 2 per worker
    let result = Orchestrator::new(connector, deps(dir.path()))
        .run_parallel(&Target::keyword("rust"), 3, &identities, &windows)
        .await
        .unwrap();

    assert!(result.workers.iter().all(|w| w.collected == 2));
    assert_eq!(result.items.len(), 4);
}
