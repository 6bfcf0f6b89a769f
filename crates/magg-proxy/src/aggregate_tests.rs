use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use magg_config::BackendConfig;

use super::{CapabilityAggregator, CapabilitySnapshot, diff};
use crate::internal::InternalProvider;
use crate::testutil::{stdio_backend, write_mock_backend};
use crate::upstream::OutboundManager;

async fn aggregator_with(
    backends: Vec<BackendConfig>,
) -> (Arc<OutboundManager>, Arc<CapabilityAggregator>) {
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    for config in backends {
        manager.start(config).await.expect("start mock backend");
    }
    let internal = InternalProvider::new(manager.clone(), Arc::new(AtomicUsize::new(0)));
    let aggregator =
        CapabilityAggregator::new(manager.clone(), internal, Duration::from_secs(10));
    (manager, aggregator)
}

#[tokio::test]
async fn snapshot_merges_ready_backends_in_sorted_order() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let beta = write_mock_backend(temp.path(), "beta.sh", "beta_tool", None);
    let alpha = write_mock_backend(temp.path(), "alpha.sh", "alpha_tool", None);

    let (manager, aggregator) = aggregator_with(vec![
        stdio_backend("beta", &beta, &["db"]),
        stdio_backend("alpha", &alpha, &["fs"]),
    ])
    .await;

    let changes = aggregator.refresh().await;
    assert!(changes.has_changes());
    assert!(changes.tools_changed);
    assert_eq!(changes.added_backends, vec!["alpha", "beta"]);

    let snapshot = aggregator.current().await;
    assert_eq!(snapshot.ready_backends, vec!["alpha", "beta"]);

    // Internal tools lead, then external in sorted backend order.
    let names: Vec<&str> = snapshot.tools.iter().map(|e| e.tool.name.as_ref()).collect();
    assert_eq!(names, vec!["magg_status", "alpha_tool", "beta_tool"]);
    assert_eq!(snapshot.tool("alpha_tool").unwrap().origin, "alpha");
    assert_eq!(snapshot.resource("mock://beta_tool").unwrap().origin, "beta");
    assert_eq!(snapshot.prompt("alpha_tool-prompt").unwrap().origin, "alpha");

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_tool_names_keep_first_sorted_backend() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let one = write_mock_backend(temp.path(), "one.sh", "search", None);
    let two = write_mock_backend(temp.path(), "two.sh", "search", None);

    let (manager, aggregator) = aggregator_with(vec![
        stdio_backend("zeta", &one, &[]),
        stdio_backend("acme", &two, &[]),
    ])
    .await;

    aggregator.refresh().await;
    let snapshot = aggregator.current().await;

    let search_entries: Vec<_> = snapshot
        .tools
        .iter()
        .filter(|e| e.tool.name.as_ref() == "search")
        .collect();
    assert_eq!(search_entries.len(), 1, "duplicates are dropped");
    assert_eq!(
        search_entries[0].origin, "acme",
        "first backend in sorted ready order wins"
    );

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn enabled_list_restricts_tools() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "fs.sh", "read_file", None);
    let mut config = stdio_backend("fs", &script, &[]);
    config.tools.enabled = vec!["other_tool".to_string()];

    let (manager, aggregator) = aggregator_with(vec![config]).await;
    aggregator.refresh().await;
    let snapshot = aggregator.current().await;

    assert!(
        snapshot.tool("read_file").is_none(),
        "tool not on the enabled list is filtered out"
    );
    assert_eq!(snapshot.ready_backends, vec!["fs"]);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn refresh_with_unchanged_inputs_reports_no_changes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "fs.sh", "read_file", None);
    let (manager, aggregator) = aggregator_with(vec![stdio_backend("fs", &script, &[])]).await;

    let first = aggregator.refresh().await;
    assert!(first.has_changes());

    let second = aggregator.refresh().await;
    assert!(!second.has_changes(), "same inputs, no diff");

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn stopping_backend_removes_items_on_next_refresh() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "fs.sh", "read_file", None);
    let (manager, aggregator) = aggregator_with(vec![stdio_backend("fs", &script, &["fs"])]).await;

    aggregator.refresh().await;
    manager.stop("fs").await;
    let changes = aggregator.refresh().await;

    assert!(changes.tools_changed);
    assert_eq!(changes.removed_backends, vec!["fs"]);
    let changed: Vec<&str> = changes.changed_origins.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(changed, vec!["fs"]);
    assert!(
        changes.changed_origins[0].tags.contains("fs"),
        "tags from the previous snapshot attribute the removal"
    );

    let snapshot = aggregator.current().await;
    assert!(snapshot.ready_backends.is_empty());
    assert!(snapshot.tool("read_file").is_none());
    assert!(
        snapshot.tool("magg_status").is_some(),
        "internal tools survive an empty fleet"
    );

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn backend_instructions_land_in_snapshot() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "fs.sh", "read_file", Some("Use read_file."));
    let (manager, aggregator) = aggregator_with(vec![stdio_backend("fs", &script, &[])]).await;

    let changes = aggregator.refresh().await;
    assert!(changes.instructions_changed);

    let snapshot = aggregator.current().await;
    assert_eq!(
        snapshot.backends["fs"].instructions.as_deref(),
        Some("Use read_file.")
    );

    manager.stop_all().await;
    Ok(())
}

#[test]
fn diff_of_identical_snapshots_is_empty() {
    let snapshot = CapabilitySnapshot::default();
    let changes = diff(&snapshot, &snapshot);
    assert!(!changes.has_changes());
    assert!(changes.added_backends.is_empty());
    assert!(changes.changed_origins.is_empty());
}

#[tokio::test]
async fn origin_visibility_follows_tags() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "fs.sh", "read_file", None);
    let (manager, aggregator) = aggregator_with(vec![stdio_backend("fs", &script, &["fs"])]).await;
    aggregator.refresh().await;
    let snapshot = aggregator.current().await;

    let fs_filter = crate::filter::TagFilter::SimpleOr(vec!["fs".to_string()]);
    let db_filter = crate::filter::TagFilter::SimpleOr(vec!["db".to_string()]);
    assert!(snapshot.origin_visible("fs", &fs_filter));
    assert!(!snapshot.origin_visible("fs", &db_filter));
    assert!(
        snapshot.origin_visible(super::INTERNAL_ORIGIN, &db_filter),
        "internal items bypass tag filtering"
    );
    assert!(!snapshot.origin_visible("ghost", &fs_filter));

    manager.stop_all().await;
    Ok(())
}
