use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::{Duration, Instant};

use magg_config::{BackendConfig, TemplateSettings};

use super::{TemplatePool, variable_hash};
use crate::aggregate::CapabilityAggregator;
use crate::internal::InternalProvider;
use crate::template::RenderContext;
use crate::testutil::{stdio_backend, write_mock_backend};
use crate::upstream::OutboundManager;

fn pool_under_test(manager: Arc<OutboundManager>) -> Arc<TemplatePool> {
    let internal = InternalProvider::new(manager.clone(), Arc::new(AtomicUsize::new(0)));
    let aggregator = CapabilityAggregator::new(manager.clone(), internal, Duration::from_secs(10));
    TemplatePool::new(manager, aggregator)
}

fn template_config(
    script: &std::path::Path,
    shareable: bool,
    per_client: bool,
    max_instances: Option<usize>,
) -> BackendConfig {
    let mut config = stdio_backend("proj", script, &["proj"]);
    config.args.push("{context.sessionId|hash}".to_string());
    config.template = Some(TemplateSettings {
        shareable,
        per_client,
        max_instances,
        idle_timeout: 60,
        allow_sensitive_data: false,
    });
    config
}

fn context_for(session_id: &str, path: &str) -> RenderContext {
    RenderContext::for_session(
        session_id,
        "sse",
        "conn-1",
        Default::default(),
        Some(&serde_json::json!({"project": {"path": path, "name": "p"}})),
    )
}

/// Template whose rendered form depends only on the project path, so two
/// sessions with the same path produce the same variable hash.
fn path_template(script: &std::path::Path, shareable: bool) -> BackendConfig {
    let mut config = stdio_backend("proj", script, &["proj"]);
    config.args.push("{project.path}".to_string());
    config.template = Some(TemplateSettings {
        shareable,
        per_client: false,
        max_instances: None,
        idle_timeout: 60,
        allow_sensitive_data: false,
    });
    config
}

#[tokio::test]
async fn shareable_template_coalesces_equal_bindings() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = path_template(&script, true);

    let a = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    let b = pool
        .get_or_create(&template, &context_for("sess-b", "/repo"), "sess-b")
        .await?;

    assert_eq!(a.backend_name, b.backend_name, "identical bindings share");
    assert_eq!(a.instance_id, b.instance_id);

    let instances = pool.instances().await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].reference_count, 2);
    assert!(!instances[0].idle);

    // Distinct bindings get their own instance.
    let c = pool
        .get_or_create(&template, &context_for("sess-c", "/other"), "sess-c")
        .await?;
    assert_ne!(c.backend_name, a.backend_name);
    assert_eq!(pool.instances().await.len(), 2);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn non_shareable_template_never_coalesces() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = path_template(&script, false);

    let a = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    let b = pool
        .get_or_create(&template, &context_for("sess-b", "/repo"), "sess-b")
        .await?;

    assert_ne!(a.backend_name, b.backend_name);
    assert_eq!(pool.instances().await.len(), 2);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn per_client_forces_sharing_off() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = template_config(&script, true, true, None);

    let a = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    let b = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    assert_ne!(
        a.backend_name, b.backend_name,
        "perClient always materializes a fresh instance"
    );
    assert!(!a.shared);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn max_instances_is_enforced() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = template_config(&script, false, false, Some(1));

    pool.get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    let err = pool
        .get_or_create(&template, &context_for("sess-b", "/repo"), "sess-b")
        .await
        .expect_err("second instance exceeds maxInstances=1");
    assert!(err.to_string().contains("exhausted"), "got: {err}");

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn release_to_zero_idles_then_reap_evicts() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = path_template(&script, true);

    let handle = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    pool.get_or_create(&template, &context_for("sess-b", "/repo"), "sess-b")
        .await?;
    assert!(manager.get(&handle.backend_name).await.is_some());

    pool.release(&handle.key, "sess-a").await;
    assert_eq!(pool.instances().await[0].reference_count, 1);

    pool.release_session("sess-b").await;
    let instances = pool.instances().await;
    assert_eq!(instances[0].reference_count, 0);
    assert!(instances[0].idle);

    // Before the idle timeout nothing is evicted.
    assert_eq!(pool.reap(Instant::now()).await, 0);
    assert_eq!(pool.instances().await.len(), 1);

    // One tick past the 60 s idle timeout the instance goes away.
    let later = Instant::now() + Duration::from_secs(61);
    assert_eq!(pool.reap(later).await, 1);
    assert!(pool.instances().await.is_empty());
    assert!(
        manager.get(&handle.backend_name).await.is_none(),
        "evicted backend leaves the outbound table"
    );

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn rejoining_before_reap_cancels_idle() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let (manager, _notices) = OutboundManager::new(Duration::from_secs(10));
    let pool = pool_under_test(manager.clone());
    let template = path_template(&script, true);

    pool.get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await?;
    pool.release_session("sess-a").await;
    pool.get_or_create(&template, &context_for("sess-b", "/repo"), "sess-b")
        .await?;

    let later = Instant::now() + Duration::from_secs(120);
    assert_eq!(pool.reap(later).await, 0, "referenced instances never reap");
    assert_eq!(pool.instances().await.len(), 1);

    manager.stop_all().await;
    Ok(())
}

#[tokio::test]
async fn failed_creation_surfaces_start_error_and_frees_slot() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let script = crate::testutil::write_script(temp.path(), "dead.sh", "#!/bin/sh\nexit 1\n");
    let (manager, _notices) = OutboundManager::with_policy(crate::testutil::fast_policy());
    let pool = pool_under_test(manager.clone());
    let template = path_template(&script, true);

    let err = pool
        .get_or_create(&template, &context_for("sess-a", "/repo"), "sess-a")
        .await
        .expect_err("backend cannot start");
    assert!(err.to_string().contains("failed to start"), "got: {err}");
    assert!(pool.instances().await.is_empty());
    Ok(())
}

#[test]
fn variable_hash_ignores_name_and_is_stable() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_backend(temp.path(), "proj.sh", "proj_tool", None);
    let mut a = stdio_backend("proj", &script, &["proj"]);
    let mut b = a.clone();

    assert_eq!(variable_hash(&a), variable_hash(&b));

    b.name = "renamed".to_string();
    assert_eq!(variable_hash(&a), variable_hash(&b), "name is excluded");

    a.args.push("--extra".to_string());
    assert_ne!(variable_hash(&a), variable_hash(&b));
    assert_eq!(variable_hash(&a).len(), 64);
}
