//! Integration tests for the sandbox manager over the local backend.
//!
//! These tests use temp directories only, suitable for CI.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use agent_sandbox::{Error, LocalSandbox, ManagerConfig, SandboxManager, SandboxProvider};

/// Helper to build a manager whose sandboxes live under a temp dir.
fn create_manager(config: ManagerConfig) -> (SandboxManager, TempDir) {
    let base = TempDir::new().expect("failed to create temp dir");
    let provider: Arc<dyn SandboxProvider> =
        Arc::new(LocalSandbox::new(Some(base.path().to_path_buf())));
    let manager = SandboxManager::new(config, provider).expect("failed to create manager");
    (manager, base)
}

fn default_config() -> ManagerConfig {
    ManagerConfig::default()
        .with_max_sandboxes(2)
        .with_idle_timeout(Duration::from_secs(60))
        .with_cleanup_interval(Duration::from_secs(30))
}

fn sandbox_dirs(base: &TempDir) -> usize {
    std::fs::read_dir(base.path())
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[tokio::test]
async fn create_sandbox_runs_commands() {
    let (manager, base) = create_manager(default_config());

    let id = manager.create_sandbox(None).await.unwrap();
    assert!(manager.contains(&id));
    assert!(manager.last_used(&id).is_some());

    let sandbox = manager.get_sandbox(&id).unwrap();
    let result = sandbox.execute("echo 'test'").await.unwrap();
    assert_eq!(result.trim(), "test");

    manager.cleanup().await;
    assert_eq!(sandbox_dirs(&base), 0);
}

#[tokio::test]
async fn max_sandboxes_limit_is_enforced() {
    let (manager, _base) = create_manager(default_config());

    let mut created = Vec::new();
    for _ in 0..manager.capacity() {
        created.push(manager.create_sandbox(None).await.unwrap());
    }
    assert_eq!(manager.len(), manager.capacity());

    let err = manager.create_sandbox(None).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("Maximum number of sandboxes ({}) reached", manager.capacity())
    );

    for id in created {
        manager.delete_sandbox(&id).await.unwrap();
    }
    assert!(manager.is_empty());
}

#[tokio::test]
async fn get_nonexistent_sandbox_fails() {
    let (manager, _base) = create_manager(default_config());

    let err = manager.get_sandbox("nonexistent-id").err().unwrap();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.to_string(), "Sandbox nonexistent-id not found");
}

#[tokio::test]
async fn delete_sandbox_removes_it_everywhere() {
    let (manager, base) = create_manager(default_config());
    let id = manager.create_sandbox(None).await.unwrap();
    assert_eq!(sandbox_dirs(&base), 1);

    manager.delete_sandbox(&id).await.unwrap();

    assert!(!manager.contains(&id));
    assert!(manager.last_used(&id).is_none());
    assert!(manager.get_sandbox(&id).err().unwrap().is_not_found());
    assert_eq!(sandbox_dirs(&base), 0);
}

#[tokio::test]
async fn idle_sandbox_is_reclaimed() {
    let config = default_config().with_idle_timeout(Duration::from_millis(100));
    let (manager, base) = create_manager(config);

    let id = manager.create_sandbox(None).await.unwrap();
    assert!(manager.contains(&id));

    tokio::time::sleep(Duration::from_millis(200)).await;
    manager.reclaim_idle().await;

    assert!(!manager.contains(&id));
    assert_eq!(sandbox_dirs(&base), 0);
}

#[tokio::test]
async fn held_handle_can_be_reclaimed_without_touches() {
    let config = ManagerConfig::default()
        .with_max_sandboxes(2)
        .with_idle_timeout(Duration::from_millis(100))
        .with_cleanup_interval(Duration::from_millis(25));
    let (manager, _base) = create_manager(config);
    manager.start();

    let id = manager.create_sandbox(None).await.unwrap();
    let sandbox = manager.get_sandbox(&id).unwrap();

    // Holding the handle is not a use; only get/lease touches count
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!manager.contains(&id));
    assert!(sandbox.execute("echo late").await.is_err());

    manager.cleanup().await;
}

#[tokio::test]
async fn lease_protects_long_running_command() {
    let config = ManagerConfig::default()
        .with_max_sandboxes(2)
        .with_idle_timeout(Duration::from_millis(100))
        .with_cleanup_interval(Duration::from_millis(25));
    let (manager, _base) = create_manager(config);
    manager.start();

    let id = manager.create_sandbox(None).await.unwrap();
    let output = manager
        .execute(&id, "sleep 0.3 && echo done")
        .await
        .unwrap();

    assert_eq!(output.trim(), "done");
    assert!(manager.contains(&id));

    manager.cleanup().await;
}

#[tokio::test]
async fn run_reports_failing_command_status() {
    let (manager, _base) = create_manager(default_config());
    let id = manager.create_sandbox(None).await.unwrap();

    let result = manager.run(&id, "echo partial; exit 7").await.unwrap();
    assert_eq!(result.exit_code, 7);
    assert!(!result.success());
    assert_eq!(result.output.trim(), "partial");

    manager.cleanup().await;
}

#[tokio::test]
async fn manager_cleanup_removes_everything() {
    let (manager, base) = create_manager(default_config());
    manager.start();

    for _ in 0..2 {
        manager.create_sandbox(None).await.unwrap();
    }

    manager.cleanup().await;

    assert!(manager.is_empty());
    assert!(manager.ids().is_empty());
    assert_eq!(sandbox_dirs(&base), 0);
    assert!(matches!(
        manager.create_sandbox(None).await,
        Err(Error::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_never_exceed_capacity() {
    let (manager, base) = create_manager(default_config().with_max_sandboxes(4));

    let mut tasks = Vec::new();
    for _ in 0..manager.capacity() {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.create_sandbox(None).await }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();

    assert_eq!(ids.len(), 4);
    assert_eq!(manager.len(), 4);
    assert_eq!(sandbox_dirs(&base), 4);
    assert!(matches!(
        manager.create_sandbox(None).await,
        Err(Error::CapacityExceeded { max: 4 })
    ));

    manager.cleanup().await;
}
