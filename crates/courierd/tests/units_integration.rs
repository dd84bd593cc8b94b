//! Integration tests for the unit registry over a directory store.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Target, UnitOrigin};
use courierd::activity::ActivityLog;
use courierd::transport::{Connection, TransportError};
use courierd::units::{
    DirectoryStore, ExecutorCatalog, MemoryStore, StoreError, Unit, UnitError, UnitRegistry,
    UnitStore, TRANSIENT_TAG_PREFIX, TRANSIENT_VERSION,
};
use tempfile::TempDir;
use tokio::sync::{oneshot, Mutex, Notify};

// ============================================================================
// Test Helpers
// ============================================================================

const GREET: &str = r#"
version = "2.1.0"
integrity_tag = "SIG_GREET"
executor = "send_text"

[params]
text = "hello"
"#;

const NO_TAG: &str = r#"
version = "1.0.0"
executor = "send_text"

[params]
text = "unsigned"
"#;

const UNKNOWN_EXECUTOR: &str = r#"
version = "1.0.0"
integrity_tag = "SIG_X"
executor = "format_disk"
"#;

struct NoopUnit;

#[async_trait]
impl Unit for NoopUnit {
    async fn execute(&self, _connection: &dyn Connection, _target: &Target) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Store whose first `read` parks until the test releases it.
struct GatedStore {
    inner: MemoryStore,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    parked: Notify,
}

impl GatedStore {
    fn new(inner: MemoryStore, gate: oneshot::Receiver<()>) -> Self {
        Self {
            inner,
            gate: Mutex::new(Some(gate)),
            parked: Notify::new(),
        }
    }
}

#[async_trait]
impl UnitStore for GatedStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list().await
    }

    async fn read(&self, name: &str) -> Result<String, StoreError> {
        let gate = self.gate.lock().await.take();
        if let Some(gate) = gate {
            self.parked.notify_one();
            let _ = gate.await;
        }
        self.inner.read(name).await
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        self.inner.write(name, content).await
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.inner.delete(name).await
    }
}

/// Registry over a fresh temporary directory.
fn registry(dir: &TempDir) -> (UnitRegistry, ActivityLog) {
    let activity = ActivityLog::new();
    let registry = UnitRegistry::new(
        Arc::new(DirectoryStore::new(dir.path().join("units"))),
        ExecutorCatalog::builtin(),
        None,
        activity.clone(),
    );
    (registry, activity)
}

fn write_manifest(dir: &TempDir, name: &str, content: &str) {
    let units = dir.path().join("units");
    std::fs::create_dir_all(&units).unwrap();
    std::fs::write(units.join(format!("{name}.toml")), content).unwrap();
}

// ============================================================================
// Reload Isolation
// ============================================================================

#[tokio::test]
async fn test_reload_skips_malformed_candidates() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "greet", GREET);
    write_manifest(&dir, "unsigned", NO_TAG);
    write_manifest(&dir, "wipe", UNKNOWN_EXECUTOR);
    write_manifest(&dir, "broken", "version = [");

    let (registry, activity) = registry(&dir);
    let report = registry.reload().await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.failed, 2);

    assert!(registry.resolve("greet").await.is_some());
    assert!(registry.resolve("unsigned").await.is_none());
    assert!(registry.resolve("wipe").await.is_none());
    assert!(registry.resolve("broken").await.is_none());

    let names: Vec<String> = registry.list().await.into_iter().map(|u| u.name).collect();
    assert_eq!(names, vec!["greet"]);

    let rejected = activity
        .since(None)
        .into_iter()
        .any(|e| e.message.contains("unsigned"));
    assert!(rejected, "rejection must be visible in the activity log");
}

#[tokio::test]
async fn test_reload_drops_deleted_units() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "greet", GREET);

    let (registry, _) = registry(&dir);
    registry.reload().await.unwrap();
    assert!(registry.resolve("greet").await.is_some());

    std::fs::remove_file(dir.path().join("units").join("greet.toml")).unwrap();
    let report = registry.reload().await.unwrap();

    assert_eq!(report.loaded, 0);
    assert!(registry.resolve("greet").await.is_none(), "no stale entry survives");
}

#[tokio::test]
async fn test_file_names_are_case_normalized() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "Greeting", GREET);

    let (registry, _) = registry(&dir);
    let report = registry.reload().await.unwrap();

    assert_eq!(report.loaded, 1);
    let unit = registry.resolve("greeting").await.unwrap();
    assert_eq!(unit.name, "greeting");
    assert_eq!(registry.read_unit("GREETING").await.unwrap(), GREET);
}

#[tokio::test]
async fn test_colliding_and_invalid_file_names_fail_visibly() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "greet", GREET);
    write_manifest(&dir, "GREET", NO_TAG);
    write_manifest(&dir, "bad name", GREET);

    let (registry, activity) = registry(&dir);
    let report = registry.reload().await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(registry.resolve("greet").await.unwrap().version, "2.1.0");

    let entries = activity.since(None);
    assert!(entries.iter().any(|e| e.message.contains("duplicate")));
    assert!(entries.iter().any(|e| e.message.contains("invalid unit name")));
}

#[tokio::test]
async fn test_saving_over_capitalized_file_keeps_one_manifest() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "Greeting", NO_TAG);
    let (registry, _) = registry(&dir);

    let report = registry.save_unit("greeting", GREET).await.unwrap();

    assert_eq!(report.loaded, 1);
    assert_eq!(report.failed, 0);
    assert!(!dir.path().join("units").join("greeting.toml").exists());
}

#[tokio::test]
async fn test_overlapping_reloads_end_consistent_with_store() {
    let (release, gate) = oneshot::channel();
    let store = Arc::new(GatedStore::new(MemoryStore::with_units([("alpha", GREET)]), gate));
    let registry = Arc::new(UnitRegistry::new(
        Arc::clone(&store) as Arc<dyn UnitStore>,
        ExecutorCatalog::builtin(),
        None,
        ActivityLog::new(),
    ));

    // A reload parks on its first read, holding a scan that predates "beta".
    let slow = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.reload().await }
    });
    store.parked.notified().await;

    let save = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.save_unit("beta", GREET).await }
    });
    while !store.inner.list().await.unwrap().contains(&"beta".to_string()) {
        tokio::task::yield_now().await;
    }

    release.send(()).unwrap();
    slow.await.unwrap().unwrap();
    let report = save.await.unwrap().unwrap();

    assert_eq!(report.loaded, 2);
    assert!(registry.resolve("alpha").await.is_some());
    assert!(
        registry.resolve("beta").await.is_some(),
        "a saved unit stays resolvable once every reload has finished"
    );
}

#[tokio::test]
async fn test_first_scan_creates_directory() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir);

    let report = registry.reload().await.unwrap();

    assert_eq!(report.loaded + report.rejected + report.failed, 0);
    assert!(dir.path().join("units").is_dir());
}

// ============================================================================
// Resolution Priority
// ============================================================================

#[tokio::test]
async fn test_transient_shadows_persistent_until_removed() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "greet", GREET);

    let (registry, _) = registry(&dir);
    registry.reload().await.unwrap();

    let tag = registry
        .register_transient("Greet", Arc::new(NoopUnit))
        .await
        .unwrap();
    assert!(tag.starts_with(TRANSIENT_TAG_PREFIX));

    let resolved = registry.resolve("GREET").await.unwrap();
    assert_eq!(resolved.origin, UnitOrigin::Transient);
    assert_eq!(resolved.version, TRANSIENT_VERSION);
    assert_eq!(resolved.integrity_tag, tag);

    // Transient units never reach the store.
    let stored = std::fs::read_dir(dir.path().join("units")).unwrap().count();
    assert_eq!(stored, 1);
    let on_disk = std::fs::read_to_string(dir.path().join("units").join("greet.toml")).unwrap();
    assert_eq!(on_disk, GREET);

    registry.remove_transient("greet").await.unwrap();

    let resolved = registry.resolve("greet").await.unwrap();
    assert_eq!(resolved.origin, UnitOrigin::Persistent);
    assert_eq!(resolved.version, "2.1.0");
    assert_eq!(resolved.integrity_tag, "SIG_GREET");
}

#[tokio::test]
async fn test_restart_forgets_transient_units() {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(&dir, "greet", GREET);

    let (first, _) = registry(&dir);
    first.reload().await.unwrap();
    first
        .register_transient("greet", Arc::new(NoopUnit))
        .await
        .unwrap();
    first
        .register_transient("scratch", Arc::new(NoopUnit))
        .await
        .unwrap();
    drop(first);

    // A fresh registry over the same store simulates a restart.
    let (second, _) = registry(&dir);
    second.reload().await.unwrap();

    let greet = second.resolve("greet").await.unwrap();
    assert_eq!(greet.origin, UnitOrigin::Persistent);
    assert!(second.resolve("scratch").await.is_none());
}

// ============================================================================
// Store Administration
// ============================================================================

#[tokio::test]
async fn test_save_read_delete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir);

    let report = registry.save_unit("Greet", GREET).await.unwrap();
    assert_eq!(report.loaded, 1);
    assert!(dir.path().join("units").join("greet.toml").is_file());
    assert_eq!(registry.read_unit("greet").await.unwrap(), GREET);

    let report = registry.delete_unit("greet").await.unwrap();
    assert_eq!(report.loaded, 0);
    assert!(registry.resolve("greet").await.is_none());
}

#[tokio::test]
async fn test_saving_invalid_manifest_is_stored_but_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir);

    let report = registry.save_unit("unsigned", NO_TAG).await.unwrap();

    assert_eq!(report.rejected, 1);
    assert!(registry.resolve("unsigned").await.is_none());
    assert_eq!(registry.read_unit("unsigned").await.unwrap(), NO_TAG);
}

#[tokio::test]
async fn test_names_cannot_escape_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir);

    let err = registry.save_unit("../evil", GREET).await.unwrap_err();
    assert!(matches!(err, UnitError::Store(_)));
    assert!(!dir.path().join("evil.toml").exists());
}

#[tokio::test]
async fn test_verify_reports_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry(&dir);

    let report = registry.verify_manifest(NO_TAG);
    assert!(report.parsed);
    assert!(report.has_version);
    assert!(!report.has_integrity_tag);
    assert!(report.has_executor);
    assert!(report.executor_known);

    let report = registry.verify_manifest(UNKNOWN_EXECUTOR);
    assert!(report.has_executor);
    assert!(!report.executor_known);

    // Verification never loads anything.
    assert!(registry.list().await.is_empty());
}
