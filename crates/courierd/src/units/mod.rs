//! Unit registry: persistent and transient pools of dispatchable units.
//!
//! Persistent units are rebuilt from the [`UnitStore`] on every reload;
//! transient units live in memory only and take resolution priority.
//!
//! Units are compiled Rust values implementing [`Unit`]. A manifest can
//! only select and configure an executor from the [`ExecutorCatalog`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use courier_core::{DispatchError, ManifestReport, Target, UnitOrigin, UnitSummary};

use crate::activity::ActivityLog;
use crate::transport::{Connection, TransportError};

pub mod catalog;
pub mod manifest;
pub mod store;

pub use catalog::{Delay, ExecutorCatalog, SendText};
pub use manifest::{ManifestError, UnitManifest};
pub use store::{validate_key, validate_name, DirectoryStore, MemoryStore, StoreError, UnitStore};

/// Version recorded for transient units.
pub const TRANSIENT_VERSION: &str = "TEMP-RUNTIME";

/// Prefix of generated transient integrity tags.
pub const TRANSIENT_TAG_PREFIX: &str = "VOLATILE-";

const ACTIVITY_SOURCE: &str = "units";

// ============================================================================
// Unit Contract
// ============================================================================

/// A dispatchable behavior.
#[async_trait]
pub trait Unit: Send + Sync {
    /// Runs one iteration against `target` over `connection`.
    async fn execute(&self, connection: &dyn Connection, target: &Target) -> Result<(), TransportError>;

    /// Whether concurrent iterations for the same session and target must
    /// be serialized.
    fn serialize_per_target(&self) -> bool {
        true
    }

    /// Executor kind shown in listings.
    fn kind(&self) -> &str {
        "custom"
    }
}

/// A unit together with its registration metadata.
#[derive(Clone)]
pub struct RegisteredUnit {
    pub name: String,
    pub version: String,
    pub integrity_tag: String,
    pub origin: UnitOrigin,
    pub unit: Arc<dyn Unit>,
}

impl RegisteredUnit {
    pub fn summary(&self) -> UnitSummary {
        UnitSummary {
            name: self.name.clone(),
            version: self.version.clone(),
            integrity_tag: self.integrity_tag.clone(),
            origin: self.origin,
            executor: self.unit.kind().to_string(),
        }
    }
}

impl fmt::Debug for RegisteredUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredUnit")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("integrity_tag", &self.integrity_tag)
            .field("origin", &self.origin)
            .field("kind", &self.unit.kind())
            .finish()
    }
}

// ============================================================================
// Errors and Reports
// ============================================================================

/// Errors from unit registry operations.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("no transient unit named {0}")]
    TransientNotFound(String),
}

/// Result of one reload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadReport {
    /// Candidates that became units.
    pub loaded: usize,
    /// Candidates skipped for a missing version or integrity tag.
    pub rejected: usize,
    /// Candidates that could not be read, parsed or built.
    pub failed: usize,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct Pools {
    persistent: HashMap<String, RegisteredUnit>,
    transient: HashMap<String, RegisteredUnit>,
}

impl Pools {
    fn lookup(&self, key: &str) -> Option<&RegisteredUnit> {
        self.transient.get(key).or_else(|| self.persistent.get(key))
    }
}

/// Owner of both unit pools.
pub struct UnitRegistry {
    store: Arc<dyn UnitStore>,
    catalog: ExecutorCatalog,
    default_unit: Option<String>,
    pools: RwLock<Pools>,
    /// Held from store scan to pool swap so reloads apply in order.
    reload_guard: Mutex<()>,
    activity: ActivityLog,
}

impl fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("catalog", &self.catalog)
            .field("default_unit", &self.default_unit)
            .finish_non_exhaustive()
    }
}

impl UnitRegistry {
    /// Creates an empty registry. Call [`reload`](Self::reload) to populate
    /// the persistent pool.
    pub fn new(
        store: Arc<dyn UnitStore>,
        catalog: ExecutorCatalog,
        default_unit: Option<String>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            store,
            catalog,
            default_unit: default_unit.map(|name| name.to_lowercase()),
            pools: RwLock::new(Pools::default()),
            reload_guard: Mutex::new(()),
            activity,
        }
    }

    pub fn catalog(&self) -> &ExecutorCatalog {
        &self.catalog
    }

    /// Rebuilds the persistent pool from the store.
    ///
    /// Each candidate is verified and built in isolation: a bad candidate
    /// is logged and skipped without affecting the others. The new pool
    /// replaces the old one in a single write, so no stale entry survives.
    ///
    /// Store keys are lowercased into unit names. When two keys collide,
    /// the already-lowercase key wins and the other counts as failed.
    pub async fn reload(&self) -> Result<ReloadReport, UnitError> {
        let _scan = self.reload_guard.lock().await;

        let mut keys = self.store.list().await?;
        keys.sort_by_cached_key(|key| (key.to_lowercase(), key.to_lowercase() != *key));
        debug!(candidates = keys.len(), "Scanning unit store");

        let mut fresh = HashMap::with_capacity(keys.len());
        let mut claimed = HashSet::with_capacity(keys.len());
        let mut report = ReloadReport::default();

        for key in keys {
            let name = key.to_lowercase();
            if let Err(e) = validate_name(&name) {
                warn!(key = %key, error = %e, "Skipping unit with invalid name");
                self.activity
                    .warn(ACTIVITY_SOURCE, format!("skipped {key:?}: invalid unit name"));
                report.failed += 1;
                continue;
            }
            if !claimed.insert(name.clone()) {
                warn!(key = %key, unit = %name, "Skipping unit whose name is already taken");
                self.activity.warn(
                    ACTIVITY_SOURCE,
                    format!("skipped {key:?}: duplicate of unit {name}"),
                );
                report.failed += 1;
                continue;
            }

            let content = match self.store.read(&key).await {
                Ok(content) => content,
                Err(e) => {
                    error!(unit = %name, error = %e, "Failed to read unit");
                    self.activity
                        .error(ACTIVITY_SOURCE, format!("failed to read {name}: {e}"));
                    report.failed += 1;
                    continue;
                }
            };

            match self.build_persistent(&name, &content) {
                Ok(unit) => {
                    fresh.insert(name, unit);
                    report.loaded += 1;
                }
                Err(e) if e.is_verification_failure() => {
                    let rejection = DispatchError::VerificationFailure {
                        name: name.clone(),
                        reason: e.to_string(),
                    };
                    warn!(unit = %name, error = %e, "Rejected unit");
                    self.activity.warn(ACTIVITY_SOURCE, rejection.to_string());
                    report.rejected += 1;
                }
                Err(e) => {
                    error!(unit = %name, error = %e, "Failed to initialize unit");
                    self.activity
                        .error(ACTIVITY_SOURCE, format!("failed to initialize {name}: {e}"));
                    report.failed += 1;
                }
            }
        }

        self.pools.write().await.persistent = fresh;

        info!(
            loaded = report.loaded,
            rejected = report.rejected,
            failed = report.failed,
            "Unit registry reloaded"
        );
        self.activity.info(
            ACTIVITY_SOURCE,
            format!(
                "reloaded: {} loaded, {} rejected, {} failed",
                report.loaded, report.rejected, report.failed
            ),
        );

        Ok(report)
    }

    fn build_persistent(&self, name: &str, content: &str) -> Result<RegisteredUnit, ManifestError> {
        let manifest = UnitManifest::parse(content)?;
        manifest.verify()?;
        let executor = manifest.executor().ok_or(ManifestError::MissingExecutor)?;
        let unit = self.catalog.build(executor, &manifest.params)?;

        Ok(RegisteredUnit {
            name: name.to_string(),
            version: manifest.version().unwrap_or_default().to_string(),
            integrity_tag: manifest.integrity_tag().unwrap_or_default().to_string(),
            origin: UnitOrigin::Persistent,
            unit,
        })
    }

    /// Registers an in-memory unit, replacing any transient unit of the
    /// same name. Returns the generated integrity tag.
    pub async fn register_transient(
        &self,
        name: &str,
        unit: Arc<dyn Unit>,
    ) -> Result<String, UnitError> {
        let key = name.to_lowercase();
        validate_name(&key)?;

        let integrity_tag = transient_tag();
        let registered = RegisteredUnit {
            name: key.clone(),
            version: TRANSIENT_VERSION.to_string(),
            integrity_tag: integrity_tag.clone(),
            origin: UnitOrigin::Transient,
            unit,
        };

        self.pools.write().await.transient.insert(key.clone(), registered);

        info!(unit = %key, tag = %integrity_tag, "Transient unit registered");
        self.activity.info(
            ACTIVITY_SOURCE,
            format!("transient unit {key} registered ({integrity_tag})"),
        );
        Ok(integrity_tag)
    }

    /// Builds a transient unit from manifest text and registers it.
    ///
    /// Only the executor and its params are used; version and tag are
    /// always the transient ones.
    pub async fn register_transient_manifest(
        &self,
        name: &str,
        content: &str,
    ) -> Result<String, UnitError> {
        let manifest = UnitManifest::parse(content)?;
        let executor = manifest.executor().ok_or(ManifestError::MissingExecutor)?;
        let unit = self.catalog.build(executor, &manifest.params)?;
        self.register_transient(name, unit).await
    }

    pub async fn remove_transient(&self, name: &str) -> Result<(), UnitError> {
        let key = name.to_lowercase();
        let removed = self.pools.write().await.transient.remove(&key);
        match removed {
            Some(_) => {
                info!(unit = %key, "Transient unit removed");
                self.activity
                    .info(ACTIVITY_SOURCE, format!("transient unit {key} removed"));
                Ok(())
            }
            None => Err(UnitError::TransientNotFound(key)),
        }
    }

    /// Resolves a unit name, case-insensitively.
    ///
    /// Order: transient pool, persistent pool, then the configured default
    /// unit (looked up the same way).
    pub async fn resolve(&self, name: &str) -> Option<RegisteredUnit> {
        let key = name.to_lowercase();
        let pools = self.pools.read().await;

        if let Some(unit) = pools.lookup(&key) {
            return Some(unit.clone());
        }

        let fallback = self
            .default_unit
            .as_deref()
            .and_then(|default| pools.lookup(default));
        if let Some(unit) = fallback {
            debug!(requested = %key, fallback = %unit.name, "Falling back to default unit");
        }
        fallback.cloned()
    }

    /// One summary per known name, sorted, describing what `resolve`
    /// would return for that name.
    pub async fn list(&self) -> Vec<UnitSummary> {
        let pools = self.pools.read().await;
        let names: BTreeSet<&String> = pools
            .persistent
            .keys()
            .chain(pools.transient.keys())
            .collect();

        names
            .into_iter()
            .filter_map(|name| pools.lookup(name))
            .map(RegisteredUnit::summary)
            .collect()
    }

    /// Store key holding unit `name`, preferring an exact match over a
    /// key that only matches case-insensitively.
    async fn stored_key(&self, name: &str) -> Result<String, UnitError> {
        let name = name.to_lowercase();
        validate_name(&name)?;
        let keys = self.store.list().await?;
        if keys.iter().any(|key| *key == name) {
            return Ok(name);
        }
        Ok(keys
            .into_iter()
            .find(|key| key.to_lowercase() == name)
            .unwrap_or(name))
    }

    /// Raw manifest text of a stored unit.
    pub async fn read_unit(&self, name: &str) -> Result<String, UnitError> {
        let key = self.stored_key(name).await?;
        Ok(self.store.read(&key).await?)
    }

    /// Writes a manifest to the store and reloads. An existing manifest is
    /// overwritten in place, whatever the case of its key.
    pub async fn save_unit(&self, name: &str, content: &str) -> Result<ReloadReport, UnitError> {
        let key = self.stored_key(name).await?;
        self.store.write(&key, content).await?;
        info!(unit = %key, "Unit saved");
        self.activity.info(ACTIVITY_SOURCE, format!("unit {key} saved"));
        self.reload().await
    }

    /// Deletes a manifest from the store and reloads.
    pub async fn delete_unit(&self, name: &str) -> Result<ReloadReport, UnitError> {
        let key = self.stored_key(name).await?;
        self.store.delete(&key).await?;
        info!(unit = %key, "Unit deleted");
        self.activity.info(ACTIVITY_SOURCE, format!("unit {key} deleted"));
        self.reload().await
    }

    /// Reports which contract fields `content` declares.
    pub fn verify_manifest(&self, content: &str) -> ManifestReport {
        UnitManifest::report(content, &self.catalog)
    }
}

fn transient_tag() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("{TRANSIENT_TAG_PREFIX}{}", hex.get(..8).unwrap_or(&hex))
}
