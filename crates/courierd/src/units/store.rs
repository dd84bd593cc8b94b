//! Unit storage backends.
//!
//! The store is the source of truth for persistent units: the registry
//! never caches anything a reload cannot rebuild from it.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// File extension of unit manifests.
pub const MANIFEST_EXTENSION: &str = "toml";

/// Longest accepted unit name.
pub const MAX_NAME_LEN: usize = 64;

/// Errors from a unit store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid unit name {0:?} (expected [a-z0-9_-], 1-64 chars)")]
    InvalidName(String),

    #[error("unit not found in store: {0}")]
    NotFound(String),

    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Checks a unit name against `[a-z0-9_-]{1,64}`.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Checks a stored key: a unit name that may also contain ASCII capitals.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    validate_name(&key.to_ascii_lowercase()).map_err(|_| StoreError::InvalidName(key.to_string()))
}

/// Persistent storage of unit manifests.
///
/// Keys are stored as written. The registry lowercases them into unit
/// names, so `Greeting` and `greeting` name the same unit.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Keys of every stored candidate, sorted. Keys are not validated.
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    async fn read(&self, name: &str) -> Result<String, StoreError>;

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

// ============================================================================
// Directory Store
// ============================================================================

/// One `<name>.toml` file per unit in a directory.
///
/// The directory is created on first use.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.{MANIFEST_EXTENSION}"))
    }

    async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })
    }
}

#[async_trait]
impl UnitStore for DirectoryStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_root().await?;

        let io_err = |source| StoreError::Io {
            path: self.root.clone(),
            source,
        };
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(io_err)?;

        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "Skipping manifest with a non UTF-8 name");
                continue;
            };
            names.push(stem.to_string());
        }

        names.sort();
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<String, StoreError> {
        validate_key(name)?;
        let path = self.path_for(name);
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
                _ => StoreError::Io { path, source },
            })
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        validate_key(name)?;
        self.ensure_root().await?;
        let path = self.path_for(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_key(name)?;
        let path = self.path_for(name);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|source| match source.kind() {
                ErrorKind::NotFound => StoreError::NotFound(name.to_string()),
                _ => StoreError::Io { path, source },
            })
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// Store that keeps manifests in memory; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    units: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from `(name, content)` pairs without validation.
    pub fn with_units<I, N, C>(units: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<String>,
    {
        Self {
            units: Mutex::new(
                units
                    .into_iter()
                    .map(|(n, c)| (n.into(), c.into()))
                    .collect(),
            ),
        }
    }

    fn units(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.units
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl UnitStore for MemoryStore {
    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.units().keys().cloned().collect())
    }

    async fn read(&self, name: &str) -> Result<String, StoreError> {
        self.units()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn write(&self, name: &str, content: &str) -> Result<(), StoreError> {
        validate_key(name)?;
        self.units().insert(name.to_string(), content.to_string());
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.units()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("ping_test-2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Ping").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(validate_name(&"a".repeat(64)).is_ok());
    }

    #[tokio::test]
    async fn test_directory_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("units"));

        // Directory is created on first scan.
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.root().is_dir());

        store.write("ping", "version = \"1\"").await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["ping".to_string()]);
        assert_eq!(store.read("ping").await.unwrap(), "version = \"1\"");

        store.delete("ping").await.unwrap();
        assert!(matches!(
            store.read("ping").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("ping").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_validate_key_allows_capitals() {
        assert!(validate_key("Greeting").is_ok());
        assert!(validate_key("greeting").is_ok());
        assert!(validate_key("bad name").is_err());
        assert!(validate_key("../Escape").is_err());
    }

    #[tokio::test]
    async fn test_directory_store_lists_every_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        std::fs::write(dir.path().join("Greeting.toml"), "x").unwrap();
        std::fs::write(dir.path().join("bad name.toml"), "x").unwrap();
        std::fs::write(dir.path().join("greeting.toml"), "x").unwrap();

        let store = DirectoryStore::new(dir.path());
        assert_eq!(
            store.list().await.unwrap(),
            vec!["Greeting".to_string(), "bad name".to_string(), "greeting".to_string()]
        );
        assert_eq!(store.read("Greeting").await.unwrap(), "x");
        assert!(matches!(
            store.read("bad name").await,
            Err(StoreError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_write_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let err = store.write("../escape", "x").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
    }
}
