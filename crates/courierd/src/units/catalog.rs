//! Compiled-in unit executors.
//!
//! A manifest names one of these by its `executor` field and configures it
//! through `[params]`. Nothing outside this catalog can become a unit
//! from manifest text.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use courier_core::Target;

use super::manifest::ManifestError;
use super::Unit;
use crate::transport::{Connection, Payload, TransportError};

type Builder = fn(&toml::Table) -> Result<Arc<dyn Unit>, ManifestError>;

/// Registry of executor kinds a manifest may name.
#[derive(Clone)]
pub struct ExecutorCatalog {
    builders: BTreeMap<&'static str, Builder>,
}

impl std::fmt::Debug for ExecutorCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorCatalog")
            .field("executors", &self.builders.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ExecutorCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ExecutorCatalog {
    /// Catalog with the bundled executors: `send_text` and `delay`.
    pub fn builtin() -> Self {
        let mut builders: BTreeMap<&'static str, Builder> = BTreeMap::new();
        builders.insert(SendText::KIND, SendText::build);
        builders.insert(Delay::KIND, Delay::build);
        Self { builders }
    }

    pub fn knows(&self, executor: &str) -> bool {
        self.builders.contains_key(executor)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.builders.keys().copied()
    }

    /// Instantiates `executor` with `params`.
    pub fn build(&self, executor: &str, params: &toml::Table) -> Result<Arc<dyn Unit>, ManifestError> {
        let builder = self
            .builders
            .get(executor)
            .ok_or_else(|| ManifestError::UnknownExecutor(executor.to_string()))?;
        builder(params)
    }
}

fn parse_params<T: DeserializeOwned>(kind: &str, params: &toml::Table) -> Result<T, ManifestError> {
    toml::Value::Table(params.clone())
        .try_into()
        .map_err(|e: toml::de::Error| ManifestError::InvalidParams {
            executor: kind.to_string(),
            reason: e.message().to_string(),
        })
}

// ============================================================================
// send_text
// ============================================================================

/// Sends a fixed text payload to the target once per iteration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendText {
    pub text: String,
}

impl SendText {
    pub const KIND: &'static str = "send_text";

    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    fn build(params: &toml::Table) -> Result<Arc<dyn Unit>, ManifestError> {
        let unit: Self = parse_params(Self::KIND, params)?;
        Ok(Arc::new(unit))
    }
}

#[async_trait]
impl Unit for SendText {
    async fn execute(&self, connection: &dyn Connection, target: &Target) -> Result<(), TransportError> {
        connection
            .send(target, &Payload::Text(self.text.clone()))
            .await
    }

    fn kind(&self) -> &str {
        Self::KIND
    }
}

// ============================================================================
// delay
// ============================================================================

/// Sleeps without touching the connection.
///
/// Sends nothing, so it does not need the per-target lock.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Delay {
    pub millis: u64,
}

impl Delay {
    pub const KIND: &'static str = "delay";

    fn build(params: &toml::Table) -> Result<Arc<dyn Unit>, ManifestError> {
        let unit: Self = parse_params(Self::KIND, params)?;
        Ok(Arc::new(unit))
    }
}

#[async_trait]
impl Unit for Delay {
    async fn execute(&self, _connection: &dyn Connection, _target: &Target) -> Result<(), TransportError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }

    fn serialize_per_target(&self) -> bool {
        false
    }

    fn kind(&self) -> &str {
        Self::KIND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(src: &str) -> toml::Table {
        src.parse().unwrap()
    }

    #[test]
    fn test_builtin_names() {
        let catalog = ExecutorCatalog::builtin();
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["delay", "send_text"]);
        assert!(catalog.knows("send_text"));
        assert!(!catalog.knows("eval"));
    }

    #[test]
    fn test_build_send_text() {
        let catalog = ExecutorCatalog::builtin();
        let unit = catalog.build("send_text", &table("text = \"hello\"")).unwrap();
        assert_eq!(unit.kind(), "send_text");
        assert!(unit.serialize_per_target());
    }

    #[test]
    fn test_build_rejects_bad_params() {
        let catalog = ExecutorCatalog::builtin();

        let err = catalog.build("send_text", &toml::Table::new()).err().unwrap();
        assert!(matches!(err, ManifestError::InvalidParams { .. }));

        let err = catalog
            .build("delay", &table("millis = 10\nextra = true"))
            .err().unwrap();
        assert!(matches!(err, ManifestError::InvalidParams { .. }));
    }

    #[test]
    fn test_build_unknown_executor() {
        let catalog = ExecutorCatalog::builtin();
        let err = catalog.build("shell", &toml::Table::new()).err().unwrap();
        assert_eq!(err, ManifestError::UnknownExecutor("shell".into()));
    }

    #[test]
    fn test_delay_skips_target_lock() {
        let catalog = ExecutorCatalog::builtin();
        let unit = catalog.build("delay", &table("millis = 5")).unwrap();
        assert!(!unit.serialize_per_target());
    }
}
