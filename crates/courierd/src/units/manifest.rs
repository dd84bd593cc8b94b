//! Unit manifest format.
//!
//! ```toml
//! version = "1.0.0"
//! integrity_tag = "SIG_PING"
//! executor = "send_text"
//!
//! [params]
//! text = "ping"
//! ```
//!
//! `integrity_tag` is an operator-declared fingerprint. It is checked for
//! presence only; nothing is derived from the manifest content.

use serde::Deserialize;
use thiserror::Error;

use courier_core::ManifestReport;

use super::catalog::ExecutorCatalog;

/// Reasons a manifest cannot become a unit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Parse(String),

    #[error("missing version")]
    MissingVersion,

    #[error("missing integrity tag")]
    MissingIntegrityTag,

    #[error("missing executor")]
    MissingExecutor,

    #[error("unknown executor: {0}")]
    UnknownExecutor(String),

    #[error("invalid params for {executor}: {reason}")]
    InvalidParams { executor: String, reason: String },
}

impl ManifestError {
    /// A fingerprint field is missing; the candidate is rejected rather
    /// than failed.
    #[must_use]
    pub fn is_verification_failure(&self) -> bool {
        matches!(self, Self::MissingVersion | Self::MissingIntegrityTag)
    }
}

/// Parsed, not yet verified, unit manifest.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UnitManifest {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub integrity_tag: Option<String>,

    #[serde(default)]
    pub executor: Option<String>,

    #[serde(default)]
    pub params: toml::Table,
}

impl UnitManifest {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        toml::from_str(content).map_err(|e| ManifestError::Parse(e.message().to_string()))
    }

    pub fn version(&self) -> Option<&str> {
        non_blank(self.version.as_deref())
    }

    pub fn integrity_tag(&self) -> Option<&str> {
        non_blank(self.integrity_tag.as_deref())
    }

    pub fn executor(&self) -> Option<&str> {
        non_blank(self.executor.as_deref())
    }

    /// Checks the fingerprint fields (`version`, `integrity_tag`).
    pub fn verify(&self) -> Result<(), ManifestError> {
        if self.version().is_none() {
            return Err(ManifestError::MissingVersion);
        }
        if self.integrity_tag().is_none() {
            return Err(ManifestError::MissingIntegrityTag);
        }
        Ok(())
    }

    /// Reports which contract fields `content` declares, without loading it.
    pub fn report(content: &str, catalog: &ExecutorCatalog) -> ManifestReport {
        let Ok(manifest) = Self::parse(content) else {
            return ManifestReport::default();
        };

        ManifestReport {
            parsed: true,
            has_version: manifest.version().is_some(),
            has_integrity_tag: manifest.integrity_tag().is_some(),
            has_executor: manifest.executor().is_some(),
            executor_known: manifest
                .executor()
                .map(|name| catalog.knows(name))
                .unwrap_or(false),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = UnitManifest::parse(
            r#"
            version = "1.0.0"
            integrity_tag = "SIG_PING"
            executor = "send_text"

            [params]
            text = "ping"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.version(), Some("1.0.0"));
        assert_eq!(manifest.executor(), Some("send_text"));
        assert!(manifest.verify().is_ok());
        assert_eq!(
            manifest.params.get("text").and_then(|v| v.as_str()),
            Some("ping")
        );
    }

    #[test]
    fn test_blank_tag_fails_verification() {
        let manifest =
            UnitManifest::parse("version = \"1\"\nintegrity_tag = \"  \"\nexecutor = \"delay\"")
                .unwrap();
        let err = manifest.verify().unwrap_err();
        assert_eq!(err, ManifestError::MissingIntegrityTag);
        assert!(err.is_verification_failure());
    }

    #[test]
    fn test_parse_error_is_not_a_verification_failure() {
        let err = UnitManifest::parse("version = ").unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_)));
        assert!(!err.is_verification_failure());
    }

    #[test]
    fn test_report_flags_each_field() {
        let catalog = ExecutorCatalog::builtin();

        let report = UnitManifest::report("version = \"1\"\nexecutor = \"teleport\"", &catalog);
        assert!(report.parsed);
        assert!(report.has_version);
        assert!(!report.has_integrity_tag);
        assert!(report.has_executor);
        assert!(!report.executor_known);

        let report = UnitManifest::report("not toml [", &catalog);
        assert!(!report.parsed);
    }
}
