//! Unit descriptors shared between the daemon and its clients.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which pool a unit lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOrigin {
    /// Loaded from the unit store; survives restarts.
    Persistent,
    /// Registered in memory only; gone on restart.
    Transient,
}

impl fmt::Display for UnitOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistent => write!(f, "persistent"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// Display summary of a registered unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub name: String,
    pub version: String,
    pub integrity_tag: String,
    pub origin: UnitOrigin,
    pub executor: String,
}

/// Which manifest contract fields a unit source declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ManifestReport {
    pub parsed: bool,
    pub has_version: bool,
    pub has_integrity_tag: bool,
    pub has_executor: bool,
    /// The executor names a unit kind this daemon knows how to run.
    pub executor_known: bool,
}

impl ManifestReport {
    /// All contract fields present and loadable.
    #[must_use]
    pub fn is_compliant(&self) -> bool {
        self.parsed
            && self.has_version
            && self.has_integrity_tag
            && self.has_executor
            && self.executor_known
    }
}
