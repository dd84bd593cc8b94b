//! Activity log entries exposed for status polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

/// One line of the daemon's activity stream.
///
/// `seq` increases monotonically for the lifetime of the daemon, so
/// pollers can ask for everything after the last sequence they saw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub level: ActivityLevel,
    /// Subsystem that produced the entry (e.g. "session", "engine", "units").
    pub source: String,
    pub message: String,
}
