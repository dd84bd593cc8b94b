//! Session identifiers, connection state and read-only session views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a managed transport session.
///
/// Derived from a phone-number-like identifier by keeping only its digits
/// (e.g., "+62 812-3456" becomes "628123456").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string without cleaning it.
    ///
    /// Use [`SessionId::from_phone`] for operator-supplied input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a session id from a phone-number-like string.
    ///
    /// All non-digit characters are dropped.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidSessionId` when no digits remain.
    pub fn from_phone(raw: &str) -> DomainResult<Self> {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return Err(DomainError::InvalidSessionId {
                input: raw.to_string(),
            });
        }
        Ok(Self(digits))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Connection lifecycle of a session.
///
/// `Degraded` is terminal for the reconnection supervisor: it gave up after
/// exhausting its retry budget and waits for an operator to reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Degraded,
}

impl ConnectionState {
    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::Degraded => "degraded",
        }
    }

    /// Whether a pairing artifact may be attached in this state.
    #[must_use]
    pub fn allows_pairing_artifact(&self) -> bool {
        matches!(self, Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session View
// ============================================================================

/// Read-only snapshot of a session, for status polling and display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub state: ConnectionState,

    /// Pairing code, present only while `connecting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Identity reported by the transport once authenticated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,

    /// Consecutive reconnect attempts since the last successful open.
    #[serde(default)]
    pub reconnect_attempts: u32,

    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_phone_strips_non_digits() {
        let id = SessionId::from_phone("+62 812-3456 789").unwrap();
        assert_eq!(id.as_str(), "628123456789");
    }

    #[test]
    fn test_from_phone_rejects_empty() {
        let err = SessionId::from_phone("abc").unwrap_err();
        assert!(matches!(err, DomainError::InvalidSessionId { .. }));
        assert!(SessionId::from_phone("").is_err());
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Disconnected.label(), "disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Degraded.to_string(), "degraded");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_pairing_artifact_only_while_connecting() {
        assert!(ConnectionState::Connecting.allows_pairing_artifact());
        assert!(!ConnectionState::Connected.allows_pairing_artifact());
        assert!(!ConnectionState::Error.allows_pairing_artifact());
    }

    #[test]
    fn test_connection_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
    }
}
