//! Error types for the courier control client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised while talking to `courierd`.
///
/// Connection errors carry enough context to tell the operator what to
/// check; daemon-side failures keep the machine-readable code from the
/// protocol's `error` message.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket does not exist or refused the connection.
    #[error("Failed to connect to daemon at {path}: {reason} (is courierd running?)")]
    DaemonConnection { path: PathBuf, reason: String },

    /// The daemon speaks an incompatible protocol version.
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon answered with something the client did not expect.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// The daemon closed the connection.
    #[error("Daemon closed the connection")]
    Closed,

    /// The daemon rejected the request.
    #[error("{message}")]
    Daemon {
        message: String,
        code: Option<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl ClientError {
    /// Protocol error code of a daemon-side failure, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Daemon { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_connection_error_display() {
        let error = ClientError::DaemonConnection {
            path: PathBuf::from("/tmp/courier.sock"),
            reason: "No such file or directory".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("/tmp/courier.sock"));
        assert!(display.contains("is courierd running?"));
    }

    #[test]
    fn test_version_mismatch_error_display() {
        let error = ClientError::VersionMismatch {
            client_version: "1.0".to_string(),
            daemon_version: "2.0".to_string(),
        };
        let display = error.to_string();
        assert!(display.contains("client: 1.0"));
        assert!(display.contains("daemon: 2.0"));
    }

    #[test]
    fn test_daemon_error_exposes_code() {
        let error = ClientError::Daemon {
            message: "Unit 'nope' not found".to_string(),
            code: Some("unit_not_found".to_string()),
        };
        assert_eq!(error.to_string(), "Unit 'nope' not found");
        assert_eq!(error.code(), Some("unit_not_found"));
        assert_eq!(ClientError::Closed.code(), None);
    }

    #[test]
    fn test_parse_error_from_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{ nope").unwrap_err();
        let error: ClientError = json_error.into();
        assert!(matches!(error, ClientError::ParseError(_)));
    }
}
