//! Protocol message types for daemon communication.
//!
//! Messages are newline-delimited JSON objects tagged by `type`.

use crate::version::ProtocolVersion;
use courier_core::{
    ActivityEntry, DispatchOutcome, DispatchRequest, ManifestReport, SessionId, SessionView,
    UnitSummary,
};
use serde::{Deserialize, Serialize};

/// Requests a client can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first message on a connection
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Start (or restart) a session for a phone-number-like identifier
    OpenSession { phone_number: String },

    /// Log a session out and forget it
    Logout { session_id: SessionId },

    ListSessions,

    /// Run a unit against a target
    Dispatch { request: DispatchRequest },

    ListUnits,

    /// Rescan the unit store
    ReloadUnits,

    ReadUnit { name: String },

    /// Write a unit manifest to the store (followed by a reload)
    SaveUnit { name: String, content: String },

    DeleteUnit { name: String },

    /// Check a manifest against the unit contract without loading it
    VerifyUnit { content: String },

    /// Register an in-memory unit built from a manifest
    RegisterTransient { name: String, content: String },

    RemoveTransient { name: String },

    /// Activity entries after `since` (all retained entries when absent)
    Activity {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },

    /// Stream session updates on this connection
    Subscribe,

    Unsubscribe,

    Ping { seq: u64 },

    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Wraps a request with the current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn dispatch(request: DispatchRequest) -> Self {
        Self::new(MessageType::Dispatch { request })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake refused (version mismatch, wrong first message)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    SessionList { sessions: Vec<SessionView> },

    SessionUpdated { session: Box<SessionView> },

    SessionRemoved { session_id: SessionId, reason: String },

    /// Generic success acknowledgement
    Ack { message: String },

    DispatchResult { outcome: DispatchOutcome },

    UnitList { units: Vec<UnitSummary> },

    UnitSource { name: String, content: String },

    ReloadComplete {
        loaded: usize,
        rejected: usize,
        failed: usize,
    },

    VerifyReport { report: ManifestReport },

    TransientRegistered { name: String, integrity_tag: String },

    Activity {
        entries: Vec<ActivityEntry>,
        /// Pass back as `since` to continue polling
        next_seq: u64,
    },

    Pong { seq: u64 },

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn ack(message: impl Into<String>) -> Self {
        Self::Ack {
            message: message.into(),
        }
    }

    pub fn session_updated(session: SessionView) -> Self {
        Self::SessionUpdated {
            session: Box::new(session),
        }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
