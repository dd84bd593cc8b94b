//! Transport capability consumed by the orchestration core.
//!
//! The chat transport (framing, encryption, wire-level retries) is an
//! external collaborator. The core only sees these traits:
//!
//! - [`Transport`] establishes connections and owns local credential state
//! - [`Connection`] is a live handle that can send, close and log out
//! - [`ConnectionEvent`]s report lifecycle changes on an mpsc channel
//!
//! [`loopback::LoopbackTransport`] is an in-process implementation used for
//! local operation and tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use courier_core::{SessionId, Target};

pub mod loopback;

pub use loopback::LoopbackTransport;

/// Close status reported when the account was explicitly logged out.
///
/// This is the only terminal close; every other status is recoverable.
pub const LOGGED_OUT_STATUS: u16 = 401;

// ============================================================================
// Events and Parameters
// ============================================================================

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseReason {
    pub status_code: u16,
}

impl CloseReason {
    pub fn new(status_code: u16) -> Self {
        Self { status_code }
    }

    /// The remote side logged this account out; do not reconnect.
    #[must_use]
    pub fn is_logged_out(&self) -> bool {
        self.status_code == LOGGED_OUT_STATUS
    }
}

/// Lifecycle events emitted by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Close(CloseReason),
}

/// Parameters needed to (re)establish a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectParams {
    /// Digits-only number used for pairing-code requests.
    pub phone_number: Option<String>,
}

impl ConnectParams {
    pub fn with_phone(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
        }
    }
}

/// Opaque message payload; the core never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by a transport or connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    /// The handle is no longer usable.
    #[error("connection closed")]
    SessionClosed,

    #[error("transport not ready")]
    NotReady,

    #[error("rate limited by remote")]
    RateLimited,

    #[error("unauthorized")]
    Unauthorized,

    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether this failure means the session itself is gone.
    #[must_use]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::SessionClosed)
    }
}

// ============================================================================
// Capability Traits
// ============================================================================

/// A freshly established connection together with its event stream.
pub struct Established {
    pub connection: Arc<dyn Connection>,
    pub events: mpsc::Receiver<ConnectionEvent>,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Factory for protocol connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts establishing a connection.
    ///
    /// Returns as soon as a handle exists; completion of the handshake is
    /// reported as [`ConnectionEvent::Open`] on the event stream.
    async fn connect(
        &self,
        session_id: &SessionId,
        params: &ConnectParams,
    ) -> Result<Established, TransportError>;

    /// Deletes locally stored credentials for a session.
    async fn purge_credentials(&self, session_id: &SessionId) -> Result<(), TransportError>;
}

/// A live protocol connection.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    async fn send(&self, target: &Target, payload: &Payload) -> Result<(), TransportError>;

    /// Closes the connection, keeping credentials for a later reconnect.
    async fn close(&self) -> Result<(), TransportError>;

    /// Ends the account session on the remote side.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Identity the remote side authenticated us as, if any.
    fn authenticated_identity(&self) -> Option<String>;

    /// Whether stored credentials are already paired with an account.
    fn is_registered(&self) -> bool;

    /// Whether the underlying socket can accept pairing requests yet.
    fn is_ready(&self) -> bool;

    fn is_open(&self) -> bool;

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError>;
}
