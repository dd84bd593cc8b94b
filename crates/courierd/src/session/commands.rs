//! Session registry commands, errors, and events.
//!
//! This module defines the message types for communicating with the
//! `SessionRegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers

use std::sync::Arc;

use courier_core::{ConnectionState, SessionId, SessionView};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::transport::{ConnectParams, Connection};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Start a new connection lifecycle for a session.
    ///
    /// Any existing entry is superseded: its supervisor is cancelled and
    /// its handle released in the background.
    ///
    /// # Errors
    /// - `RegistryError::RegistryFull` if at maximum capacity
    BeginConnect {
        session_id: SessionId,
        params: ConnectParams,
        respond_to: oneshot::Sender<Result<SessionTicket, RegistryError>>,
    },

    /// Attach an established handle to the current connection lifecycle.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::StaleGeneration` if a newer lifecycle replaced it
    Attach {
        session_id: SessionId,
        generation: u64,
        connection: Arc<dyn Connection>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Record a state transition.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::StaleGeneration` if a newer lifecycle replaced it
    MarkState {
        session_id: SessionId,
        generation: u64,
        update: StateUpdate,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Get the live handle for a session, if one is attached.
    GetConnection {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<Arc<dyn Connection>>>,
    },

    GetSession {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<SessionView>>,
    },

    GetAllSessions {
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Release the handle and forget the session.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    Remove {
        session_id: SessionId,
        reason: RemovalReason,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },
}

/// Proof of ownership of one connection lifecycle.
///
/// Handed to the supervisor that drives the lifecycle; `cancel` fires
/// when the session is replaced or removed.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub session_id: SessionId,
    pub params: ConnectParams,
    pub generation: u64,
    pub cancel: CancellationToken,
}

/// A state transition requested by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub state: ConnectionState,
    /// Pairing code; ignored unless `state` is `Connecting`.
    pub pairing_code: Option<String>,
    pub error: Option<String>,
    /// Consecutive reconnect attempts; `None` keeps the current value.
    pub reconnect_attempts: Option<u32>,
}

impl StateUpdate {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            state,
            pairing_code: None,
            error: None,
            reconnect_attempts: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            reconnect_attempts: Some(0),
            ..Self::new(ConnectionState::Connected)
        }
    }

    pub fn pairing(code: impl Into<String>) -> Self {
        Self {
            pairing_code: Some(code.into()),
            ..Self::new(ConnectionState::Connecting)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(ConnectionState::Error)
        }
    }

    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = Some(attempts);
        self
    }
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("registry is full (max: {max} sessions)")]
    RegistryFull { max: usize },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The caller's connection lifecycle was superseded.
    #[error("stale generation {generation} for session {session_id}")]
    StaleGeneration {
        session_id: SessionId,
        generation: u64,
    },

    /// The actor was shut down before it could respond.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session entry was created or changed state.
    Updated { session: Box<SessionView> },

    Removed {
        session_id: SessionId,
        reason: RemovalReason,
    },
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Operator asked for the session to be dropped.
    Explicit,

    /// The account was logged out (locally or by the remote side).
    LoggedOut,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicitly removed"),
            Self::LoggedOut => write!(f, "logged out"),
        }
    }
}
