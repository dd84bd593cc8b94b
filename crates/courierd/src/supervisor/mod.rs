//! Connection lifecycle supervision.
//!
//! Each managed session gets one [`SessionTask`] per lifecycle generation.
//! The task establishes the connection, runs the pairing flow if needed,
//! watches connection events and reconnects with exponential backoff.
//!
//! ```text
//!            ┌────────────┐ connect ok  ┌──────────┐  Open   ┌───────────┐
//!  start ───▶│ Connecting │────────────▶│ Watching │────────▶│ Connected │
//!            └────────────┘             └──────────┘         └───────────┘
//!                  ▲  connect err           │ Close(!=401)         │
//!                  │                        ▼                      │
//!                  │   backoff      ┌──────────────┐  Close(!=401) │
//!                  └────────────────│ Disconnected │◀──────────────┘
//!                                   └──────────────┘
//!                     attempts > max ──▶ Degraded      Close(401) ──▶ removed
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{ConnectionState, DomainError, SessionId, SessionView};

use crate::activity::ActivityLog;
use crate::config::{PairingConfig, ReconnectConfig};
use crate::session::{RegistryError, RegistryHandle, RemovalReason, SessionTicket, StateUpdate};
use crate::transport::{ConnectParams, Connection, ConnectionEvent, Established, Transport};

mod pairing;

pub use pairing::{PairingError, PairingFlow};

const ACTIVITY_SOURCE: &str = "session";

/// Errors from supervisor operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    InvalidSession(#[from] DomainError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Starts and stops session lifecycles.
#[derive(Clone)]
pub struct Supervisor {
    registry: RegistryHandle,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    pairing: PairingConfig,
    activity: ActivityLog,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        registry: RegistryHandle,
        transport: Arc<dyn Transport>,
        reconnect: ReconnectConfig,
        pairing: PairingConfig,
        activity: ActivityLog,
    ) -> Self {
        Self {
            registry,
            transport,
            reconnect,
            pairing,
            activity,
            shutdown: CancellationToken::new(),
        }
    }

    /// Opens (or re-opens) the session for a phone-number-like identifier.
    ///
    /// The session id is the digits of `phone`. Returns once the lifecycle
    /// is registered; the handshake continues in the background.
    pub async fn open_session(&self, phone: &str) -> Result<SessionView, SupervisorError> {
        let session_id = SessionId::from_phone(phone)?;
        let params = ConnectParams::with_phone(session_id.as_str());
        self.connect(session_id, params).await
    }

    /// Starts a new lifecycle for `session_id`, superseding any existing one.
    pub async fn connect(
        &self,
        session_id: SessionId,
        params: ConnectParams,
    ) -> Result<SessionView, SupervisorError> {
        let ticket = self.registry.begin_connect(session_id.clone(), params).await?;
        info!(session_id = %session_id, generation = ticket.generation, "Starting session lifecycle");

        let task = SessionTask {
            ticket,
            registry: self.registry.clone(),
            transport: Arc::clone(&self.transport),
            reconnect: self.reconnect.clone(),
            pairing: self.pairing.clone(),
            activity: self.activity.clone(),
            shutdown: self.shutdown.clone(),
            attempts: 0,
        };
        tokio::spawn(task.run());

        self.registry
            .get_session(&session_id)
            .await
            .ok_or(SupervisorError::Registry(RegistryError::SessionNotFound(
                session_id,
            )))
    }

    /// Logs the account out and forgets the session.
    ///
    /// The remote logout and the credential purge are best-effort; the
    /// registry entry is always removed.
    pub async fn logout(&self, session_id: &SessionId) -> Result<(), SupervisorError> {
        if let Some(connection) = self.registry.get_connection(session_id).await {
            if let Err(e) = connection.logout().await {
                warn!(session_id = %session_id, error = %e, "Remote logout failed");
            }
        }

        self.registry.remove(session_id, RemovalReason::LoggedOut).await?;

        if let Err(e) = self.transport.purge_credentials(session_id).await {
            warn!(session_id = %session_id, error = %e, "Failed to purge credentials");
        }
        info!(session_id = %session_id, "Session logged out");
        Ok(())
    }

    /// Stops every session task. Connections are released by the registry.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Session Task
// ============================================================================

/// How one connection ended.
#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    /// Closed or never opened; eligible for reconnect.
    Dropped(String),
    /// Remote logout; terminal.
    LoggedOut,
    /// Pairing gave up; terminal until the operator reconnects.
    PairingFailed,
    /// A newer lifecycle owns the session.
    Superseded,
}

/// Drives one lifecycle generation of one session.
struct SessionTask {
    ticket: SessionTicket,
    registry: RegistryHandle,
    transport: Arc<dyn Transport>,
    reconnect: ReconnectConfig,
    pairing: PairingConfig,
    activity: ActivityLog,
    shutdown: CancellationToken,
    /// Consecutive failed attempts since the last `Open`.
    attempts: u32,
}

impl SessionTask {
    async fn run(mut self) {
        let session_id = self.ticket.session_id.clone();
        let generation = self.ticket.generation;
        let cancel = self.ticket.cancel.clone();
        let shutdown = self.shutdown.clone();

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(session_id = %session_id, generation, "Lifecycle cancelled");
            }
            _ = shutdown.cancelled() => {
                debug!(session_id = %session_id, "Lifecycle stopped for shutdown");
            }
            _ = self.supervise() => {}
        }
    }

    async fn supervise(&mut self) {
        loop {
            let reason = match self.connect_once().await {
                LinkEnd::Dropped(reason) => reason,
                LinkEnd::LoggedOut => {
                    self.handle_logged_out().await;
                    return;
                }
                LinkEnd::PairingFailed | LinkEnd::Superseded => return,
            };

            self.attempts += 1;
            if self.attempts > self.reconnect.max_attempts {
                let message = format!(
                    "reconnect attempts exhausted after {} tries: {reason}",
                    self.reconnect.max_attempts
                );
                warn!(session_id = %self.ticket.session_id, "Session degraded");
                self.mark(
                    StateUpdate::new(ConnectionState::Degraded)
                        .with_error(message)
                        .with_attempts(self.reconnect.max_attempts),
                )
                .await;
                return;
            }

            let delay = self.reconnect.delay_for(self.attempts);
            info!(
                session_id = %self.ticket.session_id,
                attempt = self.attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Scheduling reconnect"
            );
            let update = StateUpdate::new(ConnectionState::Disconnected)
                .with_error(reason)
                .with_attempts(self.attempts);
            if !self.mark(update).await {
                return;
            }

            tokio::time::sleep(delay).await;

            if !self.mark(StateUpdate::new(ConnectionState::Connecting)).await {
                return;
            }
        }
    }

    /// Establishes one connection and follows it until it ends.
    async fn connect_once(&mut self) -> LinkEnd {
        let session_id = self.ticket.session_id.clone();

        let Established {
            connection,
            mut events,
        } = match self.transport.connect(&session_id, &self.ticket.params).await {
            Ok(established) => established,
            Err(e) => return LinkEnd::Dropped(e.to_string()),
        };

        if let Err(e) = self
            .registry
            .attach(&self.ticket, Arc::clone(&connection))
            .await
        {
            debug!(session_id = %session_id, error = %e, "Attach refused; closing new connection");
            close_quietly(connection.as_ref()).await;
            return LinkEnd::Superseded;
        }

        let flow = PairingFlow::new(
            session_id.clone(),
            self.ticket.params.phone_number.clone(),
            Arc::clone(&self.transport),
            self.pairing.clone(),
        );
        let mut pairing_pending = !connection.is_registered();
        let pairing = flow.run(connection.as_ref());
        tokio::pin!(pairing);

        loop {
            tokio::select! {
                result = &mut pairing, if pairing_pending => {
                    pairing_pending = false;
                    match result {
                        Ok(code) => {
                            info!(session_id = %session_id, "Pairing code issued");
                            if !self.mark(StateUpdate::pairing(code)).await {
                                return LinkEnd::Superseded;
                            }
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, error = %e, "Pairing failed");
                            self.activity.error(ACTIVITY_SOURCE, format!("{session_id}: pairing failed: {e}"));
                            self.mark(StateUpdate::error(e.to_string())).await;
                            close_quietly(connection.as_ref()).await;
                            return LinkEnd::PairingFailed;
                        }
                    }
                }
                event = events.recv() => match event {
                    Some(ConnectionEvent::Open) => {
                        pairing_pending = false;
                        self.attempts = 0;
                        info!(
                            session_id = %session_id,
                            identity = connection.authenticated_identity().as_deref().unwrap_or("-"),
                            "Session connected"
                        );
                        if !self.mark(StateUpdate::connected()).await {
                            return LinkEnd::Superseded;
                        }
                    }
                    Some(ConnectionEvent::Close(reason)) if reason.is_logged_out() => {
                        return LinkEnd::LoggedOut;
                    }
                    Some(ConnectionEvent::Close(reason)) => {
                        return LinkEnd::Dropped(format!("connection closed (status {})", reason.status_code));
                    }
                    None => return LinkEnd::Dropped("event stream ended".to_string()),
                },
            }
        }
    }

    async fn handle_logged_out(&self) {
        let session_id = &self.ticket.session_id;
        warn!(session_id = %session_id, "Remote logged the session out");

        // Only the current lifecycle may remove the entry.
        let marked = self
            .mark(StateUpdate::new(ConnectionState::Disconnected).with_error("logged out"))
            .await;
        if !marked {
            return;
        }

        // Purge before removing: removal cancels this task.
        match self.transport.purge_credentials(session_id).await {
            Ok(()) => {
                self.activity
                    .info(ACTIVITY_SOURCE, format!("{session_id}: credentials purged after logout"));
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to purge credentials");
            }
        }
        if let Err(e) = self.registry.remove(session_id, RemovalReason::LoggedOut).await {
            debug!(session_id = %session_id, error = %e, "Session already gone");
        }
    }

    /// Records a state change. Returns false once this lifecycle is stale.
    async fn mark(&self, update: StateUpdate) -> bool {
        match self.registry.mark_state(&self.ticket, update).await {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    session_id = %self.ticket.session_id,
                    generation = self.ticket.generation,
                    error = %e,
                    "Lifecycle no longer current"
                );
                false
            }
        }
    }
}

async fn close_quietly(connection: &dyn Connection) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Close failed");
    }
}
