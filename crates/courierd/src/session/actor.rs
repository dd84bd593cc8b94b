//! Session registry actor - owns all session state and processes commands.
//!
//! The actor is the single owner of the session map. It receives commands
//! via an mpsc channel and publishes events via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel send failures are logged but don't panic
//! - Releasing a handle never blocks the actor: `close()` runs in a
//!   spawned task and its failure is only logged

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{ConnectionState, SessionId, SessionView};

use super::commands::{
    RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionTicket, StateUpdate,
};
use crate::transport::{ConnectParams, Connection};

/// Maximum number of sessions the registry can hold.
pub const MAX_SESSIONS: usize = 100;

/// One managed session.
struct SessionEntry {
    state: ConnectionState,
    pairing_code: Option<String>,
    last_error: Option<String>,
    reconnect_attempts: u32,
    updated_at: DateTime<Utc>,

    /// At most one live handle per session id.
    connection: Option<Arc<dyn Connection>>,

    generation: u64,
    cancel: CancellationToken,
}

impl SessionEntry {
    fn view(&self, id: &SessionId) -> SessionView {
        SessionView {
            id: id.clone(),
            state: self.state,
            pairing_code: self.pairing_code.clone(),
            last_error: self.last_error.clone(),
            identity: self
                .connection
                .as_ref()
                .and_then(|c| c.authenticated_identity()),
            reconnect_attempts: self.reconnect_attempts,
            updated_at: self.updated_at,
        }
    }
}

/// The registry actor - owns all session state.
///
/// Processes commands sequentially in a single task; every state mutation
/// happens here.
pub struct SessionRegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    sessions: HashMap<SessionId, SessionEntry>,
    /// Incremented for every `BeginConnect`; never reused.
    next_generation: u64,
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl SessionRegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            receiver,
            sessions: HashMap::new(),
            next_generation: 1,
            event_publisher,
        }
    }

    /// Runs the actor event loop until every handle is dropped.
    ///
    /// Remaining handles are released on the way out.
    pub async fn run(mut self) {
        info!("Session registry starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        for (session_id, entry) in self.sessions.drain() {
            entry.cancel.cancel();
            release(&session_id, entry.connection);
        }

        info!("Session registry stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::BeginConnect {
                session_id,
                params,
                respond_to,
            } => {
                let result = self.handle_begin_connect(session_id, params);
                // Ignore send error - client may have dropped the receiver
                let _ = respond_to.send(result);
            }
            RegistryCommand::Attach {
                session_id,
                generation,
                connection,
                respond_to,
            } => {
                let result = self.handle_attach(session_id, generation, connection);
                let _ = respond_to.send(result);
            }
            RegistryCommand::MarkState {
                session_id,
                generation,
                update,
                respond_to,
            } => {
                let result = self.handle_mark_state(session_id, generation, update);
                let _ = respond_to.send(result);
            }
            RegistryCommand::GetConnection {
                session_id,
                respond_to,
            } => {
                let conn = self
                    .sessions
                    .get(&session_id)
                    .and_then(|e| e.connection.clone());
                let _ = respond_to.send(conn);
            }
            RegistryCommand::GetSession {
                session_id,
                respond_to,
            } => {
                let view = self.sessions.get(&session_id).map(|e| e.view(&session_id));
                let _ = respond_to.send(view);
            }
            RegistryCommand::GetAllSessions { respond_to } => {
                let mut views: Vec<SessionView> =
                    self.sessions.iter().map(|(id, e)| e.view(id)).collect();
                views.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = respond_to.send(views);
            }
            RegistryCommand::Remove {
                session_id,
                reason,
                respond_to,
            } => {
                let result = self.handle_remove(session_id, reason);
                let _ = respond_to.send(result);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_begin_connect(
        &mut self,
        session_id: SessionId,
        params: ConnectParams,
    ) -> Result<SessionTicket, RegistryError> {
        if !self.sessions.contains_key(&session_id) && self.sessions.len() >= MAX_SESSIONS {
            warn!(
                session_id = %session_id,
                max = MAX_SESSIONS,
                "Registry is full, rejecting connect"
            );
            return Err(RegistryError::RegistryFull { max: MAX_SESSIONS });
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let cancel = CancellationToken::new();

        let entry = SessionEntry {
            state: ConnectionState::Connecting,
            pairing_code: None,
            last_error: None,
            reconnect_attempts: 0,
            updated_at: Utc::now(),
            connection: None,
            generation,
            cancel: cancel.clone(),
        };

        if let Some(previous) = self.sessions.insert(session_id.clone(), entry) {
            debug!(
                session_id = %session_id,
                old_generation = previous.generation,
                "Superseding existing session lifecycle"
            );
            previous.cancel.cancel();
            release(&session_id, previous.connection);
        }

        info!(
            session_id = %session_id,
            generation,
            total_sessions = self.sessions.len(),
            "Session connecting"
        );
        self.publish_update(&session_id);

        Ok(SessionTicket {
            session_id,
            params,
            generation,
            cancel,
        })
    }

    fn handle_attach(
        &mut self,
        session_id: SessionId,
        generation: u64,
        connection: Arc<dyn Connection>,
    ) -> Result<(), RegistryError> {
        let entry = self.current_entry(&session_id, generation)?;

        let previous = entry.connection.replace(connection);
        entry.updated_at = Utc::now();
        release(&session_id, previous);

        debug!(session_id = %session_id, generation, "Connection handle attached");
        self.publish_update(&session_id);
        Ok(())
    }

    fn handle_mark_state(
        &mut self,
        session_id: SessionId,
        generation: u64,
        update: StateUpdate,
    ) -> Result<(), RegistryError> {
        let entry = self.current_entry(&session_id, generation)?;
        let old_state = entry.state;

        entry.state = update.state;
        entry.pairing_code = if update.state.allows_pairing_artifact() {
            update.pairing_code.or_else(|| entry.pairing_code.take())
        } else {
            None
        };
        entry.last_error = match update.state {
            ConnectionState::Connected => None,
            _ => update.error.or_else(|| entry.last_error.take()),
        };
        if let Some(attempts) = update.reconnect_attempts {
            entry.reconnect_attempts = attempts;
        }
        entry.updated_at = Utc::now();

        info!(
            session_id = %session_id,
            from = %old_state,
            to = %update.state,
            "Session state changed"
        );
        self.publish_update(&session_id);
        Ok(())
    }

    fn handle_remove(
        &mut self,
        session_id: SessionId,
        reason: RemovalReason,
    ) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .remove(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        entry.cancel.cancel();
        release(&session_id, entry.connection);

        info!(
            session_id = %session_id,
            reason = %reason,
            total_sessions = self.sessions.len(),
            "Session removed"
        );

        let _ = self
            .event_publisher
            .send(SessionEvent::Removed { session_id, reason });
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Looks up an entry, refusing callers from a superseded lifecycle.
    fn current_entry(
        &mut self,
        session_id: &SessionId,
        generation: u64,
    ) -> Result<&mut SessionEntry, RegistryError> {
        let entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;

        if entry.generation != generation {
            debug!(
                session_id = %session_id,
                current = entry.generation,
                stale = generation,
                "Ignoring update from superseded lifecycle"
            );
            return Err(RegistryError::StaleGeneration {
                session_id: session_id.clone(),
                generation,
            });
        }

        Ok(entry)
    }

    fn publish_update(&self, session_id: &SessionId) {
        if let Some(entry) = self.sessions.get(session_id) {
            // No subscribers is fine
            let _ = self.event_publisher.send(SessionEvent::Updated {
                session: Box::new(entry.view(session_id)),
            });
        }
    }
}

/// Closes a released handle in the background.
fn release(session_id: &SessionId, connection: Option<Arc<dyn Connection>>) {
    let Some(connection) = connection else {
        return;
    };

    let session_id = session_id.clone();
    tokio::spawn(async move {
        if let Err(e) = connection.close().await {
            warn!(session_id = %session_id, error = %e, "Failed to release connection handle");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn spawn_actor() -> (mpsc::Sender<RegistryCommand>, broadcast::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = broadcast::channel(16);
        tokio::spawn(SessionRegistryActor::new(cmd_rx, event_tx).run());
        (cmd_tx, event_rx)
    }

    async fn begin(tx: &mpsc::Sender<RegistryCommand>, id: &str) -> SessionTicket {
        let (respond_to, rx) = oneshot::channel();
        tx.send(RegistryCommand::BeginConnect {
            session_id: SessionId::new(id),
            params: ConnectParams::default(),
            respond_to,
        })
        .await
        .unwrap();
        rx.await.unwrap().unwrap()
    }

    async fn mark(
        tx: &mpsc::Sender<RegistryCommand>,
        ticket: &SessionTicket,
        update: StateUpdate,
    ) -> Result<(), RegistryError> {
        let (respond_to, rx) = oneshot::channel();
        tx.send(RegistryCommand::MarkState {
            session_id: ticket.session_id.clone(),
            generation: ticket.generation,
            update,
            respond_to,
        })
        .await
        .unwrap();
        rx.await.unwrap()
    }

    async fn view(tx: &mpsc::Sender<RegistryCommand>, id: &str) -> Option<SessionView> {
        let (respond_to, rx) = oneshot::channel();
        tx.send(RegistryCommand::GetSession {
            session_id: SessionId::new(id),
            respond_to,
        })
        .await
        .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_begin_connect_creates_connecting_entry() {
        let (tx, mut events) = spawn_actor();
        let ticket = begin(&tx, "628100").await;
        assert_eq!(ticket.generation, 1);

        let session = view(&tx, "628100").await.unwrap();
        assert_eq!(session.state, ConnectionState::Connecting);

        match events.recv().await.unwrap() {
            SessionEvent::Updated { session } => assert_eq!(session.id.as_str(), "628100"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_generation() {
        let (tx, _events) = spawn_actor();
        let first = begin(&tx, "628100").await;
        let second = begin(&tx, "628100").await;

        assert!(first.cancel.is_cancelled());
        assert!(!second.cancel.is_cancelled());
        assert!(second.generation > first.generation);

        let result = mark(&tx, &first, StateUpdate::connected()).await;
        assert!(matches!(result, Err(RegistryError::StaleGeneration { .. })));
        assert!(mark(&tx, &second, StateUpdate::connected()).await.is_ok());
    }

    #[tokio::test]
    async fn test_pairing_code_cleared_outside_connecting() {
        let (tx, _events) = spawn_actor();
        let ticket = begin(&tx, "628100").await;

        mark(&tx, &ticket, StateUpdate::pairing("ABCD1234")).await.unwrap();
        let session = view(&tx, "628100").await.unwrap();
        assert_eq!(session.pairing_code.as_deref(), Some("ABCD1234"));

        mark(&tx, &ticket, StateUpdate::connected()).await.unwrap();
        let session = view(&tx, "628100").await.unwrap();
        assert_eq!(session.state, ConnectionState::Connected);
        assert!(session.pairing_code.is_none());
    }

    #[tokio::test]
    async fn test_remove_cancels_lifecycle() {
        let (tx, _events) = spawn_actor();
        let ticket = begin(&tx, "628100").await;

        let (respond_to, rx) = oneshot::channel();
        tx.send(RegistryCommand::Remove {
            session_id: SessionId::new("628100"),
            reason: RemovalReason::LoggedOut,
            respond_to,
        })
        .await
        .unwrap();
        assert!(rx.await.unwrap().is_ok());
        assert!(ticket.cancel.is_cancelled());
        assert!(view(&tx, "628100").await.is_none());
    }
}
