//! Client interface for interacting with the session registry actor.
//!
//! The `RegistryHandle` is a cheap-to-clone interface for sending commands
//! to the actor and subscribing to session events. Channel errors are
//! mapped to `RegistryError::ChannelClosed`.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use courier_core::{SessionId, SessionView};

use super::commands::{
    RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionTicket, StateUpdate,
};
use crate::transport::{ConnectParams, Connection};

/// Handle for interacting with the registry actor.
///
/// ```ignore
/// let ticket = registry.begin_connect(session_id, params).await?;
/// registry.attach(&ticket, connection).await?;
/// registry.mark_state(&ticket, StateUpdate::connected()).await?;
///
/// let mut rx = registry.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Starts a new connection lifecycle, superseding any existing one.
    ///
    /// The returned ticket authorizes the caller to attach a handle and
    /// record state for this lifecycle only.
    ///
    /// # Errors
    ///
    /// - `RegistryError::RegistryFull` if the registry is at maximum capacity
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn begin_connect(
        &self,
        session_id: SessionId,
        params: ConnectParams,
    ) -> Result<SessionTicket, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::BeginConnect {
                session_id,
                params,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Attaches an established handle to the ticket's lifecycle.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session was removed
    /// - `RegistryError::StaleGeneration` if the lifecycle was superseded
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn attach(
        &self,
        ticket: &SessionTicket,
        connection: Arc<dyn Connection>,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Attach {
                session_id: ticket.session_id.clone(),
                generation: ticket.generation,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Records a state transition for the ticket's lifecycle.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session was removed
    /// - `RegistryError::StaleGeneration` if the lifecycle was superseded
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn mark_state(
        &self,
        ticket: &SessionTicket,
        update: StateUpdate,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::MarkState {
                session_id: ticket.session_id.clone(),
                generation: ticket.generation,
                update,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Returns the live handle for a session.
    ///
    /// Returns `None` if the session doesn't exist, has no handle yet, or
    /// the actor is gone.
    pub async fn get_connection(&self, session_id: &SessionId) -> Option<Arc<dyn Connection>> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetConnection {
                session_id: session_id.clone(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Option<SessionView> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::GetSession {
                session_id: session_id.clone(),
                respond_to: tx,
            })
            .await
            .ok()?;

        rx.await.ok()?
    }

    /// Get all sessions as views, ordered by id.
    ///
    /// Returns an empty vector if the actor is gone.
    pub async fn get_all_sessions(&self) -> Vec<SessionView> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(RegistryCommand::GetAllSessions { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// Releases the session's handle and deletes the entry.
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn remove(
        &self,
        session_id: &SessionId,
        reason: RemovalReason,
    ) -> Result<(), RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(RegistryCommand::Remove {
                session_id: session_id.clone(),
                reason,
                respond_to: tx,
            })
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)?
    }

    /// Subscribe to session events.
    ///
    /// This is a synchronous operation - it doesn't communicate with the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns `true` while the actor's command channel is open.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _event_rx) = broadcast::channel(16);
        (RegistryHandle::new(cmd_tx, event_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_begin_connect_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::BeginConnect {
                session_id,
                params,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(session_id.as_str(), "628123");
                let _ = respond_to.send(Ok(SessionTicket {
                    session_id,
                    params,
                    generation: 7,
                    cancel: CancellationToken::new(),
                }));
                return true;
            }
            false
        });

        let ticket = handle
            .begin_connect(SessionId::new("628123"), ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(ticket.generation, 7);
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_begin_connect_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .begin_connect(SessionId::new("628123"), ConnectParams::default())
            .await;
        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_queries_degrade_gracefully_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let id = SessionId::new("628123");
        assert!(handle.get_connection(&id).await.is_none());
        assert!(handle.get_session(&id).await.is_none());
        assert!(handle.get_all_sessions().await.is_empty());
        assert!(!handle.is_connected());
    }

    #[tokio::test]
    async fn test_remove_sends_reason() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Remove {
                reason, respond_to, ..
            }) = rx.recv().await
            {
                assert_eq!(reason, RemovalReason::LoggedOut);
                let _ = respond_to.send(Ok(()));
                return true;
            }
            false
        });

        let result = handle
            .remove(&SessionId::new("628123"), RemovalReason::LoggedOut)
            .await;
        assert!(result.is_ok());
        assert!(cmd_handler.await.unwrap());
    }
}
