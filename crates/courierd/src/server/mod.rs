//! Unix socket control server for the courier daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client
//! - Broadcasts session events to subscribed clients
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  DaemonServer   │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌──────────────────────────────┐
//! │ConnectionHandler│────▶│ DaemonContext                │
//! │   (per client)  │     │ supervisor / engine / units  │
//! └─────────────────┘     └──────────────────────────────┘
//!         ▲
//!         │ SessionEvent broadcast
//! ┌─────────────────┐
//! │ RegistryHandle  │
//! └─────────────────┘
//! ```

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, SubscriberWriter, SubscribersMap};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_protocol::DaemonMessage;

use crate::activity::{record_session_events, ActivityLog};
use crate::config::CourierConfig;
use crate::engine::DispatchEngine;
use crate::session::{spawn_registry, RegistryHandle, SessionEvent};
use crate::supervisor::Supervisor;
use crate::transport::Transport;
use crate::units::{ExecutorCatalog, UnitRegistry, UnitStore};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/courier.sock";

/// Everything a client request can reach.
#[derive(Clone)]
pub struct DaemonContext {
    pub registry: RegistryHandle,
    pub supervisor: Supervisor,
    pub engine: Arc<DispatchEngine>,
    pub units: Arc<UnitRegistry>,
    pub activity: ActivityLog,
}

impl DaemonContext {
    /// Spawns the registry and the activity recorder and wires every
    /// component together. Must be called inside a tokio runtime.
    ///
    /// The unit pools start empty; call `units.reload()` to populate them.
    pub fn start(
        config: &CourierConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn UnitStore>,
        cancel_token: CancellationToken,
    ) -> Self {
        let activity = ActivityLog::new();
        let registry = spawn_registry();

        tokio::spawn(record_session_events(
            activity.clone(),
            registry.subscribe(),
            cancel_token,
        ));

        let units = Arc::new(UnitRegistry::new(
            store,
            ExecutorCatalog::builtin(),
            config.units.default_unit.clone(),
            activity.clone(),
        ));
        let engine = Arc::new(DispatchEngine::new(
            registry.clone(),
            Arc::clone(&units),
            config.engine.clone(),
            activity.clone(),
        ));
        let supervisor = Supervisor::new(
            registry.clone(),
            transport,
            config.reconnect.clone(),
            config.pairing.clone(),
            activity.clone(),
        );

        Self {
            registry,
            supervisor,
            engine,
            units,
            activity,
        }
    }
}

/// Control socket listener.
///
/// Each accepted stream gets its own [`ConnectionHandler`] task; registry
/// events are fanned out to clients that sent `subscribe`.
pub struct DaemonServer {
    socket_path: PathBuf,
    context: DaemonContext,
    cancel_token: CancellationToken,
    /// Sequence used to name clients that do not announce an id.
    next_client: AtomicU64,
    subscribers: SubscribersMap,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        context: DaemonContext,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            context,
            cancel_token,
            next_client: AtomicU64::new(0),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Accepts clients until the cancellation token fires, then removes
    /// the socket file.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = bind_socket(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Control socket ready");

        self.spawn_event_fanout();

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Stopping control socket");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let number = self.next_client.fetch_add(1, Ordering::Relaxed);
                        self.serve(stream, number);
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }

        self.subscribers.write().await.clear();
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket_path.display(), error = %e, "Could not remove socket");
            }
        }
        Ok(())
    }

    fn serve(&self, stream: tokio::net::UnixStream, number: u64) {
        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.context.clone(),
            Arc::clone(&self.subscribers),
            number,
        );
        let subscribers = Arc::clone(&self.subscribers);

        tokio::spawn(async move {
            let Some(client_id) = handler.run().await else {
                return;
            };
            if subscribers.write().await.remove(&client_id).is_some() {
                debug!(client_id = %client_id, "Subscriber left");
            }
        });
    }

    /// Relays registry events to subscribers for the lifetime of the server.
    fn spawn_event_fanout(&self) {
        let mut events = self.context.registry.subscribe();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => fan_out(&subscribers, &event_message(&event)).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Subscribers missed session events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

/// Removes a stale socket, creates the parent directory and binds.
fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(setup(e)),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(setup)?;
    }
    UnixListener::bind(path).map_err(setup)
}

fn event_message(event: &SessionEvent) -> DaemonMessage {
    match event {
        SessionEvent::Updated { session } => DaemonMessage::session_updated((**session).clone()),
        SessionEvent::Removed { session_id, reason } => DaemonMessage::SessionRemoved {
            session_id: session_id.clone(),
            reason: reason.to_string(),
        },
    }
}

/// Writes `msg` to every subscriber, dropping those whose socket failed.
async fn fan_out(subscribers: &SubscribersMap, msg: &DaemonMessage) {
    let mut dead = Vec::new();
    for (client_id, writer) in subscribers.read().await.iter() {
        if let Err(e) = connection::write_message(writer, msg).await {
            debug!(client_id = %client_id, error = %e, "Subscriber write failed");
            dead.push(client_id.clone());
        }
    }

    if !dead.is_empty() {
        let mut subs = subscribers.write().await;
        for client_id in dead {
            subs.remove(&client_id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot listen on {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ConnectionState, SessionId, SessionView};

    use crate::session::RemovalReason;

    #[test]
    fn test_socket_setup_error_names_path() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/run/courier/ctl.sock"),
            error: "read-only file system".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot listen on /run/courier/ctl.sock: read-only file system"
        );
    }

    #[test]
    fn test_removed_event_carries_reason() {
        let event = SessionEvent::Removed {
            session_id: SessionId::new("62811"),
            reason: RemovalReason::LoggedOut,
        };
        let DaemonMessage::SessionRemoved { session_id, reason } = event_message(&event) else {
            panic!("expected session_removed");
        };
        assert_eq!(session_id.as_str(), "62811");
        assert_eq!(reason, RemovalReason::LoggedOut.to_string());
    }

    #[test]
    fn test_updated_event_carries_view() {
        let view = SessionView {
            id: SessionId::new("62822"),
            state: ConnectionState::Connecting,
            pairing_code: Some("ABCD-1234".into()),
            last_error: None,
            identity: None,
            reconnect_attempts: 0,
            updated_at: chrono::Utc::now(),
        };
        let event = SessionEvent::Updated {
            session: Box::new(view),
        };
        let DaemonMessage::SessionUpdated { session } = event_message(&event) else {
            panic!("expected session_updated");
        };
        assert_eq!(session.pairing_code.as_deref(), Some("ABCD-1234"));
    }

    #[test]
    fn test_bind_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("courier.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let _listener = bind_socket(&path).unwrap();
        });
        assert!(path.exists());
    }
}
