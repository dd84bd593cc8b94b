//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes requests to the supervisor, engine and unit registry
//! - Registers the client for session event broadcasts on `Subscribe`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use courier_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use super::DaemonContext;
use crate::session::RegistryError;
use crate::supervisor::SupervisorError;
use crate::units::{StoreError, UnitError};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Type alias for the subscribers map (keyed by client id)
pub type SubscribersMap = Arc<RwLock<HashMap<String, SubscriberWriter>>>;

/// Maximum number of concurrent event subscribers
pub(crate) const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared for event broadcast)
    writer: SubscriberWriter,

    context: DaemonContext,

    /// Shared subscribers map for event broadcasting
    subscribers: SubscribersMap,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    subscribed: bool,

    /// Counter for generating client IDs
    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        context: DaemonContext,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            context,
            subscribers,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Returns the client id if the handshake succeeded.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        if let Err(e) = self.handle_handshake().await {
            warn!(
                connection = self.connection_number,
                error = %e,
                "Handshake failed"
            );
            return None;
        }
        info!(client_id = ?self.client_id, "Client handshake completed");

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects a `Connect` message, validates the protocol version and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        let client_version = msg.protocol_version;
        if !client_version.is_compatible_with(&ProtocolVersion::CURRENT) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );

            self.send_message(DaemonMessage::rejected(&format!(
                "Protocol version {} not compatible with server version {}",
                client_version,
                ProtocolVersion::CURRENT
            )))
            .await?;

            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::rejected(
                    "Expected Connect message for handshake",
                ))
                .await?;

                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            // Subscribers may sit idle for long periods.
            let msg = if self.subscribed {
                self.read_message().await
            } else {
                timeout(READ_TIMEOUT, self.read_message())
                    .await
                    .unwrap_or(Err(ConnectionError::Timeout))
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(e)) => {
                    warn!(client_id = ?self.client_id, error = %e, "Unparsable message");
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Invalid message: {e}"),
                        "parse_error",
                    ))
                    .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(ConnectionError::Request { code, message }) => {
                    debug!(client_id = ?self.client_id, code, error = %message, "Request failed");
                    self.send_message(DaemonMessage::error_with_code(&message, code))
                        .await?;
                }
                Err(e) => {
                    error!(
                        client_id = ?self.client_id,
                        error = %e,
                        "Error handling message"
                    );
                    let _ = self
                        .send_message(DaemonMessage::error(&e.to_string()))
                        .await;
                }
            }
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let ctx = self.context.clone();

        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::OpenSession { phone_number } => {
                let session = ctx
                    .supervisor
                    .open_session(&phone_number)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::session_updated(session))
                    .await?;
            }

            MessageType::Logout { session_id } => {
                ctx.supervisor
                    .logout(&session_id)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::ack(format!("{session_id} logged out")))
                    .await?;
            }

            MessageType::ListSessions => {
                let sessions = ctx.registry.get_all_sessions().await;
                self.send_message(DaemonMessage::SessionList { sessions })
                    .await?;
            }

            MessageType::Dispatch { request } => {
                debug!(
                    client_id = ?self.client_id,
                    session_id = %request.session_id,
                    unit = %request.unit,
                    "Dispatch requested"
                );
                let outcome = ctx.engine.dispatch(request).await;
                self.send_message(DaemonMessage::DispatchResult { outcome })
                    .await?;
            }

            MessageType::ListUnits => {
                let units = ctx.units.list().await;
                self.send_message(DaemonMessage::UnitList { units }).await?;
            }

            MessageType::ReloadUnits => {
                let report = ctx.units.reload().await.map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::ReloadComplete {
                    loaded: report.loaded,
                    rejected: report.rejected,
                    failed: report.failed,
                })
                .await?;
            }

            MessageType::ReadUnit { name } => {
                let content = ctx
                    .units
                    .read_unit(&name)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::UnitSource { name, content })
                    .await?;
            }

            MessageType::SaveUnit { name, content } => {
                let report = ctx
                    .units
                    .save_unit(&name, &content)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::ReloadComplete {
                    loaded: report.loaded,
                    rejected: report.rejected,
                    failed: report.failed,
                })
                .await?;
            }

            MessageType::DeleteUnit { name } => {
                let report = ctx
                    .units
                    .delete_unit(&name)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::ReloadComplete {
                    loaded: report.loaded,
                    rejected: report.rejected,
                    failed: report.failed,
                })
                .await?;
            }

            MessageType::VerifyUnit { content } => {
                let report = ctx.units.verify_manifest(&content);
                self.send_message(DaemonMessage::VerifyReport { report })
                    .await?;
            }

            MessageType::RegisterTransient { name, content } => {
                let integrity_tag = ctx
                    .units
                    .register_transient_manifest(&name, &content)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::TransientRegistered {
                    name: name.to_lowercase(),
                    integrity_tag,
                })
                .await?;
            }

            MessageType::RemoveTransient { name } => {
                ctx.units
                    .remove_transient(&name)
                    .await
                    .map_err(ConnectionError::from)?;
                self.send_message(DaemonMessage::ack(format!("transient unit {name} removed")))
                    .await?;
            }

            MessageType::Activity { since } => {
                let entries = ctx.activity.since(since);
                let next_seq = ctx.activity.next_seq().saturating_sub(1);
                self.send_message(DaemonMessage::Activity { entries, next_seq })
                    .await?;
            }

            MessageType::Subscribe => {
                self.subscribe().await?;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    self.subscribers.write().await.remove(client_id);
                }
                self.subscribed = false;
                debug!(client_id = ?self.client_id, "Client unsubscribed from updates");
                self.send_message(DaemonMessage::ack("unsubscribed")).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::Pong { seq }).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    async fn subscribe(&mut self) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            return Err(ConnectionError::Request {
                code: "not_connected",
                message: "Must connect before subscribing".to_string(),
            });
        };

        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                return Err(ConnectionError::Request {
                    code: "too_many_subscribers",
                    message: format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                });
            }
            subs.insert(client_id.clone(), Arc::clone(&self.writer));
        }

        self.subscribed = true;
        debug!(client_id = %client_id, "Client subscribed to updates");

        // Current state first, then incremental updates.
        let sessions = self.context.registry.get_all_sessions().await;
        self.send_message(DaemonMessage::SessionList { sessions })
            .await
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );

        Ok(msg)
    }

    /// Sends a message to the client.
    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }
}

/// Serializes `msg` as one JSON line and writes it with a timeout.
pub(crate) async fn write_message(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A request was understood but could not be carried out.
    #[error("{message}")]
    Request { code: &'static str, message: String },
}

impl From<SupervisorError> for ConnectionError {
    fn from(err: SupervisorError) -> Self {
        let code = match &err {
            SupervisorError::InvalidSession(_) => "invalid_session",
            SupervisorError::Registry(RegistryError::RegistryFull { .. }) => "registry_full",
            SupervisorError::Registry(RegistryError::SessionNotFound(_)) => "session_not_found",
            SupervisorError::Registry(_) => "registry_error",
        };
        Self::Request {
            code,
            message: err.to_string(),
        }
    }
}

impl From<UnitError> for ConnectionError {
    fn from(err: UnitError) -> Self {
        let code = match &err {
            UnitError::Store(StoreError::InvalidName(_)) => "invalid_name",
            UnitError::Store(StoreError::NotFound(_)) | UnitError::TransientNotFound(_) => {
                "unit_not_found"
            }
            UnitError::Store(StoreError::Io { .. }) => "store_error",
            UnitError::Manifest(_) => "invalid_manifest",
        };
        Self::Request {
            code,
            message: err.to_string(),
        }
    }
}
