//! Control connection to `courierd`.
//!
//! `ControlClient` owns one Unix socket connection: it performs the
//! handshake on connect, then exchanges newline-delimited JSON messages
//! one request at a time.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::path::PathBuf;
use std::time::Duration;

use courier_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, info};

use crate::error::{ClientError, Result};

/// Environment variable naming the daemon socket.
pub const SOCKET_ENV: &str = "COURIER_SOCKET";

/// Socket used when neither a flag nor the environment names one.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/courier.sock";

// ============================================================================
// Configuration
// ============================================================================

/// Connection settings for the control client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path to the Unix socket where the daemon listens.
    pub socket_path: PathBuf,

    /// How long to wait for a reply to a single request.
    pub request_timeout: Duration,

    /// Identifier announced during the handshake; the daemon assigns one when absent.
    pub client_id: Option<String>,
}

impl ClientConfig {
    /// Resolves the socket path: explicit flag, then `COURIER_SOCKET`, then the default.
    pub fn resolve(socket: Option<PathBuf>) -> Self {
        let socket_path = socket
            .or_else(|| std::env::var_os(SOCKET_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
        Self {
            socket_path,
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            // Dispatches run the whole iteration loop before replying.
            request_timeout: Duration::from_secs(300),
            client_id: None,
        }
    }
}

// ============================================================================
// Control Client
// ============================================================================

/// A handshaken connection to the daemon.
pub struct ControlClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    client_id: String,
    request_timeout: Duration,
}

impl ControlClient {
    /// Connects to the daemon and performs the protocol handshake.
    ///
    /// # Errors
    ///
    /// * `DaemonConnection` - socket missing or refusing connections
    /// * `VersionMismatch` - the daemon rejected or runs an incompatible version
    /// * `ProtocolError` - the daemon answered the handshake with anything else
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        debug!(socket_path = %config.socket_path.display(), "Connecting to daemon");

        let stream = UnixStream::connect(&config.socket_path)
            .await
            .map_err(|e| ClientError::DaemonConnection {
                path: config.socket_path.clone(),
                reason: e.to_string(),
            })?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
            client_id: String::new(),
            request_timeout: config.request_timeout,
        };

        client
            .send(&ClientMessage::connect(config.client_id.clone()))
            .await?;
        match client.next_message().await? {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(client_id, protocol_version = %protocol_version, "Handshake complete");
                client.client_id = client_id;
            }
            DaemonMessage::Rejected {
                reason,
                protocol_version,
            } => {
                debug!(reason, "Handshake rejected");
                if ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::ProtocolError(reason));
                }
                return Err(ClientError::VersionMismatch {
                    client_version: ProtocolVersion::CURRENT.to_string(),
                    daemon_version: protocol_version.to_string(),
                });
            }
            other => {
                return Err(ClientError::ProtocolError(format!(
                    "Unexpected response to connect: {other:?}"
                )));
            }
        }

        Ok(client)
    }

    /// Identifier the daemon assigned (or accepted) for this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Sends one request and waits for its reply.
    ///
    /// A daemon `error` reply becomes [`ClientError::Daemon`].
    pub async fn request(&mut self, message: MessageType) -> Result<DaemonMessage> {
        self.send(&ClientMessage::new(message)).await?;

        let reply = tokio::time::timeout(self.request_timeout, self.next_message())
            .await
            .map_err(|_| {
                ClientError::ProtocolError(format!(
                    "no reply within {}s",
                    self.request_timeout.as_secs()
                ))
            })??;

        into_result(reply)
    }

    /// Reads the next message from the daemon without sending anything.
    pub async fn next_message(&mut self) -> Result<DaemonMessage> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Tells the daemon this client is leaving.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }
}

/// Maps a daemon `error` reply onto [`ClientError::Daemon`].
fn into_result(reply: DaemonMessage) -> Result<DaemonMessage> {
    match reply {
        DaemonMessage::Error { message, code } => Err(ClientError::Daemon { message, code }),
        other => Ok(other),
    }
}
