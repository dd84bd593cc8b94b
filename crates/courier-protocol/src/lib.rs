//! Courier Protocol - Control socket protocol for the courier daemon
//!
//! Newline-delimited JSON messages exchanged between control clients and
//! the daemon over a Unix socket.

pub mod message;
pub mod version;

pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
