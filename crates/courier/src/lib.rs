//! courier - command-line control client for the courier daemon
//!
//! Connects to `courierd` over its Unix socket, performs the protocol
//! handshake and issues one request per invocation (or streams session
//! updates with `courier watch`).

pub mod cli;
pub mod client;
pub mod error;

pub use client::{ClientConfig, ControlClient};
pub use error::{ClientError, Result};
