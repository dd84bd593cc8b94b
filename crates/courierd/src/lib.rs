//! courier daemon - session lifecycles, unit registry and dispatch
//!
//! This crate provides the daemon's building blocks:
//! - `session` - Session registry actor, the single owner of session state
//! - `supervisor` - Connect, pair, reconnect and logout per session
//! - `units` - Hot-reloadable unit registry over a pluggable store
//! - `engine` - Dispatch orchestrator with per-target serialization
//! - `server` - Unix socket control server for clients
//! - `transport` - Messaging transport boundary plus a loopback implementation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        courierd                              │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐      ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │─────▶│  DispatchEngine             │    │
//! │  │ (Unix Socket)   │      │  KeyedMutex per target      │    │
//! │  └────────┬────────┘      └───────┬──────────────┬──────┘    │
//! │           │                       │              │           │
//! │           ▼                       ▼              ▼           │
//! │  ┌─────────────────┐      ┌──────────────┐ ┌─────────────┐   │
//! │  │   Supervisor    │─────▶│ Registry     │ │UnitRegistry │   │
//! │  │ (session tasks) │      │ Actor        │ │ (store +    │   │
//! │  └────────┬────────┘      └──────┬───────┘ │  transient) │   │
//! │           │                      │ events  └─────────────┘   │
//! │           ▼                      ▼                           │
//! │  ┌─────────────────┐      ┌─────────────────────────────┐    │
//! │  │   Transport     │      │ ActivityLog / subscribers   │    │
//! │  └─────────────────┘      └─────────────────────────────┘    │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Production code in this crate does not panic:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod activity;
pub mod cli;
pub mod config;
pub mod engine;
pub mod lock;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod transport;
pub mod units;
