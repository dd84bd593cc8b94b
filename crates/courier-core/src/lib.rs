//! Courier Core - Shared domain types for session-aware unit dispatch
//!
//! This crate provides the domain types shared between the daemon
//! (courierd), the control protocol and the command-line client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod activity;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod target;
pub mod unit;

// Re-exports for convenience
pub use activity::{ActivityEntry, ActivityLevel};
pub use dispatch::{
    DispatchError, DispatchOutcome, DispatchRequest, IterationSpec, DEFAULT_ITERATIONS,
};
pub use error::{DomainError, DomainResult};
pub use session::{ConnectionState, SessionId, SessionView};
pub use target::{Target, DEFAULT_DIRECT_SUFFIX};
pub use unit::{ManifestReport, UnitOrigin, UnitSummary};
