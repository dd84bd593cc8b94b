//! Session registry using the actor pattern.
//!
//! The registry is the single owner of every managed session: its
//! connection state, pairing artifact and live transport handle. It
//! receives commands via a tokio mpsc channel and publishes state
//! transitions on a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────────┐     ┌──────────────────┐
//! │   Supervisor    │────▶│ SessionRegistryActor │────▶│ Broadcast Channel│
//! │ DispatchEngine  │     └──────────────────────┘     └──────────────────┘
//! └─────────────────┘                │                          │
//!         │   RegistryCommand        │   SessionEvent           │
//!         │   (mpsc channel)         │   (broadcast)            │
//!         ▼                          ▼                          ▼
//!    connect/attach/          HashMap<SessionId,         control clients,
//!    mark/remove              SessionEntry>              activity log
//! ```

use tokio::sync::{broadcast, mpsc};

mod actor;
mod commands;
mod handle;

pub use actor::{SessionRegistryActor, MAX_SESSIONS};
pub use commands::{
    RegistryCommand, RegistryError, RemovalReason, SessionEvent, SessionTicket, StateUpdate,
};
pub use handle::RegistryHandle;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Spawn the registry actor and return a handle for interaction.
///
/// The actor stops once every handle clone has been dropped.
///
/// ```no_run
/// use courierd::session::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let registry = spawn_registry();
///     let sessions = registry.get_all_sessions().await;
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = SessionRegistryActor::new(cmd_rx, event_tx.clone());
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx, event_tx)
}
