//! In-process loopback transport.
//!
//! Every connection "succeeds" immediately. Sends are recorded and logged
//! instead of leaving the process. Unpaired sessions complete pairing as
//! soon as a pairing code is requested. Tests can drop connections with an
//! arbitrary close status to drive the reconnection supervisor.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use courier_core::{SessionId, Target};

use super::{
    CloseReason, ConnectParams, Connection, ConnectionEvent, Established, Payload, Transport,
    TransportError,
};

const EVENT_BUFFER: usize = 16;

/// A payload the loopback transport accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub session_id: SessionId,
    pub target: Target,
    pub payload: Payload,
}

#[derive(Default)]
struct LoopbackState {
    /// Sessions with stored credentials.
    registered: HashSet<SessionId>,
    sent: Vec<SentMessage>,
    live: HashMap<SessionId, Arc<LoopbackConnection>>,
    connect_count: usize,
}

/// Transport that never leaves the process.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretends credentials already exist, so connecting skips pairing.
    pub fn preregister(&self, session_id: SessionId) {
        lock(&self.state).registered.insert(session_id);
    }

    /// Everything sent so far, across all sessions.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.state).sent.clone()
    }

    /// Number of `connect` calls served.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connect_count
    }

    pub fn is_registered(&self, session_id: &SessionId) -> bool {
        lock(&self.state).registered.contains(session_id)
    }

    /// Closes the live connection for a session with the given status.
    ///
    /// Returns false when the session has no live connection.
    pub fn drop_connection(&self, session_id: &SessionId, status_code: u16) -> bool {
        let conn = lock(&self.state).live.remove(session_id);
        match conn {
            Some(conn) => {
                conn.shut(CloseReason::new(status_code));
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(
        &self,
        session_id: &SessionId,
        _params: &ConnectParams,
    ) -> Result<Established, TransportError> {
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

        let mut state = lock(&self.state);
        state.connect_count += 1;
        let registered = state.registered.contains(session_id);

        let connection = Arc::new(LoopbackConnection {
            session_id: session_id.clone(),
            state: Arc::clone(&self.state),
            events: events_tx,
            open: AtomicBool::new(registered),
            registered: AtomicBool::new(registered),
        });

        if let Some(previous) = state.live.insert(session_id.clone(), Arc::clone(&connection)) {
            previous.open.store(false, Ordering::SeqCst);
        }
        drop(state);

        if registered {
            let _ = connection.events.try_send(ConnectionEvent::Open);
        }

        debug!(session_id = %session_id, registered, "Loopback connection created");

        Ok(Established {
            connection,
            events,
        })
    }

    async fn purge_credentials(&self, session_id: &SessionId) -> Result<(), TransportError> {
        lock(&self.state).registered.remove(session_id);
        debug!(session_id = %session_id, "Loopback credentials purged");
        Ok(())
    }
}

/// Connection handed out by [`LoopbackTransport`].
pub struct LoopbackConnection {
    session_id: SessionId,
    state: Arc<Mutex<LoopbackState>>,
    events: mpsc::Sender<ConnectionEvent>,
    open: AtomicBool,
    registered: AtomicBool,
}

impl LoopbackConnection {
    fn shut(&self, reason: CloseReason) {
        if self.open.swap(false, Ordering::SeqCst) || reason.is_logged_out() {
            let _ = self.events.try_send(ConnectionEvent::Close(reason));
        }
    }
}

impl std::fmt::Debug for LoopbackConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackConnection")
            .field("session_id", &self.session_id)
            .field("open", &self.open.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn send(&self, target: &Target, payload: &Payload) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::SessionClosed);
        }

        info!(session_id = %self.session_id, target = %target, "Loopback send");
        lock(&self.state).sent.push(SentMessage {
            session_id: self.session_id.clone(),
            target: target.clone(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        lock(&self.state).registered.remove(&self.session_id);
        self.registered.store(false, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn authenticated_identity(&self) -> Option<String> {
        if self.registered.load(Ordering::SeqCst) && self.is_open() {
            Some(format!("{}@s.direct", self.session_id))
        } else {
            None
        }
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let code = suffix.to_uppercase();

        // The operator "enters" the code immediately.
        lock(&self.state).registered.insert(self.session_id.clone());
        self.registered.store(true, Ordering::SeqCst);
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.try_send(ConnectionEvent::Open);

        debug!(session_id = %self.session_id, phone = %phone_number, "Loopback pairing code issued");
        Ok(code)
    }
}

fn lock(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registered_session_opens_immediately() {
        let transport = LoopbackTransport::new();
        let id = SessionId::new("628111");
        transport.preregister(id.clone());

        let mut established = transport
            .connect(&id, &ConnectParams::default())
            .await
            .unwrap();
        assert_eq!(established.events.recv().await, Some(ConnectionEvent::Open));
        assert!(established.connection.authenticated_identity().is_some());
    }

    #[tokio::test]
    async fn test_unregistered_session_pairs_on_code_request() {
        let transport = LoopbackTransport::new();
        let id = SessionId::new("628222");

        let mut established = transport
            .connect(&id, &ConnectParams::with_phone("628222"))
            .await
            .unwrap();
        assert!(!established.connection.is_registered());
        assert!(established.connection.authenticated_identity().is_none());

        let code = established
            .connection
            .request_pairing_code("628222")
            .await
            .unwrap();
        assert_eq!(code.len(), 8);
        assert_eq!(established.events.recv().await, Some(ConnectionEvent::Open));
        assert!(transport.is_registered(&id));
    }

    #[tokio::test]
    async fn test_send_is_recorded_and_fails_after_drop() {
        let transport = LoopbackTransport::new();
        let id = SessionId::new("628333");
        transport.preregister(id.clone());
        let mut established = transport
            .connect(&id, &ConnectParams::default())
            .await
            .unwrap();
        let _ = established.events.recv().await;

        let target = Target::new("1@s.direct");
        established
            .connection
            .send(&target, &Payload::Text("hi".into()))
            .await
            .unwrap();
        assert_eq!(transport.sent().len(), 1);

        assert!(transport.drop_connection(&id, 500));
        assert_eq!(
            established.events.recv().await,
            Some(ConnectionEvent::Close(CloseReason::new(500)))
        );
        let err = established
            .connection
            .send(&target, &Payload::Text("hi".into()))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::SessionClosed);
    }
}
