//! Pairing-code handshake for sessions without stored credentials.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use courier_core::SessionId;

use crate::config::PairingConfig;
use crate::transport::{Connection, Transport, TransportError};

/// Why no pairing code could be obtained.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("phone number is required for pairing")]
    MissingPhoneNumber,

    #[error("rate limited by remote; wait before pairing again")]
    RateLimited,

    #[error("handshake timeout after {attempts} attempts")]
    HandshakeTimeout { attempts: u32 },
}

/// One pairing attempt sequence for one connection.
pub struct PairingFlow {
    session_id: SessionId,
    phone_number: Option<String>,
    transport: Arc<dyn Transport>,
    config: PairingConfig,
}

impl PairingFlow {
    pub fn new(
        session_id: SessionId,
        phone_number: Option<String>,
        transport: Arc<dyn Transport>,
        config: PairingConfig,
    ) -> Self {
        Self {
            session_id,
            phone_number,
            transport,
            config,
        }
    }

    /// Requests a pairing code, retrying per the configured schedule.
    ///
    /// Waits `initial_delay` first. A transport that is not ready is polled
    /// every `poll_interval`. The first `Unauthorized` purges local
    /// credentials and retries after `purge_retry_delay`; other failures
    /// retry after `retry_interval`. Rate limiting stops immediately.
    pub async fn run(&self, connection: &dyn Connection) -> Result<String, PairingError> {
        let phone = self
            .phone_number
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(PairingError::MissingPhoneNumber)?;

        tokio::time::sleep(self.config.initial_delay()).await;

        let mut purged = false;
        for attempt in 1..=self.config.max_attempts {
            if !connection.is_ready() {
                debug!(
                    session_id = %self.session_id,
                    attempt,
                    max = self.config.max_attempts,
                    "Waiting for transport handshake"
                );
                tokio::time::sleep(self.config.poll_interval()).await;
                continue;
            }

            info!(session_id = %self.session_id, attempt, "Requesting pairing code");
            match connection.request_pairing_code(phone).await {
                Ok(code) => return Ok(code),
                Err(TransportError::RateLimited) => return Err(PairingError::RateLimited),
                Err(TransportError::Unauthorized) if !purged => {
                    warn!(session_id = %self.session_id, "Pairing unauthorized; purging credentials");
                    purged = true;
                    if let Err(e) = self.transport.purge_credentials(&self.session_id).await {
                        warn!(session_id = %self.session_id, error = %e, "Failed to purge credentials");
                    }
                    tokio::time::sleep(self.config.purge_retry_delay()).await;
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, attempt, error = %e, "Pairing code request failed");
                    tokio::time::sleep(self.config.retry_interval()).await;
                }
            }
        }

        Err(PairingError::HandshakeTimeout {
            attempts: self.config.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use courier_core::Target;

    use crate::transport::{ConnectParams, Established, Payload};

    #[derive(Debug, Default)]
    struct ScriptedConnection {
        ready: bool,
        replies: Mutex<VecDeque<Result<String, TransportError>>>,
        requests: AtomicUsize,
    }

    impl ScriptedConnection {
        fn ready_with(replies: Vec<Result<String, TransportError>>) -> Self {
            Self {
                ready: true,
                replies: Mutex::new(replies.into()),
                requests: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&self, _: &Target, _: &Payload) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn logout(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn authenticated_identity(&self) -> Option<String> {
            None
        }
        fn is_registered(&self) -> bool {
            false
        }
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn is_open(&self) -> bool {
            true
        }
        async fn request_pairing_code(&self, _: &str) -> Result<String, TransportError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::NotReady))
        }
    }

    #[derive(Default)]
    struct CountingTransport {
        purges: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn connect(&self, _: &SessionId, _: &ConnectParams) -> Result<Established, TransportError> {
            Err(TransportError::ConnectFailed("unused".into()))
        }
        async fn purge_credentials(&self, _: &SessionId) -> Result<(), TransportError> {
            self.purges.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn assert_elapsed(start: Instant, secs: u64) {
        let elapsed = start.elapsed();
        let expected = Duration::from_secs(secs);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    fn flow(transport: Arc<CountingTransport>, phone: Option<&str>) -> PairingFlow {
        PairingFlow::new(
            SessionId::new("628123"),
            phone.map(String::from),
            transport,
            PairingConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_after_initial_delay() {
        let transport = Arc::new(CountingTransport::default());
        let conn = ScriptedConnection::ready_with(vec![Ok("ABCD1234".into())]);

        let start = Instant::now();
        let code = flow(transport, Some("628123")).run(&conn).await.unwrap();
        assert_eq!(code, "ABCD1234");
        assert_elapsed(start, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_times_out() {
        let transport = Arc::new(CountingTransport::default());
        let conn = ScriptedConnection::default();

        let start = Instant::now();
        let err = flow(transport, Some("628123")).run(&conn).await.unwrap_err();
        assert_eq!(err, PairingError::HandshakeTimeout { attempts: 8 });
        assert_eq!(conn.requests.load(Ordering::SeqCst), 0);
        // 6s initial delay + 8 polls of 3s.
        assert_elapsed(start, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_stops_immediately() {
        let transport = Arc::new(CountingTransport::default());
        let conn = ScriptedConnection::ready_with(vec![Err(TransportError::RateLimited)]);

        let err = flow(transport, Some("628123")).run(&conn).await.unwrap_err();
        assert_eq!(err, PairingError::RateLimited);
        assert_eq!(conn.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_purges_once() {
        let transport = Arc::new(CountingTransport::default());
        let conn = ScriptedConnection::ready_with(vec![
            Err(TransportError::Unauthorized),
            Err(TransportError::Unauthorized),
            Ok("ZXCV0987".into()),
        ]);

        let start = Instant::now();
        let code = flow(Arc::clone(&transport), Some("628123"))
            .run(&conn)
            .await
            .unwrap();
        assert_eq!(code, "ZXCV0987");
        assert_eq!(transport.purges.load(Ordering::SeqCst), 1);
        // 6s initial, 2s after the purge, 4s after the second failure.
        assert_elapsed(start, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_phone_fails_without_waiting() {
        let transport = Arc::new(CountingTransport::default());
        let conn = ScriptedConnection::ready_with(vec![]);

        let start = Instant::now();
        let err = flow(transport, None).run(&conn).await.unwrap_err();
        assert_eq!(err, PairingError::MissingPhoneNumber);
        assert_elapsed(start, 0);
    }
}
