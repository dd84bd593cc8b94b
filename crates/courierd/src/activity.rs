//! Bounded activity log for status polling.
//!
//! Subsystems record human-readable entries here in addition to their
//! `tracing` output. Clients poll with the last sequence number they saw.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use courier_core::{ActivityEntry, ActivityLevel, ConnectionState};

use crate::session::SessionEvent;

/// Entries kept before the oldest are dropped.
pub const ACTIVITY_CAPACITY: usize = 500;

/// Shared, bounded activity stream.
#[derive(Clone)]
pub struct ActivityLog {
    inner: Arc<Inner>,
}

struct Inner {
    entries: Mutex<VecDeque<ActivityEntry>>,
    next_seq: AtomicU64,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_CAPACITY)
    }
}

impl std::fmt::Debug for ActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityLog")
            .field("len", &self.len())
            .field("next_seq", &self.next_seq())
            .finish()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(VecDeque::with_capacity(capacity)),
                next_seq: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Appends an entry and returns its sequence number.
    pub fn record(
        &self,
        level: ActivityLevel,
        source: &str,
        message: impl Into<String>,
    ) -> u64 {
        let mut entries = self.entries();
        // Allocate under the lock so entries stay ordered by seq.
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        if entries.len() >= self.inner.capacity {
            entries.pop_front();
        }
        entries.push_back(ActivityEntry {
            seq,
            at: Utc::now(),
            level,
            source: source.to_string(),
            message: message.into(),
        });
        seq
    }

    pub fn info(&self, source: &str, message: impl Into<String>) -> u64 {
        self.record(ActivityLevel::Info, source, message)
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) -> u64 {
        self.record(ActivityLevel::Warn, source, message)
    }

    pub fn error(&self, source: &str, message: impl Into<String>) -> u64 {
        self.record(ActivityLevel::Error, source, message)
    }

    /// Entries with `seq > since`, oldest first. `None` returns everything kept.
    pub fn since(&self, since: Option<u64>) -> Vec<ActivityEntry> {
        let floor = since.unwrap_or(0);
        self.entries()
            .iter()
            .filter(|entry| entry.seq > floor)
            .cloned()
            .collect()
    }

    /// Sequence number the next entry will get.
    pub fn next_seq(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<ActivityEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Turns session events into activity entries until cancelled.
pub async fn record_session_events(
    log: ActivityLog,
    mut events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Updated { session }) => {
                    let level = match session.state {
                        ConnectionState::Error | ConnectionState::Degraded => ActivityLevel::Error,
                        _ => ActivityLevel::Info,
                    };
                    let mut message = format!("{} is {}", session.id, session.state.label());
                    if let Some(code) = &session.pairing_code {
                        message.push_str(&format!(" (pairing code {code})"));
                    }
                    if let Some(error) = &session.last_error {
                        message.push_str(&format!(": {error}"));
                    }
                    log.record(level, "session", message);
                }
                Ok(SessionEvent::Removed { session_id, reason }) => {
                    log.info("session", format!("{session_id} removed ({reason})"));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Activity recorder lagged behind session events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Activity recorder stopped");
}
