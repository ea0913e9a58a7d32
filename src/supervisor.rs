//! Process-level session supervision.
//!
//! One run loop per process: bootstrap a session, attach the relay, wait
//! for it to end, dispose it, and go back to waiting for the next client.
//! Per-session state never survives an iteration; the root cancellation
//! token is the only thing shared across sessions.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::bootstrap::Bootstrap;
use crate::config::ConnectionContext;
use crate::error::RelayError;
use crate::logger::log;

/// Pause between failed bootstraps so a broken setup does not spin
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Unique session identifier
pub type SessionId = u64;

#[derive(Debug)]
struct SessionEntry {
    ticket: String,
    cancel: CancellationToken,
    #[allow(dead_code)]
    started: Instant,
}

/// Live sessions, tracked for shutdown teardown and logging.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    next_id: Arc<AtomicU64>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, ticket: &str, cancel: CancellationToken) -> SessionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionEntry {
                ticket: ticket.to_string(),
                cancel,
                started: Instant::now(),
            },
        );
        id
    }

    pub fn unregister(&self, id: SessionId) {
        self.sessions.remove(&id);
    }

    /// Cancel every live session. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let mut aborted = 0;
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
            aborted += 1;
        }
        aborted
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn ticket_of(&self, id: SessionId) -> Option<String> {
        self.sessions.get(&id).map(|e| e.ticket.clone())
    }
}

/// Accept-and-relay forever, until the root token fires.
///
/// Per-connection errors dispose the affected session and loop; bootstrap
/// errors are logged and the loop restarts after a short backoff. Nothing
/// short of cancellation ends the process.
pub async fn run(
    bootstrap: Bootstrap,
    ticket: String,
    context: ConnectionContext,
    cancel: CancellationToken,
) {
    let registry = SessionRegistry::new();

    while !cancel.is_cancelled() {
        let session_cancel = cancel.child_token();

        match bootstrap
            .launch(&ticket, context.clone(), &session_cancel)
            .await
        {
            Ok(relay) => {
                let id = registry.register(&ticket, session_cancel.clone());
                log::session(id, &ticket, "attached");

                let weld = relay.attach(session_cancel.clone());
                weld.await;

                relay.disconnect();
                registry.unregister(id);
                log::session(id, &ticket, "ended");
            }
            Err(RelayError::Cancelled) => break,
            Err(e) => {
                log::warn!(error = %e, "Bootstrap failed, awaiting a new session");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                }
            }
        }
    }

    let aborted = registry.abort_all();
    if aborted > 0 {
        log::info!(sessions = aborted, "Aborted live sessions on shutdown");
    }
}
