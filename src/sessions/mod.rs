//! Live interactive terminal sessions.
//!
//! [`TerminalRegistry`] tracks every relay that is currently driving a PTY or
//! container exec. It never owns the session I/O: each entry carries a
//! [`CancellationToken`] that the relay watches, so force-closing a terminal
//! is a map removal plus a cancel and never waits on the network.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`. `register` holds the write lock across the
//! lookup and insert so two relays with the same id cannot both be current.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::now_ms;

/// What is on the far side of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Ssh,
    Container,
}

/// Bookkeeping for one relay.
#[derive(Debug, Clone)]
pub struct TerminalEntry {
    pub session_id: String,
    pub server_id: String,
    pub kind: TerminalKind,
    /// Epoch milliseconds when the relay started.
    pub created_at: u64,
    /// Last inbound frame. Advisory; idle policy belongs to the caller.
    pub last_activity: Instant,
    cancel: CancellationToken,
}

impl TerminalEntry {
    pub fn new(session_id: impl Into<String>, server_id: impl Into<String>, kind: TerminalKind) -> Self {
        Self {
            session_id: session_id.into(),
            server_id: server_id.into(),
            kind,
            created_at: now_ms(),
            last_activity: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token the relay watches for a forced close.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Summary returned by [`TerminalRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct TerminalListItem {
    pub session_id: String,
    pub server_id: String,
    pub kind: TerminalKind,
    pub created_at: u64,
    pub idle_secs: u64,
}

/// Process-wide map of session id to live terminal relay.
///
/// Cloneable; all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone, Default)]
pub struct TerminalRegistry {
    sessions: Arc<RwLock<HashMap<String, TerminalEntry>>>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `entry`, cancelling any prior relay registered under the same id.
    pub async fn register(&self, entry: TerminalEntry) {
        let mut sessions = self.sessions.write().await;
        if let Some(old) = sessions.remove(&entry.session_id) {
            warn!(session_id = %old.session_id, "Terminal session id reused, closing previous relay");
            old.cancel.cancel();
        }
        info!(
            session_id = %entry.session_id,
            server_id = %entry.server_id,
            kind = ?entry.kind,
            "Terminal session registered"
        );
        sessions.insert(entry.session_id.clone(), entry);
    }

    pub async fn get(&self, session_id: &str) -> Option<TerminalEntry> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn unregister(&self, session_id: &str) -> Option<TerminalEntry> {
        self.sessions.write().await.remove(session_id)
    }

    /// Force-close a relay. Returns `true` if it existed.
    ///
    /// The entry stays until the relay's own teardown unregisters it.
    pub async fn disconnect(&self, session_id: &str) -> bool {
        match self.sessions.read().await.get(session_id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(session_id = %session_id, "Terminal session force-closed");
                true
            }
            None => false,
        }
    }

    /// Record activity on `session_id`.
    pub async fn touch(&self, session_id: &str) {
        if let Some(entry) = self.sessions.write().await.get_mut(session_id) {
            entry.last_activity = Instant::now();
        }
    }

    pub async fn list(&self) -> Vec<TerminalListItem> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<TerminalListItem> = sessions
            .values()
            .map(|e| TerminalListItem {
                session_id: e.session_id.clone(),
                server_id: e.server_id.clone(),
                kind: e.kind,
                created_at: e.created_at,
                idle_secs: e.last_activity.elapsed().as_secs(),
            })
            .collect();
        list.sort_by_key(|i| i.created_at);
        list
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Cancel every relay (shutdown). Returns how many were live.
    pub async fn disconnect_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for entry in sessions.values() {
            entry.cancel.cancel();
        }
        sessions.len()
    }
}
