//! Live tunnel sessions keyed by server id.
//!
//! The registry holds at most one [`TunnelSession`] per server. Registering a
//! session for a server that already has one evicts the old entry first and
//! fires its shutdown token, all under the same write lock, so there is never
//! a window where two sessions are "current" (kick-old).
//!
//! Nothing here touches the network. Evicting or disconnecting a session only
//! cancels its [`CancellationToken`]; the connection task that owns the SSH
//! handle observes the cancellation and closes the socket itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::activity::now_ms;
use crate::ports::Service;

/// One authenticated tunnel connection.
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub server_id: String,
    /// Unique per connection; lets a closing connection tell whether the slot
    /// still belongs to it.
    pub conn_id: String,
    pub peer: Option<SocketAddr>,
    /// Epoch milliseconds when the agent authenticated.
    pub connected_at: u64,
    pub connected_since: Instant,
    pub services: Vec<Service>,
    shutdown: CancellationToken,
}

impl TunnelSession {
    pub fn new(server_id: impl Into<String>, peer: Option<SocketAddr>, services: Vec<Service>) -> Self {
        Self {
            server_id: server_id.into(),
            conn_id: Uuid::new_v4().to_string(),
            peer,
            connected_at: now_ms(),
            connected_since: Instant::now(),
            services,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an existing token so the connection task can watch it.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Port of the named service, if forwarded.
    pub fn service_port(&self, name: &str) -> Option<u16> {
        self.services
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.tunnel_port)
    }
}

/// Summary returned by [`SessionRegistry::list`].
#[derive(Debug, Clone, Serialize)]
pub struct TunnelListItem {
    pub server_id: String,
    pub conn_id: String,
    pub peer: Option<String>,
    pub connected_at: u64,
    pub connected_secs: u64,
    pub services: Vec<Service>,
}

/// Process-wide map of server id to live tunnel session.
///
/// Cloneable; all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, TunnelSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, server_id: &str) -> Option<TunnelSession> {
        self.sessions.read().await.get(server_id).cloned()
    }

    /// Insert `session`, evicting and shutting down any prior session for the
    /// same server. Returns the evicted session.
    pub async fn register(&self, session: TunnelSession) -> Option<TunnelSession> {
        let mut sessions = self.sessions.write().await;
        let evicted = sessions.remove(&session.server_id);
        if let Some(ref old) = evicted {
            warn!(
                server_id = %old.server_id,
                old_conn = %old.conn_id,
                new_conn = %session.conn_id,
                "Duplicate tunnel connection, evicting old session"
            );
            old.shutdown.cancel();
        }
        info!(
            server_id = %session.server_id,
            conn_id = %session.conn_id,
            services = session.services.len(),
            "Tunnel session registered"
        );
        sessions.insert(session.server_id.clone(), session);
        evicted
    }

    /// Remove the entry for `server_id` without shutting it down.
    pub async fn unregister(&self, server_id: &str) -> Option<TunnelSession> {
        self.sessions.write().await.remove(server_id)
    }

    /// Remove the entry only if it still belongs to connection `conn_id`.
    ///
    /// Returns `false` when a newer connection has taken the slot; callers use
    /// that to skip disconnect side effects for an evicted session.
    pub async fn unregister_if(&self, server_id: &str, conn_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(server_id)
            .is_some_and(|s| s.conn_id == conn_id)
        {
            sessions.remove(server_id);
            true
        } else {
            false
        }
    }

    /// Force-close the live session for `server_id` without waiting for the
    /// remote side. Returns `true` if a session existed.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(server_id);
        match removed {
            Some(session) => {
                session.shutdown.cancel();
                info!(server_id = %server_id, conn_id = %session.conn_id, "Tunnel session disconnected");
                true
            }
            None => false,
        }
    }

    /// Replace the service list of the live session, if it is still `conn_id`.
    pub async fn update_services(&self, server_id: &str, conn_id: &str, services: Vec<Service>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(server_id) {
            Some(s) if s.conn_id == conn_id => {
                s.services = services;
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<TunnelListItem> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<TunnelListItem> = sessions
            .values()
            .map(|s| TunnelListItem {
                server_id: s.server_id.clone(),
                conn_id: s.conn_id.clone(),
                peer: s.peer.map(|p| p.to_string()),
                connected_at: s.connected_at,
                connected_secs: s.connected_since.elapsed().as_secs(),
                services: s.services.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        list
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
