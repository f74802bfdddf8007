//! Reverse tunnel for machines without a public address.
//!
//! Unattended agents dial the [`broker::TunnelBroker`] over SSH, authenticate
//! with a bearer token, and request remote forwards for the services they
//! expose. The broker maps each service onto a port from the
//! [`crate::ports::PortPool`] and keeps exactly one live
//! [`registry::TunnelSession`] per server.
//!
//! The broker consumes two collaborators through the traits below so it can be
//! driven in tests without a persistence layer.

pub mod broker;
pub mod registry;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ports::{ConflictResolution, Service};

/// Maps a raw bearer token to the server it belongs to.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, raw_token: &str) -> Option<String>;
}

/// Lifecycle callbacks fired by the broker. Best-effort; must not block.
pub trait SessionHooks: Send + Sync {
    fn on_connect(&self, server_id: &str, services: &[Service], conflicts: &[ConflictResolution]);

    /// A live session forwarded an additional service.
    fn on_services_changed(&self, server_id: &str, services: &[Service]) {
        let _ = (server_id, services);
    }

    fn on_disconnect(&self, server_id: &str);
}

/// Fresh tunnel token: 64 hex chars from two v4 UUIDs.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Short, log-safe identifier for a token.
pub fn token_fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest[..6].iter().map(|b| format!("{b:02x}")).collect()
}
