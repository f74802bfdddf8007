//! Server records and the collaborators built on them.
//!
//! | Trait | Runtime implementation | Used by |
//! |-------|------------------------|---------|
//! | [`ServerStore`] | [`MemoryStore`] (seeded from `[[servers]]`) | resolve, hooks, rotation |
//! | [`Secrets`] | [`EncodedSecrets`] (base64 envelope) | resolve, token validation |
//! | [`TokenValidator`] | [`StoreTokenValidator`] | tunnel broker auth |
//! | [`SessionHooks`] | [`StoreHooks`] | tunnel broker lifecycle |
//!
//! Encryption at rest is out of scope; [`EncodedSecrets`] only keeps secrets
//! out of plain sight in config files and can be swapped for a real cipher
//! behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::activity::{now_ms, ActivitySource, ActivityType, AuditEvent, AuditSink};
use crate::auth::constant_time_eq;
use crate::ports::{ConflictResolution, Service};
use crate::tunnel::{SessionHooks, TokenValidator};

/// How a server is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectType {
    /// SSH straight to `host:port`.
    #[default]
    Direct,
    /// SSH through the agent's forwarded `ssh` service.
    Tunnel,
    /// Containers on the local Docker engine; no SSH.
    Local,
}

/// A managed server as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// `password` or `key`. Anything else is rejected at connect time.
    #[serde(default = "default_auth_type")]
    pub auth_type: String,
    /// Encoded credential (password or private key).
    #[serde(default)]
    pub secret: String,
    /// Encoded private-key passphrase.
    pub passphrase: Option<String>,
    #[serde(default)]
    pub connect_type: ConnectType,
    /// Encoded tunnel token (tunnel servers only).
    pub tunnel_token: Option<String>,
    /// Last known forwarded services.
    #[serde(default)]
    pub services: Vec<Service>,
    pub shell: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_auth_type() -> String {
    "password".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Online,
    Offline,
}

/// Persisted tunnel state for one server.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub services: Vec<Service>,
    pub last_seen: Option<u64>,
}

/// Keyed lookup/save for server metadata.
pub trait ServerStore: Send + Sync {
    fn find(&self, id: &str) -> Option<ServerRecord>;
    fn tunnel_servers(&self) -> Vec<ServerRecord>;
    fn save_tunnel_state(&self, id: &str, status: TunnelStatus, services: Option<&[Service]>);
    fn tunnel_state(&self, id: &str) -> Option<TunnelState>;
    /// Store a new encoded token. Returns `false` for unknown servers.
    fn save_tunnel_token(&self, id: &str, encoded_token: String) -> bool;
    fn count(&self) -> usize;
}

struct StoredServer {
    record: ServerRecord,
    tunnel: TunnelState,
}

/// In-process [`ServerStore`].
#[derive(Default)]
pub struct MemoryStore {
    servers: RwLock<HashMap<String, StoredServer>>,
}

impl MemoryStore {
    pub fn new(records: Vec<ServerRecord>) -> Self {
        let servers = records
            .into_iter()
            .map(|record| {
                let tunnel = TunnelState {
                    status: TunnelStatus::Offline,
                    services: record.services.clone(),
                    last_seen: None,
                };
                (record.id.clone(), StoredServer { record, tunnel })
            })
            .collect();
        Self {
            servers: RwLock::new(servers),
        }
    }
}

impl ServerStore for MemoryStore {
    fn find(&self, id: &str) -> Option<ServerRecord> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.get(id).map(|s| {
            let mut record = s.record.clone();
            record.services.clone_from(&s.tunnel.services);
            record
        })
    }

    fn tunnel_servers(&self) -> Vec<ServerRecord> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<ServerRecord> = servers
            .values()
            .filter(|s| s.record.connect_type == ConnectType::Tunnel)
            .map(|s| {
                let mut record = s.record.clone();
                record.services.clone_from(&s.tunnel.services);
                record
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn save_tunnel_state(&self, id: &str, status: TunnelStatus, services: Option<&[Service]>) {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(s) = servers.get_mut(id) {
            s.tunnel.status = status;
            s.tunnel.last_seen = Some(now_ms());
            if let Some(services) = services {
                s.tunnel.services = services.to_vec();
            }
        }
    }

    fn tunnel_state(&self, id: &str) -> Option<TunnelState> {
        let servers = self.servers.read().unwrap_or_else(PoisonError::into_inner);
        servers.get(id).map(|s| s.tunnel.clone())
    }

    fn save_tunnel_token(&self, id: &str, encoded_token: String) -> bool {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        match servers.get_mut(id) {
            Some(s) => {
                s.record.tunnel_token = Some(encoded_token);
                true
            }
            None => false,
        }
    }

    fn count(&self) -> usize {
        self.servers.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("secret is not valid base64")]
    Encoding,
    #[error("secret is not valid UTF-8")]
    Utf8,
}

/// Credential decryption collaborator.
pub trait Secrets: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError>;
    fn encrypt(&self, plaintext: &str) -> String;
}

/// Base64 envelope, standard alphabet with padding.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodedSecrets;

impl Secrets for EncodedSecrets {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| DecryptError::Encoding)?;
        String::from_utf8(bytes).map_err(|_| DecryptError::Utf8)
    }

    fn encrypt(&self, plaintext: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(plaintext.as_bytes())
    }
}

/// Validates tunnel tokens by decrypting every stored token and comparing.
///
/// O(n) in the number of tunnel servers per authentication attempt.
pub struct StoreTokenValidator {
    store: Arc<dyn ServerStore>,
    secrets: Arc<dyn Secrets>,
}

impl StoreTokenValidator {
    pub fn new(store: Arc<dyn ServerStore>, secrets: Arc<dyn Secrets>) -> Self {
        Self { store, secrets }
    }
}

impl TokenValidator for StoreTokenValidator {
    fn validate(&self, raw_token: &str) -> Option<String> {
        if raw_token.is_empty() {
            return None;
        }
        for server in self.store.tunnel_servers() {
            let Some(ref encoded) = server.tunnel_token else {
                continue;
            };
            match self.secrets.decrypt(encoded) {
                Ok(token) if constant_time_eq(token.as_bytes(), raw_token.as_bytes()) => {
                    return Some(server.id);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(server_id = %server.id, error = %e, "Stored tunnel token does not decrypt");
                }
            }
        }
        None
    }
}

/// Persists tunnel status to the store and writes the audit trail.
pub struct StoreHooks {
    store: Arc<dyn ServerStore>,
    audit: Arc<dyn AuditSink>,
}

impl StoreHooks {
    pub fn new(store: Arc<dyn ServerStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }
}

impl SessionHooks for StoreHooks {
    fn on_connect(&self, server_id: &str, services: &[Service], conflicts: &[ConflictResolution]) {
        self.store
            .save_tunnel_state(server_id, TunnelStatus::Online, Some(services));
        self.audit.record(
            AuditEvent::new(
                ActivityType::TunnelConnect,
                ActivitySource::Tunnel,
                format!("tunnel up ({} services)", services.len()),
            )
            .server(server_id)
            .detail(json!({ "services": services })),
        );
        for c in conflicts {
            warn!(
                server_id = %server_id,
                service = %c.service_name,
                old_port = c.old_port,
                new_port = c.new_port,
                "Tunnel service renumbered"
            );
            self.audit.record(
                AuditEvent::new(
                    ActivityType::TunnelPortConflict,
                    ActivitySource::Tunnel,
                    format!("{}: {} -> {}", c.service_name, c.old_port, c.new_port),
                )
                .server(server_id)
                .detail(json!(c)),
            );
        }
    }

    fn on_services_changed(&self, server_id: &str, services: &[Service]) {
        self.store
            .save_tunnel_state(server_id, TunnelStatus::Online, Some(services));
        self.audit.record(
            AuditEvent::new(
                ActivityType::TunnelServicesChanged,
                ActivitySource::Tunnel,
                format!("{} services", services.len()),
            )
            .server(server_id)
            .detail(json!({ "services": services })),
        );
    }

    fn on_disconnect(&self, server_id: &str) {
        self.store
            .save_tunnel_state(server_id, TunnelStatus::Offline, None);
        self.audit.record(
            AuditEvent::new(ActivityType::TunnelDisconnect, ActivitySource::Tunnel, "tunnel down")
                .server(server_id),
        );
    }
}
