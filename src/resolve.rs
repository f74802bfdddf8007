//! Server id to connection target.

use std::sync::Arc;

use thiserror::Error;

use crate::connector::ConnectorConfig;
use crate::store::{ConnectType, DecryptError, Secrets, ServerStore};
use crate::tunnel::registry::SessionRegistry;

/// Name of the forwarded service that carries the agent's SSH daemon.
pub const SSH_SERVICE: &str = "ssh";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown server {0:?}")]
    UnknownServer(String),
    #[error("tunnel for {0:?} is offline")]
    TunnelOffline(String),
    #[error("tunnel for {server_id:?} does not forward {service:?}")]
    MissingService { server_id: String, service: &'static str },
    #[error("server {0:?} has no SSH endpoint")]
    NoSsh(String),
    #[error("credential for {server_id:?}: {source}")]
    Decrypt {
        server_id: String,
        #[source]
        source: DecryptError,
    },
}

impl ResolveError {
    pub fn code(&self) -> &'static str {
        match self {
            ResolveError::UnknownServer(_) => "SERVER_NOT_FOUND",
            ResolveError::TunnelOffline(_) => "TUNNEL_OFFLINE",
            ResolveError::MissingService { .. } => "MISSING_SERVICE",
            ResolveError::NoSsh(_) => "NO_SSH_ENDPOINT",
            ResolveError::Decrypt { .. } => "DECRYPT_FAILED",
        }
    }
}

/// Where a request for a server should go.
#[derive(Debug, Clone)]
pub enum Target {
    /// SSH to the effective endpoint, direct or through the tunnel.
    Ssh(ConnectorConfig),
    /// The local container engine.
    Local { server_id: String, shell: Option<String> },
}

impl Target {
    /// The SSH config, for operations that have no local variant.
    pub fn into_ssh(self) -> Result<ConnectorConfig, ResolveError> {
        match self {
            Target::Ssh(config) => Ok(config),
            Target::Local { server_id, .. } => Err(ResolveError::NoSsh(server_id)),
        }
    }
}

/// Looks up records, decrypts credentials and rewrites tunnel endpoints.
#[derive(Clone)]
pub struct Resolver {
    store: Arc<dyn ServerStore>,
    secrets: Arc<dyn Secrets>,
    tunnels: SessionRegistry,
    forward_bind_host: String,
}

impl Resolver {
    pub fn new(
        store: Arc<dyn ServerStore>,
        secrets: Arc<dyn Secrets>,
        tunnels: SessionRegistry,
        forward_bind_host: impl Into<String>,
    ) -> Self {
        Self {
            store,
            secrets,
            tunnels,
            forward_bind_host: forward_bind_host.into(),
        }
    }

    pub async fn resolve(&self, server_id: &str) -> Result<Target, ResolveError> {
        let record = self
            .store
            .find(server_id)
            .ok_or_else(|| ResolveError::UnknownServer(server_id.to_string()))?;

        let (host, port) = match record.connect_type {
            ConnectType::Local => {
                return Ok(Target::Local {
                    server_id: record.id,
                    shell: record.shell,
                })
            }
            ConnectType::Direct => (record.host.clone(), record.port),
            ConnectType::Tunnel => {
                let session = self
                    .tunnels
                    .get(server_id)
                    .await
                    .ok_or_else(|| ResolveError::TunnelOffline(server_id.to_string()))?;
                let port = session
                    .service_port(SSH_SERVICE)
                    .ok_or_else(|| ResolveError::MissingService {
                        server_id: server_id.to_string(),
                        service: SSH_SERVICE,
                    })?;
                (self.forward_bind_host.clone(), port)
            }
        };

        let decrypt = |ciphertext: &str| {
            self.secrets
                .decrypt(ciphertext)
                .map_err(|source| ResolveError::Decrypt {
                    server_id: server_id.to_string(),
                    source,
                })
        };
        let secret = decrypt(&record.secret)?;
        let passphrase = record.passphrase.as_deref().map(decrypt).transpose()?;

        Ok(Target::Ssh(ConnectorConfig {
            host,
            port,
            user: record.user,
            auth_type: record.auth_type,
            secret,
            passphrase,
            shell: record.shell,
        }))
    }
}
