//! SSH server that tunnel agents dial into.
//!
//! Each inbound connection walks `Dialed -> Authenticating -> Authenticated ->
//! ServicesRequested -> Active -> Closed`:
//!
//! - **Authenticating**: the bearer token travels in the password field (or
//!   the username, when the agent offers the `none` method). A bad password
//!   drops the connection with no retry.
//! - **ServicesRequested**: every `tcpip-forward` names a logical service in
//!   its bind address and a preferred port. The [`PortPool`] picks the real
//!   port and a TCP listener is bound on `forward_bind_host:<port>`.
//! - **Active**: the first successful forward registers the session (kick-old)
//!   and fires [`SessionHooks::on_connect`]; later forwards fire
//!   [`SessionHooks::on_services_changed`].
//! - **Closed**: `on_disconnect` fires only if this connection still owns the
//!   registry slot. Whoever removes the slot fires it, exactly once.
//!
//! Ports are sticky: a disconnect keeps the pool mapping so a reconnecting
//! agent lands on the same ports. [`TunnelBroker::release_ports`] frees them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{Auth, Handle, Session};
use russh::{Disconnect, MethodKind, MethodSet};
use serde_json::json;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::{SessionRegistry, TunnelSession};
use super::{generate_token, token_fingerprint, SessionHooks, TokenValidator};
use crate::activity::{ActivitySource, ActivityType, AuditEvent, AuditSink};
use crate::config::TunnelConfig;
use crate::ports::{ConflictResolution, PortPool, Service};
use crate::store::{ConnectType, Secrets, ServerStore};

/// How long a closing connection gets to flush its disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);
/// Bind attempts for a forward port still held by an evicted connection.
const FORWARD_BIND_ATTEMPTS: u32 = 40;
const FORWARD_BIND_RETRY: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown server {0:?}")]
    UnknownServer(String),
    #[error("server {0:?} is not a tunnel server")]
    NotTunnel(String),
    #[error("server {0:?} has a live tunnel session")]
    TunnelOnline(String),
}

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error("failed to load host key {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: russh::keys::Error,
    },
    #[error("failed to generate host key: {0}")]
    Generate(#[from] russh::keys::ssh_key::Error),
    #[error("failed to write host key {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Load the OpenSSH host key at `path`, generating an Ed25519 key when the
/// file does not exist.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey, HostKeyError> {
    if path.exists() {
        return russh::keys::load_secret_key(path, None).map_err(|source| HostKeyError::Load {
            path: path.display().to_string(),
            source,
        });
    }
    let key = write_host_key(path)?;
    info!(path = %path.display(), "Generated tunnel host key");
    Ok(key)
}

/// Generate a fresh Ed25519 key and write it to `path` with mode 0600.
pub fn write_host_key(path: &Path) -> Result<PrivateKey, HostKeyError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let pem = key.to_openssh(LineEnding::LF)?;
    let write_err = |source| HostKeyError::Write {
        path: path.display().to_string(),
        source,
    };
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(write_err)?;
    file.write_all(pem.as_bytes()).map_err(write_err)?;
    Ok(key)
}

/// russh server settings for the broker listener.
pub fn build_ssh_config(tunnel: &TunnelConfig, host_key: PrivateKey) -> russh::server::Config {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::None);
    methods.push(MethodKind::Password);

    let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
    russh::server::Config {
        auth_rejection_time: Duration::from_secs(tunnel.auth_rejection_secs),
        auth_rejection_time_initial: Some(Duration::ZERO),
        inactivity_timeout: secs(tunnel.inactivity_timeout_secs),
        keepalive_interval: secs(tunnel.keepalive_interval_secs),
        keepalive_max: 3,
        methods,
        keys: vec![host_key],
        nodelay: true,
        ..Default::default()
    }
}

/// Logical service name for a forward request.
///
/// Agents put the service name in the bind address. Plain addresses fall
/// back to a name derived from the requested port.
pub fn service_name_for(address: &str, port: u32) -> String {
    let address = address.trim();
    match address {
        "" | "localhost" | "0.0.0.0" | "127.0.0.1" | "::" | "::1" | "*" => match port {
            22 => "ssh".to_string(),
            80 | 8080 => "http".to_string(),
            443 => "https".to_string(),
            p => format!("tcp-{p}"),
        },
        name => name.to_string(),
    }
}

struct BrokerInner {
    pool: PortPool,
    registry: SessionRegistry,
    validator: Arc<dyn TokenValidator>,
    hooks: Arc<dyn SessionHooks>,
    audit: Arc<dyn AuditSink>,
    forward_bind_host: String,
    ssh_config: Arc<russh::server::Config>,
}

/// Token-authenticated reverse-forward SSH server.
///
/// Cloneable; all clones share one pool, registry and set of collaborators.
#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
}

impl TunnelBroker {
    pub fn new(
        pool: PortPool,
        registry: SessionRegistry,
        validator: Arc<dyn TokenValidator>,
        hooks: Arc<dyn SessionHooks>,
        audit: Arc<dyn AuditSink>,
        forward_bind_host: impl Into<String>,
        ssh_config: russh::server::Config,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                pool,
                registry,
                validator,
                hooks,
                audit,
                forward_bind_host: forward_bind_host.into(),
                ssh_config: Arc::new(ssh_config),
            }),
        }
    }

    pub fn pool(&self) -> &PortPool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Accept agent connections until `shutdown` fires, then disconnect every
    /// live connection and wait for them to close.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Tunnel broker listening");
        }
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let broker = self.clone();
                        let conn_shutdown = shutdown.child_token();
                        connections.spawn(
                            broker
                                .handle_connection(stream, peer, conn_shutdown)
                                .instrument(info_span!("tunnel_conn", peer = %peer)),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Tunnel accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
            while connections.try_join_next().is_some() {}
        }
        info!(live = connections.len(), "Tunnel broker stopping");
        while connections.join_next().await.is_some() {}
    }

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr, shutdown: CancellationToken) {
        debug!("Tunnel connection accepted");
        let shared = Arc::new(ConnShared::default());
        let handler = ConnectionHandler {
            broker: self.clone(),
            peer,
            server_id: None,
            shutdown: shutdown.clone(),
            shared: shared.clone(),
            forwards: HashMap::new(),
            services: Vec::new(),
            announced: false,
        };

        let running = match russh::server::run_stream(self.inner.ssh_config.clone(), stream, handler).await {
            Ok(running) => running,
            Err(e) => {
                debug!(error = %e, "SSH handshake failed");
                return;
            }
        };
        let handle = running.handle();
        tokio::pin!(running);

        let result = tokio::select! {
            result = &mut running => result,
            () = shutdown.cancelled() => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "session closed by server".into(), "en".into())
                    .await;
                match tokio::time::timeout(DISCONNECT_GRACE, &mut running).await {
                    Ok(result) => result,
                    Err(_) => {
                        debug!("Timed out waiting for session to close");
                        Ok(())
                    }
                }
            }
        };
        // Stops this connection's forward listeners.
        shutdown.cancel();

        if let Err(e) = result {
            debug!(error = %e, "Tunnel session ended with error");
        }

        let Some((server_id, conn_id)) = shared.registered() else {
            debug!("Tunnel connection closed before registering");
            return;
        };
        if self.inner.registry.unregister_if(&server_id, &conn_id).await {
            info!(server_id = %server_id, conn_id = %conn_id, "Tunnel disconnected");
            self.inner.hooks.on_disconnect(&server_id);
        } else {
            debug!(server_id = %server_id, conn_id = %conn_id, "Tunnel slot already taken over, skipping disconnect hook");
        }
    }

    /// Force-close the live session for `server_id`.
    pub async fn kick(&self, server_id: &str) -> bool {
        if !self.inner.registry.disconnect(server_id).await {
            return false;
        }
        self.inner.hooks.on_disconnect(server_id);
        self.inner.audit.record(
            AuditEvent::new(ActivityType::TunnelKicked, ActivitySource::Rest, "tunnel kicked")
                .server(server_id),
        );
        true
    }

    /// Issue a new token for `server_id`, persist it and evict the live
    /// session. The plaintext token is returned once and never stored.
    pub async fn rotate(
        &self,
        store: &dyn ServerStore,
        secrets: &dyn Secrets,
        server_id: &str,
    ) -> Result<String, BrokerError> {
        let record = store
            .find(server_id)
            .ok_or_else(|| BrokerError::UnknownServer(server_id.to_string()))?;
        if record.connect_type != ConnectType::Tunnel {
            return Err(BrokerError::NotTunnel(server_id.to_string()));
        }
        let token = generate_token();
        if !store.save_tunnel_token(server_id, secrets.encrypt(&token)) {
            return Err(BrokerError::UnknownServer(server_id.to_string()));
        }
        let evicted = self.inner.registry.disconnect(server_id).await;
        if evicted {
            self.inner.hooks.on_disconnect(server_id);
        }
        info!(server_id = %server_id, token = %token_fingerprint(&token), evicted, "Tunnel token rotated");
        self.inner.audit.record(
            AuditEvent::new(ActivityType::TunnelTokenRotated, ActivitySource::Rest, "tunnel token rotated")
                .server(server_id)
                .detail(json!({ "evicted": evicted, "fingerprint": token_fingerprint(&token) })),
        );
        Ok(token)
    }

    /// Drop the sticky port reservations of an offline server.
    pub async fn release_ports(&self, server_id: &str) -> Result<Vec<u16>, BrokerError> {
        if self.inner.registry.get(server_id).await.is_some() {
            return Err(BrokerError::TunnelOnline(server_id.to_string()));
        }
        let ports = self.inner.pool.release(server_id);
        info!(server_id = %server_id, ports = ?ports, "Released tunnel ports");
        self.inner.audit.record(
            AuditEvent::new(
                ActivityType::TunnelPortsReleased,
                ActivitySource::Rest,
                format!("released {} ports", ports.len()),
            )
            .server(server_id)
            .detail(json!({ "ports": ports })),
        );
        Ok(ports)
    }
}

/// Registration written by the handler and read by the connection task
/// after the SSH session ends.
#[derive(Default)]
struct ConnShared {
    registered: Mutex<Option<(String, String)>>,
}

impl ConnShared {
    /// `(server_id, conn_id)` while this connection holds the slot.
    fn registered(&self) -> Option<(String, String)> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_registered(&self, value: Option<(String, String)>) {
        *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = value;
    }
}

struct Forward {
    address: String,
    requested_port: u32,
    port: u16,
    cancel: CancellationToken,
}

/// Per-connection russh handler.
struct ConnectionHandler {
    broker: TunnelBroker,
    peer: SocketAddr,
    server_id: Option<String>,
    shutdown: CancellationToken,
    shared: Arc<ConnShared>,
    /// Active forwards keyed by service name.
    forwards: HashMap<String, Forward>,
    services: Vec<Service>,
    announced: bool,
}

impl ConnectionHandler {
    fn try_token(&mut self, token: &str) -> bool {
        match self.broker.inner.validator.validate(token) {
            Some(server_id) => {
                info!(
                    peer = %self.peer,
                    server_id = %server_id,
                    token = %token_fingerprint(token),
                    "Tunnel agent authenticated"
                );
                self.server_id = Some(server_id);
                true
            }
            None => false,
        }
    }

    /// Register this connection as the live session for `server_id`,
    /// evicting any older one.
    async fn ensure_registered(&mut self, server_id: &str) -> String {
        if let Some((_, conn_id)) = self.shared.registered() {
            return conn_id;
        }
        let session = TunnelSession::new(server_id, Some(self.peer), Vec::new())
            .with_shutdown(self.shutdown.clone());
        let conn_id = session.conn_id.clone();
        if let Some(old) = self.broker.inner.registry.register(session).await {
            info!(server_id = %server_id, old_peer = ?old.peer, "Evicted previous tunnel session");
        }
        self.shared
            .set_registered(Some((server_id.to_string(), conn_id.clone())));
        conn_id
    }

    /// Bind the listener for a forward.
    ///
    /// The port may still be held by this server's previous connection,
    /// which stays live until a newer one takes the slot. In that case the
    /// old session is evicted first and the bind retried while its listeners
    /// wind down.
    async fn bind_listener(&mut self, server_id: &str, port: u16) -> std::io::Result<TcpListener> {
        let host = self.broker.inner.forward_bind_host.clone();
        match TcpListener::bind((host.as_str(), port)).await {
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && self.shared.registered().is_none() => {
                let held_by_previous = self
                    .broker
                    .inner
                    .registry
                    .get(server_id)
                    .await
                    .is_some_and(|live| live.services.iter().any(|s| s.tunnel_port == port));
                if !held_by_previous {
                    return Err(e);
                }
                self.ensure_registered(server_id).await;
                bind_forward(&host, port).await
            }
            result => result,
        }
    }

    /// Give the slot back when the first forward could not be set up.
    async fn withdraw(&mut self, server_id: &str) {
        let Some((_, conn_id)) = self.shared.registered() else {
            return;
        };
        self.shared.set_registered(None);
        if self.broker.inner.registry.unregister_if(server_id, &conn_id).await {
            // The evicted session skipped its own hook when it lost the slot.
            self.broker.inner.hooks.on_disconnect(server_id);
        }
    }

    fn fail_allocation(&self, server_id: &str, service: &str, error: &crate::ports::PortPoolError) {
        warn!(peer = %self.peer, server_id = %server_id, service = %service, error = %error, "Tunnel port allocation failed");
        self.broker.inner.audit.record(
            AuditEvent::new(
                ActivityType::TunnelAllocationFailed,
                ActivitySource::Tunnel,
                error.to_string(),
            )
            .server(server_id)
            .detail(json!({ "service": service })),
        );
        self.shutdown.cancel();
    }

    fn announce(&mut self, server_id: &str, conflicts: &[ConflictResolution]) {
        let hooks = &self.broker.inner.hooks;
        if self.announced {
            for c in conflicts {
                self.broker.inner.audit.record(
                    AuditEvent::new(
                        ActivityType::TunnelPortConflict,
                        ActivitySource::Tunnel,
                        format!("{}: {} -> {}", c.service_name, c.old_port, c.new_port),
                    )
                    .server(server_id)
                    .detail(json!(c)),
                );
            }
            hooks.on_services_changed(server_id, &self.services);
        } else {
            hooks.on_connect(server_id, &self.services, conflicts);
            self.announced = true;
        }
    }
}

fn password_only() -> MethodSet {
    let mut methods = MethodSet::empty();
    methods.push(MethodKind::Password);
    methods
}

impl russh::server::Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.try_token(user) {
            return Ok(Auth::Accept);
        }
        Ok(Auth::Reject {
            proceed_with_methods: Some(password_only()),
            partial_success: false,
        })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let token = if password.is_empty() { user } else { password };
        if self.try_token(token) {
            return Ok(Auth::Accept);
        }
        debug!(peer = %self.peer, "Tunnel token rejected");
        Err(russh::Error::Disconnect)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(server_id) = self.server_id.clone() else {
            return Err(russh::Error::Disconnect);
        };
        let name = service_name_for(address, *port);
        if let Some(existing) = self.forwards.get(&name) {
            *port = u32::from(existing.port);
            return Ok(true);
        }

        let preferred = u16::try_from(*port).unwrap_or(0);
        let allocation = match self
            .broker
            .inner
            .pool
            .allocate(&server_id, &[Service::new(name.clone(), preferred)])
        {
            Ok(allocation) => allocation,
            Err(e) => {
                self.fail_allocation(&server_id, &name, &e);
                return Err(russh::Error::Disconnect);
            }
        };
        let Some(assigned) = allocation.services.first().map(|s| s.tunnel_port) else {
            return Ok(false);
        };

        let listener = match self.bind_listener(&server_id, assigned).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(server_id = %server_id, service = %name, port = assigned, error = %e, "Failed to bind forward listener");
                self.broker.inner.pool.release_service(&server_id, &name, assigned);
                if self.services.is_empty() {
                    self.withdraw(&server_id).await;
                }
                return Ok(false);
            }
        };
        // Only a connection with a working forward holds the slot.
        let conn_id = self.ensure_registered(&server_id).await;

        let requested_port = if *port == 0 { u32::from(assigned) } else { *port };
        *port = u32::from(assigned);
        let cancel = self.shutdown.child_token();
        tokio::spawn(
            run_forward(
                listener,
                session.handle(),
                address.to_string(),
                requested_port,
                cancel.clone(),
            )
            .instrument(info_span!("forward", server_id = %server_id, service = %name, port = assigned)),
        );

        info!(server_id = %server_id, service = %name, port = assigned, "Tunnel forward active");
        self.forwards.insert(
            name.clone(),
            Forward {
                address: address.to_string(),
                requested_port,
                port: assigned,
                cancel,
            },
        );
        self.services.push(Service::new(name, assigned));
        self.broker
            .inner
            .registry
            .update_services(&server_id, &conn_id, self.services.clone())
            .await;
        self.announce(&server_id, &allocation.conflicts);
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(server_id) = self.server_id.clone() else {
            return Ok(false);
        };
        let Some(name) = self
            .forwards
            .iter()
            .find(|(_, f)| f.address == address && (f.requested_port == port || u32::from(f.port) == port))
            .map(|(name, _)| name.clone())
        else {
            return Ok(false);
        };
        if let Some(forward) = self.forwards.remove(&name) {
            forward.cancel.cancel();
        }
        self.services.retain(|s| s.name != name);
        info!(server_id = %server_id, service = %name, "Tunnel forward cancelled");

        if let Some((_, conn_id)) = self.shared.registered() {
            if self
                .broker
                .inner
                .registry
                .update_services(&server_id, &conn_id, self.services.clone())
                .await
            {
                self.broker.inner.hooks.on_services_changed(&server_id, &self.services);
            }
        }
        Ok(true)
    }
}

async fn bind_forward(host: &str, port: u16) -> std::io::Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind((host, port)).await {
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt + 1 < FORWARD_BIND_ATTEMPTS => {
                attempt += 1;
                tokio::time::sleep(FORWARD_BIND_RETRY).await;
            }
            result => return result,
        }
    }
}

/// Accept local connections on a forward port and pipe each one through a
/// `forwarded-tcpip` channel to the agent.
async fn run_forward(
    listener: TcpListener,
    handle: Handle,
    address: String,
    remote_port: u32,
    cancel: CancellationToken,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Forward accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };
        let handle = handle.clone();
        let address = address.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move {
                let channel = match handle
                    .channel_open_forwarded_tcpip(
                        address,
                        remote_port,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(e) => {
                        debug!(error = %e, "Agent refused forwarded channel");
                        return;
                    }
                };
                let mut remote = channel.into_stream();
                tokio::select! {
                    () = cancel.cancelled() => {}
                    result = copy_bidirectional(&mut stream, &mut remote) => match result {
                        Ok((up, down)) => debug!(up, down, "Forwarded connection closed"),
                        Err(e) => debug!(error = %e, "Forwarded connection failed"),
                    },
                }
            }
            .in_current_span(),
        );
    }
    debug!("Forward listener stopped");
}
