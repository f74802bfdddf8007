//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use russh::keys::PrivateKey;
use tokio::sync::{broadcast, Semaphore};

use crate::activity::ActivityLog;
use crate::config::Config;
use crate::ports::{PortPool, PortPoolError};
use crate::resolve::Resolver;
use crate::sessions::TerminalRegistry;
use crate::sftp::SftpOptions;
use crate::store::{EncodedSecrets, MemoryStore, Secrets, ServerStore, StoreHooks, StoreTokenValidator};
use crate::tunnel::broker::{build_ssh_config, TunnelBroker};
use crate::tunnel::registry::SessionRegistry;

/// Capacity of the activity ring buffer.
const ACTIVITY_ENTRIES: usize = 200;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// For uptime.
    pub start_time: Instant,
    pub store: Arc<dyn ServerStore>,
    pub secrets: Arc<dyn Secrets>,
    pub activity_log: Arc<ActivityLog>,
    /// Tunnel broker; owns the port pool and the tunnel session registry.
    pub broker: TunnelBroker,
    /// Live interactive relays.
    pub terminals: TerminalRegistry,
    pub resolver: Resolver,
    /// Bounds concurrent SFTP operations.
    pub sftp_permits: Arc<Semaphore>,
}

impl AppState {
    /// Wire every collaborator from `config`. The port pool is seeded from
    /// the services each tunnel server last forwarded.
    pub fn new(config: Config, host_key: PrivateKey) -> Result<Self, PortPoolError> {
        let store: Arc<dyn ServerStore> = Arc::new(MemoryStore::new(config.servers.clone()));
        let secrets: Arc<dyn Secrets> = Arc::new(EncodedSecrets);
        let (activity_tx, _) = broadcast::channel(256);
        let activity_log = Arc::new(ActivityLog::new(ACTIVITY_ENTRIES, activity_tx));

        let pool = PortPool::new(config.tunnel.port_range_start, config.tunnel.port_range_end)?;
        pool.load_existing(
            store
                .tunnel_servers()
                .into_iter()
                .map(|record| (record.id, record.services)),
        );

        let tunnels = SessionRegistry::new();
        let broker = TunnelBroker::new(
            pool,
            tunnels.clone(),
            Arc::new(StoreTokenValidator::new(store.clone(), secrets.clone())),
            Arc::new(StoreHooks::new(store.clone(), activity_log.clone())),
            activity_log.clone(),
            config.tunnel.forward_bind_host.clone(),
            build_ssh_config(&config.tunnel, host_key),
        );
        let resolver = Resolver::new(
            store.clone(),
            secrets.clone(),
            tunnels,
            config.tunnel.forward_bind_host.clone(),
        );

        Ok(Self {
            sftp_permits: Arc::new(Semaphore::new(config.server.max_sftp_concurrency.max(1))),
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            secrets,
            activity_log,
            broker,
            terminals: TerminalRegistry::new(),
            resolver,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.config.server.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.config.server.command_timeout_ms)
    }

    pub fn sftp_options(&self) -> SftpOptions {
        SftpOptions {
            connect_timeout: self.connect_timeout(),
            op_timeout: self.command_timeout(),
            read_cap: self.config.server.read_cap_bytes,
        }
    }
}
