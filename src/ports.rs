//! Forwarded-port pool for tunnel services.
//!
//! [`PortPool`] owns a half-open range `[start, end)` on the broker host and
//! maps each port to at most one `(server_id, service)` pair. Tunnel agents ask
//! for a port per logical service; the pool keeps the requested (or last-known)
//! port when it can and otherwise renumbers to the lowest free port, reporting
//! a [`ConflictResolution`] for every renumbering.
//!
//! ## Concurrency
//!
//! One pool is shared process-wide. Every operation takes the inner mutex for
//! its whole duration, so "check availability + commit mapping" is a single
//! critical section and two racing connects can never win the same port.
//! [`PortPool::allocate`] stages its changes on a copy of the state and only
//! commits when every requested service got a port, so a failed request leaves
//! the pool untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// One forwarded capability advertised by a tunnel agent (e.g. `ssh`, `http`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// Port on the broker host. In a request this is the preferred port
    /// (`0` = no preference).
    #[serde(rename = "tunnelPort", alias = "tunnel_port")]
    pub tunnel_port: u16,
}

impl Service {
    pub fn new(name: impl Into<String>, tunnel_port: u16) -> Self {
        Self {
            name: name.into(),
            tunnel_port,
        }
    }
}

/// Emitted when a requested port could not be honoured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub service_name: String,
    pub old_port: u16,
    pub new_port: u16,
}

/// Result of a successful [`PortPool::allocate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub services: Vec<Service>,
    pub conflicts: Vec<ConflictResolution>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortPoolError {
    #[error("port pool {start}-{end} exhausted allocating {service} for {server_id}")]
    Exhausted {
        server_id: String,
        service: String,
        start: u16,
        end: u16,
    },
    #[error("invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

type Owner = (String, String);

#[derive(Debug, Clone, Default)]
struct PoolState {
    by_port: BTreeMap<u16, Owner>,
    by_owner: HashMap<Owner, u16>,
}

impl PoolState {
    fn map(&mut self, port: u16, owner: Owner) {
        if let Some(previous) = self.by_owner.insert(owner.clone(), port) {
            if previous != port {
                self.by_port.remove(&previous);
            }
        }
        self.by_port.insert(port, owner);
    }

    fn unmap_port(&mut self, port: u16) -> Option<Owner> {
        let owner = self.by_port.remove(&port)?;
        self.by_owner.remove(&owner);
        Some(owner)
    }
}

/// Process-wide pool of forwardable ports.
///
/// Cloneable; all clones share the same inner state.
#[derive(Clone)]
pub struct PortPool {
    start: u16,
    end: u16,
    state: Arc<Mutex<PoolState>>,
}

impl PortPool {
    /// Create a pool over `[start, end)`.
    pub fn new(start: u16, end: u16) -> Result<Self, PortPoolError> {
        if start == 0 || start >= end {
            return Err(PortPoolError::InvalidRange { start, end });
        }
        Ok(Self {
            start,
            end,
            state: Arc::new(Mutex::new(PoolState::default())),
        })
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.end)
    }

    fn in_range(&self, port: u16) -> bool {
        (self.start..self.end).contains(&port)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed mappings from persisted history. Called once at startup.
    ///
    /// History is trusted: nothing is renumbered and no conflicts are
    /// reported. Entries outside the range, or for a port some earlier record
    /// already claimed, are skipped.
    pub fn load_existing<I>(&self, records: I)
    where
        I: IntoIterator<Item = (String, Vec<Service>)>,
    {
        let mut state = self.lock();
        let mut loaded = 0usize;
        for (server_id, services) in records {
            for svc in services {
                if !self.in_range(svc.tunnel_port) {
                    debug!(server_id = %server_id, service = %svc.name, port = svc.tunnel_port, "Skipping out-of-range port from history");
                    continue;
                }
                match state.by_port.get(&svc.tunnel_port) {
                    Some(owner) if owner.0 != server_id || owner.1 != svc.name => {
                        warn!(
                            server_id = %server_id,
                            service = %svc.name,
                            port = svc.tunnel_port,
                            holder = %owner.0,
                            "Port already claimed in history, skipping"
                        );
                    }
                    _ => {
                        state.map(svc.tunnel_port, (server_id.clone(), svc.name));
                        loaded += 1;
                    }
                }
            }
        }
        info!(loaded, "Port pool seeded from history");
    }

    /// Assign a port to every requested service of `server_id`.
    ///
    /// Candidates are tried in order: the port in the request (when
    /// non-zero), then the port this `(server, service)` held last. A
    /// candidate is kept when it is in range and free (or already held by the
    /// same pair). A remembered port is always still held by its pair, so the
    /// fallback to the lowest free port only happens for a service the pool
    /// has not seen, and a conflict is recorded when that service asked for a
    /// specific port. Duplicate service names in one request are collapsed to
    /// the first.
    pub fn allocate(
        &self,
        server_id: &str,
        requested: &[Service],
    ) -> Result<Allocation, PortPoolError> {
        let mut state = self.lock();
        let mut staged = state.clone();
        let mut allocation = Allocation::default();

        for req in requested {
            if allocation.services.iter().any(|s| s.name == req.name) {
                continue;
            }
            let owner: Owner = (server_id.to_string(), req.name.clone());
            let asked = Some(req.tunnel_port).filter(|p| *p != 0);
            let remembered = staged.by_owner.get(&owner).copied();

            let usable = [asked, remembered].into_iter().flatten().find(|port| {
                self.in_range(*port)
                    && staged
                        .by_port
                        .get(port)
                        .map_or(true, |holder| *holder == owner)
            });

            let port = if let Some(port) = usable {
                port
            } else {
                let Some(free) = (self.start..self.end).find(|p| !staged.by_port.contains_key(p))
                else {
                    return Err(PortPoolError::Exhausted {
                        server_id: server_id.to_string(),
                        service: req.name.clone(),
                        start: self.start,
                        end: self.end,
                    });
                };
                if let Some(old_port) = asked {
                    allocation.conflicts.push(ConflictResolution {
                        service_name: req.name.clone(),
                        old_port,
                        new_port: free,
                    });
                }
                free
            };

            staged.map(port, owner);
            allocation.services.push(Service::new(req.name.clone(), port));
        }

        *state = staged;
        drop(state);

        for c in &allocation.conflicts {
            info!(
                server_id = %server_id,
                service = %c.service_name,
                old_port = c.old_port,
                new_port = c.new_port,
                "Port conflict resolved"
            );
        }
        Ok(allocation)
    }

    /// Free every port held by `server_id`. Returns the freed ports.
    pub fn release(&self, server_id: &str) -> Vec<u16> {
        let mut state = self.lock();
        let ports: Vec<u16> = state
            .by_port
            .iter()
            .filter(|(_, owner)| owner.0 == server_id)
            .map(|(port, _)| *port)
            .collect();
        for port in &ports {
            state.unmap_port(*port);
        }
        ports
    }

    /// Free the port of a single service, if it still maps to `server_id`.
    pub fn release_service(&self, server_id: &str, service: &str, port: u16) -> bool {
        let mut state = self.lock();
        let owned = state
            .by_port
            .get(&port)
            .is_some_and(|owner| owner.0 == server_id && owner.1 == service);
        if owned {
            state.unmap_port(port);
        }
        owned
    }

    /// Current holder of `port`, as `(server_id, service)`.
    pub fn owner_of(&self, port: u16) -> Option<(String, String)> {
        self.lock().by_port.get(&port).cloned()
    }

    /// Ports currently held by `server_id`, ascending.
    pub fn ports_of(&self, server_id: &str) -> Vec<Service> {
        self.lock()
            .by_port
            .iter()
            .filter(|(_, owner)| owner.0 == server_id)
            .map(|(port, owner)| Service::new(owner.1.clone(), *port))
            .collect()
    }

    pub fn mapped_count(&self) -> usize {
        self.lock().by_port.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn svc(name: &str, port: u16) -> Service {
        Service::new(name, port)
    }

    #[test]
    fn test_rejects_empty_range() {
        assert!(PortPool::new(40000, 40000).is_err());
        assert!(PortPool::new(0, 10).is_err());
    }

    #[test]
    fn test_conflicting_preferences_renumber_second_service() {
        let pool = PortPool::new(40000, 40002).unwrap();
        let alloc = pool
            .allocate("A", &[svc("ssh", 40000), svc("http", 40000)])
            .unwrap();
        assert_eq!(alloc.services, vec![svc("ssh", 40000), svc("http", 40001)]);
        assert_eq!(
            alloc.conflicts,
            vec![ConflictResolution {
                service_name: "http".into(),
                old_port: 40000,
                new_port: 40001,
            }]
        );
    }

    #[test]
    fn test_history_is_honoured_without_conflicts() {
        let pool = PortPool::new(40000, 41000).unwrap();
        pool.load_existing(vec![("A".to_string(), vec![svc("ssh", 40005)])]);
        let alloc = pool.allocate("A", &[svc("ssh", 40005)]).unwrap();
        assert_eq!(alloc.services, vec![svc("ssh", 40005)]);
        assert!(alloc.conflicts.is_empty());
    }

    #[test]
    fn test_remembered_port_used_without_preference() {
        let pool = PortPool::new(40000, 41000).unwrap();
        pool.load_existing(vec![("A".to_string(), vec![svc("http", 40123)])]);
        let alloc = pool.allocate("A", &[svc("http", 0)]).unwrap();
        assert_eq!(alloc.services[0].tunnel_port, 40123);
        assert!(alloc.conflicts.is_empty());
    }

    #[test]
    fn test_history_blocks_other_servers() {
        let pool = PortPool::new(40000, 41000).unwrap();
        pool.load_existing(vec![("A".to_string(), vec![svc("ssh", 40000)])]);
        let alloc = pool.allocate("B", &[svc("ssh", 40000)]).unwrap();
        assert_eq!(alloc.services[0].tunnel_port, 40001);
        assert_eq!(alloc.conflicts.len(), 1);
        assert_eq!(pool.owner_of(40000), Some(("A".into(), "ssh".into())));
    }

    #[test]
    fn test_no_duplicate_ports_across_allocations() {
        let pool = PortPool::new(40000, 40100).unwrap();
        let mut seen: HashMap<u16, (String, String)> = HashMap::new();
        for server in 0..10 {
            let server_id = format!("srv-{server}");
            let alloc = pool
                .allocate(
                    &server_id,
                    &[svc("ssh", 40000), svc("http", 40001), svc("db", 0)],
                )
                .unwrap();
            for s in alloc.services {
                let owner = (server_id.clone(), s.name.clone());
                if let Some(prev) = seen.insert(s.tunnel_port, owner.clone()) {
                    assert_eq!(prev, owner, "port {} handed out twice", s.tunnel_port);
                }
            }
        }
        assert_eq!(seen.len(), 30);
        assert_eq!(pool.mapped_count(), 30);
    }

    #[test]
    fn test_exhaustion_leaves_pool_untouched() {
        let pool = PortPool::new(40000, 40002).unwrap();
        pool.allocate("A", &[svc("ssh", 0)]).unwrap();
        let err = pool
            .allocate("B", &[svc("ssh", 0), svc("http", 0)])
            .unwrap_err();
        assert!(matches!(err, PortPoolError::Exhausted { ref service, .. } if service == "http"));
        assert!(pool.ports_of("B").is_empty());
        assert_eq!(pool.mapped_count(), 1);
    }

    #[test]
    fn test_out_of_range_request_is_renumbered() {
        let pool = PortPool::new(40000, 40010).unwrap();
        let alloc = pool.allocate("A", &[svc("ssh", 22)]).unwrap();
        assert_eq!(alloc.services[0].tunnel_port, 40000);
        assert_eq!(alloc.conflicts[0].old_port, 22);
    }

    #[test]
    fn test_reconnect_with_out_of_range_request_keeps_its_port() {
        let pool = PortPool::new(40000, 40010).unwrap();
        let first = pool.allocate("A", &[svc("ssh", 22)]).unwrap();
        assert_eq!(first.services, vec![svc("ssh", 40000)]);
        assert_eq!(first.conflicts.len(), 1);

        let second = pool.allocate("A", &[svc("ssh", 22)]).unwrap();
        assert_eq!(second.services, vec![svc("ssh", 40000)]);
        assert!(second.conflicts.is_empty());
        assert_eq!(pool.mapped_count(), 1);
    }

    #[test]
    fn test_taken_request_falls_back_to_remembered_port() {
        let pool = PortPool::new(40000, 40010).unwrap();
        pool.load_existing(vec![
            ("A".to_string(), vec![svc("http", 40004)]),
            ("B".to_string(), vec![svc("ssh", 40000)]),
        ]);
        let alloc = pool.allocate("A", &[svc("http", 40000)]).unwrap();
        assert_eq!(alloc.services, vec![svc("http", 40004)]);
        assert!(alloc.conflicts.is_empty());
    }

    #[test]
    fn test_moving_service_frees_old_port() {
        let pool = PortPool::new(40000, 40010).unwrap();
        pool.allocate("A", &[svc("ssh", 40003)]).unwrap();
        pool.allocate("A", &[svc("ssh", 40004)]).unwrap();
        assert_eq!(pool.owner_of(40003), None);
        assert_eq!(pool.ports_of("A"), vec![svc("ssh", 40004)]);
    }

    #[test]
    fn test_release_frees_only_that_server() {
        let pool = PortPool::new(40000, 40010).unwrap();
        pool.allocate("A", &[svc("ssh", 0), svc("http", 0)]).unwrap();
        pool.allocate("B", &[svc("ssh", 0)]).unwrap();
        let freed: HashSet<u16> = pool.release("A").into_iter().collect();
        assert_eq!(freed, HashSet::from([40000, 40001]));
        assert_eq!(pool.ports_of("B"), vec![svc("ssh", 40002)]);
        let alloc = pool.allocate("C", &[svc("web", 0)]).unwrap();
        assert_eq!(alloc.services[0].tunnel_port, 40000);
    }

    #[test]
    fn test_release_service_checks_owner() {
        let pool = PortPool::new(40000, 40010).unwrap();
        pool.allocate("A", &[svc("ssh", 40000)]).unwrap();
        assert!(!pool.release_service("B", "ssh", 40000));
        assert!(pool.release_service("A", "ssh", 40000));
        assert_eq!(pool.mapped_count(), 0);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let pool = PortPool::new(40000, 40064).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    pool.allocate(&format!("srv-{i}"), &[svc("ssh", 40000), svc("http", 40001)])
                        .unwrap()
                })
            })
            .collect();
        let mut ports = HashSet::new();
        for h in handles {
            for s in h.join().unwrap().services {
                assert!(ports.insert(s.tunnel_port));
            }
        }
        assert_eq!(ports.len(), 16);
    }
}
