//! The per-silo metadata service.
//!
//! For every running silo with a bridge, the service binds an HTTP
//! listener at `{bridge_ip}:17832` and a UDP DNS listener at
//! `{bridge_ip}:53` — addresses only that silo can reach. Callers are
//! identified by their source IP (the silo-side veth address), so the
//! service can answer "who am I" questions without credentials.
//!
//! The daemon drives the service with [`MetadataEvent`]s. `Stopped`
//! blocks until both listeners have acknowledged shutdown, so silo
//! teardown never races the bridge IP disappearing.

pub mod dns;
pub mod http;
pub mod stats;

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use colex_core::wire::{Interface, bridge_address, routeable_address};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

/// Port of the per-silo metadata HTTP listener.
pub const METADATA_PORT: u16 = 17832;

/// Port of the per-silo DNS listener.
pub const DNS_PORT: u16 = 53;

/// Grant required to query other silos' details.
pub const GRANT_QUERY_SILOS: &str = "query_silos";

/// Lifecycle notifications from the host server.
#[derive(Debug)]
pub enum MetadataEvent {
    Started {
        name: String,
        id_hex: String,
        tags: Vec<String>,
        grants: BTreeMap<String, bool>,
        pid: i32,
        interfaces: Vec<Interface>,
    },
    Stopped {
        name: String,
        id_hex: String,
    },
}

/// What the service remembers about one running silo.
#[derive(Debug, Clone)]
pub(crate) struct MetaSilo {
    pub name: String,
    pub id_hex: String,
    pub tags: Vec<String>,
    pub grants: BTreeMap<String, bool>,
    pub pid: i32,
    pub started: SystemTime,
    pub interfaces: Vec<Interface>,
    pub bridge_ip: Option<Ipv4Addr>,
    pub routeable_ip: Option<Ipv4Addr>,
}

impl MetaSilo {
    pub fn has_grant(&self, grant: &str) -> bool {
        self.grants.get(grant).copied().unwrap_or(false)
    }

    pub fn run_seconds(&self) -> f64 {
        self.started.elapsed().map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }

    pub fn info(&self) -> SiloInfo {
        SiloInfo {
            name: self.name.clone(),
            id: self.id_hex.clone(),
            tags: self.tags.clone(),
            started_epoch: self
                .started
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            run_seconds: self.run_seconds(),
            interfaces: self.interfaces.clone(),
            bridge_ip: self.bridge_ip.map(|ip| ip.to_string()),
            routeable_ip: self.routeable_ip.map(|ip| ip.to_string()),
        }
    }
}

/// A silo as served to metadata callers.
#[derive(Debug, Clone, Serialize)]
pub struct SiloInfo {
    pub name: String,
    pub id: String,
    pub tags: Vec<String>,
    pub started_epoch: u64,
    pub run_seconds: f64,
    pub interfaces: Vec<Interface>,
    pub bridge_ip: Option<String>,
    pub routeable_ip: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub by_id: HashMap<String, MetaSilo>,
    /// name → id.
    pub by_name: HashMap<String, String>,
}

/// Shared lookup state; readers (metadata traffic) dominate writers
/// (lifecycle events, `/set-host`).
pub(crate) struct MetaState {
    pub tables: RwLock<Tables>,
    pub host_map: RwLock<BTreeMap<String, Ipv4Addr>>,
}

impl MetaState {
    /// The silo owning the silo-veth with this source address.
    pub fn silo_id_for_ip(&self, ip: IpAddr) -> Option<String> {
        let addr = ip.to_string();
        let tables = self.tables.read().expect("metadata tables lock");
        for (id, silo) in &tables.by_id {
            if routeable_address(&silo.interfaces) == Some(addr.as_str()) {
                return Some(id.clone());
            }
        }
        None
    }
}

struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    done: oneshot::Receiver<()>,
}

/// The metadata service itself. One per daemon.
pub struct MetadataService {
    state: Arc<MetaState>,
    rt: tokio::runtime::Handle,
    listeners: Mutex<HashMap<String, Vec<ListenerHandle>>>,
}

impl MetadataService {
    /// Build the service. `static_hosts` seeds the DNS host map;
    /// unparseable addresses are dropped with a warning.
    pub fn new(rt: tokio::runtime::Handle, static_hosts: &BTreeMap<String, String>) -> Self {
        let mut host_map = BTreeMap::new();
        for (host, ip) in static_hosts {
            match ip.parse::<Ipv4Addr>() {
                Ok(addr) => {
                    host_map.insert(host.clone(), addr);
                }
                Err(_) => warn!(host = %host, ip = %ip, "Dropping unparseable static host"),
            }
        }
        MetadataService {
            state: Arc::new(MetaState {
                tables: RwLock::new(Tables::default()),
                host_map: RwLock::new(host_map),
            }),
            rt,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Record or update a static hostname mapping.
    pub fn set_host(&self, host: String, ip: Ipv4Addr) {
        let mut map = self.state.host_map.write().expect("host map lock");
        map.insert(host, ip);
    }

    /// Whether the given id is known (used by tests and the reaper).
    pub fn knows_id(&self, id_hex: &str) -> bool {
        self.state
            .tables
            .read()
            .expect("metadata tables lock")
            .by_id
            .contains_key(id_hex)
    }

    /// Apply a lifecycle event. `Stopped` blocks until the silo's
    /// listeners acknowledge shutdown.
    pub fn handle_event(&self, event: MetadataEvent) {
        match event {
            MetadataEvent::Started {
                name,
                id_hex,
                tags,
                grants,
                pid,
                interfaces,
            } => {
                let bridge_ip = bridge_address(&interfaces).and_then(|a| a.parse().ok());
                let routeable_ip = routeable_address(&interfaces).and_then(|a| a.parse().ok());
                let silo = MetaSilo {
                    name: name.clone(),
                    id_hex: id_hex.clone(),
                    tags,
                    grants,
                    pid,
                    started: SystemTime::now(),
                    interfaces,
                    bridge_ip,
                    routeable_ip,
                };

                {
                    let mut tables = self.state.tables.write().expect("metadata tables lock");
                    tables.by_name.insert(name.clone(), id_hex.clone());
                    tables.by_id.insert(id_hex.clone(), silo);
                }

                if let Some(bridge_ip) = bridge_ip {
                    let handles = self.spawn_listeners(bridge_ip);
                    self.listeners
                        .lock()
                        .expect("listener table lock")
                        .insert(id_hex.clone(), handles);
                    info!(silo = %name, id = %id_hex, bridge = %bridge_ip, "Metadata listeners up");
                }
            }
            MetadataEvent::Stopped { name, id_hex } => {
                let handles = self
                    .listeners
                    .lock()
                    .expect("listener table lock")
                    .remove(&id_hex)
                    .unwrap_or_default();
                shutdown_listeners(handles);

                let mut tables = self.state.tables.write().expect("metadata tables lock");
                if tables.by_id.remove(&id_hex).is_some() {
                    // Only drop the name index if it still points at us;
                    // a replacement silo may already own the name.
                    if tables.by_name.get(&name) == Some(&id_hex) {
                        tables.by_name.remove(&name);
                    }
                    info!(silo = %name, id = %id_hex, "Metadata listeners down");
                }
            }
        }
    }

    fn spawn_listeners(&self, bridge_ip: Ipv4Addr) -> Vec<ListenerHandle> {
        let mut handles = Vec::with_capacity(2);

        let (http_tx, http_rx) = watch::channel(false);
        let (http_done_tx, http_done_rx) = oneshot::channel();
        self.rt.spawn(http::listener(
            Arc::clone(&self.state),
            bridge_ip,
            http_rx,
            http_done_tx,
        ));
        handles.push(ListenerHandle {
            shutdown: http_tx,
            done: http_done_rx,
        });

        let (dns_tx, dns_rx) = watch::channel(false);
        let (dns_done_tx, dns_done_rx) = oneshot::channel();
        self.rt.spawn(dns::listener(
            Arc::clone(&self.state),
            bridge_ip,
            dns_rx,
            dns_done_tx,
        ));
        handles.push(ListenerHandle {
            shutdown: dns_tx,
            done: dns_done_rx,
        });

        handles
    }

    /// Stop every listener; used on daemon shutdown.
    pub fn close(&self) {
        let all: Vec<ListenerHandle> = {
            let mut listeners = self.listeners.lock().expect("listener table lock");
            listeners.drain().flat_map(|(_, v)| v).collect()
        };
        shutdown_listeners(all);
    }
}

/// Re-read device counters for a silo's interface records. Devices in the
/// silo's own namespace (and devices already gone) keep zeros.
pub(crate) fn refresh_interface_stats(interfaces: &[Interface]) -> Vec<Interface> {
    use colex_core::wire::InterfaceKind;
    interfaces
        .iter()
        .map(|i| {
            let stats = match i.kind {
                InterfaceKind::Bridge | InterfaceKind::HostVeth => {
                    colex_controller::interfaces::read_interface_stats(&i.name)
                }
                _ => i.stats,
            };
            Interface {
                stats,
                ..i.clone()
            }
        })
        .collect()
}

fn shutdown_listeners(handles: Vec<ListenerHandle>) {
    for handle in &handles {
        let _ = handle.shutdown.send(true);
    }
    for handle in handles {
        // The listener may have died at bind time; a closed channel is
        // as good as an ack.
        let _ = handle.done.blocking_recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colex_core::wire::{InterfaceKind, InterfaceStats};

    fn test_interfaces(bridge: &str, silo: &str) -> Vec<Interface> {
        vec![
            Interface {
                kind: InterfaceKind::Bridge,
                name: "b0-deadbeef".to_string(),
                address: Some(bridge.to_string()),
                stats: InterfaceStats::default(),
            },
            Interface {
                kind: InterfaceKind::SiloVeth,
                name: "v0-deadbeefs".to_string(),
                address: Some(silo.to_string()),
                stats: InterfaceStats::default(),
            },
        ]
    }

    // Events with no bridge address spawn no listeners, so the sync half
    // of the service can be exercised without binding sockets.
    fn unbound_service() -> (tokio::runtime::Runtime, MetadataService) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let service = MetadataService::new(rt.handle().clone(), &BTreeMap::new());
        (rt, service)
    }

    fn started_event_no_bridge(name: &str, id: &str, silo: &str) -> MetadataEvent {
        MetadataEvent::Started {
            name: name.to_string(),
            id_hex: id.to_string(),
            tags: Vec::new(),
            grants: BTreeMap::new(),
            pid: std::process::id() as i32,
            interfaces: vec![Interface {
                kind: InterfaceKind::SiloVeth,
                name: "v0-aaaaaaaas".to_string(),
                address: Some(silo.to_string()),
                stats: InterfaceStats::default(),
            }],
        }
    }

    #[test]
    fn test_started_indexes_by_name_and_id() {
        let (_rt, service) = unbound_service();
        service.handle_event(started_event_no_bridge("svc", "aaaaaaaa", "10.0.0.2"));
        assert!(service.knows_id("aaaaaaaa"));

        let tables = service.state.tables.read().unwrap();
        assert_eq!(tables.by_name.get("svc").unwrap(), "aaaaaaaa");
    }

    #[test]
    fn test_caller_lookup_by_silo_veth_ip() {
        let (_rt, service) = unbound_service();
        service.handle_event(started_event_no_bridge("svc", "aaaaaaaa", "10.0.0.2"));

        let found = service
            .state
            .silo_id_for_ip("10.0.0.2".parse().unwrap());
        assert_eq!(found.as_deref(), Some("aaaaaaaa"));
        assert!(
            service
                .state
                .silo_id_for_ip("10.0.0.9".parse().unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_stopped_removes_only_matching_name() {
        let (_rt, service) = unbound_service();
        service.handle_event(started_event_no_bridge("svc", "aaaaaaaa", "10.0.0.2"));
        // Replacement claimed the name with a new id before the old
        // silo's Stopped arrived.
        service.handle_event(started_event_no_bridge("svc", "bbbbbbbb", "10.0.0.6"));
        service.handle_event(MetadataEvent::Stopped {
            name: "svc".to_string(),
            id_hex: "aaaaaaaa".to_string(),
        });

        assert!(!service.knows_id("aaaaaaaa"));
        assert!(service.knows_id("bbbbbbbb"));
        let tables = service.state.tables.read().unwrap();
        assert_eq!(tables.by_name.get("svc").unwrap(), "bbbbbbbb");
    }

    #[test]
    fn test_set_host_updates_map() {
        let (_rt, service) = unbound_service();
        service.set_host("registry.internal".to_string(), "10.0.0.9".parse().unwrap());
        let map = service.state.host_map.read().unwrap();
        assert_eq!(
            map.get("registry.internal"),
            Some(&"10.0.0.9".parse().unwrap())
        );
    }

    #[test]
    fn test_meta_silo_grant_and_info() {
        let mut grants = BTreeMap::new();
        grants.insert(GRANT_QUERY_SILOS.to_string(), true);
        let silo = MetaSilo {
            name: "svc".to_string(),
            id_hex: "deadbeef".to_string(),
            tags: Vec::new(),
            grants,
            pid: 1,
            started: SystemTime::now(),
            interfaces: test_interfaces("10.0.0.1", "10.0.0.2"),
            bridge_ip: Some("10.0.0.1".parse().unwrap()),
            routeable_ip: Some("10.0.0.2".parse().unwrap()),
        };
        assert!(silo.has_grant(GRANT_QUERY_SILOS));
        assert!(!silo.has_grant("other"));

        let info = silo.info();
        assert_eq!(info.id, "deadbeef");
        assert_eq!(info.bridge_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(info.routeable_ip.as_deref(), Some("10.0.0.2"));
    }
}
