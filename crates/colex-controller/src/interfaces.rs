//! Network interface providers.
//!
//! Two variants: a loopback device configured entirely from inside the
//! silo, and a veth + bridge pair built host-side once the child's pid is
//! known. Providers contribute startup commands that the second stage runs
//! before the user command.

use std::net::Ipv4Addr;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use colex_core::naming;
use colex_core::wire::{Interface, InterfaceKind, InterfaceStats};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ControllerError;
use crate::ippool::{IpPool, IpSlice, SLICE_PREFIX};
use crate::netlink::{NetlinkSession, configure_in_netns};

/// A command the second stage runs inside the silo before the user
/// command. With `wait_for_interface` set, the stage first polls for the
/// named device to be up with at least one address; an empty `cmd` makes
/// the entry wait-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartupCommand {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub wait_for_interface: Option<String>,
}

/// Assigned device names for one veth + bridge set.
#[derive(Debug, Clone)]
struct IfaceNames {
    bridge: String,
    host_veth: String,
    silo_veth: String,
}

/// A veth + bridge attachment for one silo.
#[derive(Debug)]
pub struct IpInterface {
    pool: Arc<IpPool>,
    slice: IpSlice,
    pub internet_access: bool,
    names: Option<IfaceNames>,
    masquerade_installed: bool,
    slice_released: bool,
}

impl IpInterface {
    pub fn new(pool: Arc<IpPool>, slice: IpSlice, internet_access: bool) -> Self {
        IpInterface {
            pool,
            slice,
            internet_access,
            names: None,
            masquerade_installed: false,
            slice_released: false,
        }
    }

    pub fn bridge_ip(&self) -> Ipv4Addr {
        self.slice.bridge
    }

    pub fn silo_ip(&self) -> Ipv4Addr {
        self.slice.silo
    }
}

/// One network attachment for a silo.
#[derive(Debug)]
pub enum NetProvider {
    Loopback,
    Ip(IpInterface),
}

impl NetProvider {
    /// Whether this provider consumes an interface index.
    fn consumes_index(&self) -> bool {
        matches!(self, NetProvider::Ip(_))
    }

    /// Fix the deterministic device names. `index` counts only providers
    /// that consume one; called once during silo init.
    pub fn assign_names(&mut self, index: usize, id_hex: &str) {
        if let NetProvider::Ip(ip) = self {
            ip.names = Some(IfaceNames {
                bridge: naming::bridge_name(index, id_hex),
                host_veth: naming::host_veth_name(index, id_hex),
                silo_veth: naming::silo_veth_name(index, id_hex),
            });
        }
    }

    /// Walk `providers` assigning indices in order.
    pub fn assign_all_names(providers: &mut [NetProvider], id_hex: &str) {
        let mut index = 0;
        for provider in providers {
            if provider.consumes_index() {
                provider.assign_names(index, id_hex);
                index += 1;
            }
        }
    }

    /// Commands the second stage must run for this provider.
    pub fn silo_startup(&self) -> Vec<StartupCommand> {
        match self {
            NetProvider::Loopback => vec![StartupCommand {
                cmd: "/bin/ifconfig".to_string(),
                args: ["lo", "127.0.0.1", "netmask", "255.0.0.0", "up"]
                    .into_iter()
                    .map(String::from)
                    .collect(),
                wait_for_interface: None,
            }],
            NetProvider::Ip(ip) => {
                let Some(names) = &ip.names else {
                    return Vec::new();
                };
                if ip.internet_access {
                    vec![StartupCommand {
                        cmd: "/sbin/route".to_string(),
                        args: vec![
                            "add".to_string(),
                            "default".to_string(),
                            "gw".to_string(),
                            ip.bridge_ip().to_string(),
                        ],
                        wait_for_interface: Some(names.silo_veth.clone()),
                    }]
                } else {
                    // The address lands from the host side after the child
                    // is already running; make the startup wait for it.
                    vec![StartupCommand {
                        cmd: String::new(),
                        args: Vec::new(),
                        wait_for_interface: Some(names.silo_veth.clone()),
                    }]
                }
            }
        }
    }

    /// Host-side setup, run after the child exists (the netns move needs
    /// its pid).
    pub fn setup(&mut self, child_pid: i32) -> Result<(), ControllerError> {
        let NetProvider::Ip(ip) = self else {
            return Ok(());
        };
        let names = ip
            .names
            .clone()
            .expect("interface names assigned during init");

        let session = NetlinkSession::open()?;
        let bridge_index = session.create_bridge(&names.bridge, ip.bridge_ip(), SLICE_PREFIX)?;
        let host_index = session.create_veth_pair(&names.host_veth, &names.silo_veth)?;
        session.attach_to_bridge(host_index, bridge_index)?;
        session.move_to_netns(&names.silo_veth, child_pid)?;
        configure_in_netns(child_pid, &names.silo_veth, ip.silo_ip(), SLICE_PREFIX)?;

        if ip.internet_access {
            masquerade_rule(&names.host_veth, "-A")?;
            ip.masquerade_installed = true;
        }
        Ok(())
    }

    /// Tear down host-side state. Idempotent: safe to call on a provider
    /// that never completed setup, and safe to call twice.
    pub fn teardown(&mut self) -> Result<(), ControllerError> {
        let NetProvider::Ip(ip) = self else {
            return Ok(());
        };

        if ip.masquerade_installed {
            if let Err(e) = masquerade_rule(
                &ip.names.as_ref().expect("names set with masquerade").host_veth,
                "-D",
            ) {
                warn!(error = %e, "masquerade rule removal failed");
            }
            ip.masquerade_installed = false;
        }

        // Deleting the bridge takes the attached host veth (and with it
        // the pair) along; a bridge that is already gone is fine. The
        // slice goes back to the pool even when netlink refuses.
        let mut first_err = None;
        if let Some(names) = &ip.names {
            match NetlinkSession::open() {
                Ok(session) => {
                    if let Err(e) = session.delete_link(&names.bridge) {
                        first_err.get_or_insert(e);
                    }
                    if let Err(e) = session.delete_link(&names.host_veth) {
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_err = Some(e);
                }
            }
        }

        if !ip.slice_released {
            ip.pool.free(ip.slice);
            ip.slice_released = true;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The wire-visible interface records for this provider.
    pub fn wire_interfaces(&self) -> Vec<Interface> {
        match self {
            NetProvider::Loopback => vec![Interface {
                kind: InterfaceKind::Loopback,
                name: "lo".to_string(),
                address: Some("127.0.0.1".to_string()),
                stats: InterfaceStats::default(),
            }],
            NetProvider::Ip(ip) => {
                let Some(names) = &ip.names else {
                    return Vec::new();
                };
                vec![
                    Interface {
                        kind: InterfaceKind::Bridge,
                        name: names.bridge.clone(),
                        address: Some(ip.bridge_ip().to_string()),
                        stats: read_interface_stats(&names.bridge),
                    },
                    Interface {
                        kind: InterfaceKind::HostVeth,
                        name: names.host_veth.clone(),
                        address: None,
                        stats: read_interface_stats(&names.host_veth),
                    },
                    Interface {
                        // The device itself lives in the silo's namespace;
                        // the address is what the host assigned it.
                        kind: InterfaceKind::SiloVeth,
                        name: names.silo_veth.clone(),
                        address: Some(ip.silo_ip().to_string()),
                        stats: InterfaceStats::default(),
                    },
                ]
            }
        }
    }
}

fn masquerade_rule(host_veth: &str, action: &str) -> Result<(), ControllerError> {
    let output = Command::new("iptables")
        .args([
            "-t",
            "nat",
            action,
            "POSTROUTING",
            "-m",
            "physdev",
            "--physdev-in",
            host_veth,
            "-j",
            "MASQUERADE",
        ])
        .output()
        .map_err(|e| ControllerError::io("spawn iptables", e))?;
    if !output.status.success() {
        return Err(ControllerError::Iptables {
            action: action.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Device counters from sysfs; a device we cannot read (gone, or living in
/// another namespace) reports zeros.
pub fn read_interface_stats(device: &str) -> InterfaceStats {
    read_interface_stats_from(Path::new("/sys/class/net"), device)
}

fn read_interface_stats_from(base: &Path, device: &str) -> InterfaceStats {
    let stat = |file: &str| -> u64 {
        std::fs::read_to_string(base.join(device).join("statistics").join(file))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0)
    };
    InterfaceStats {
        rx_bytes: stat("rx_bytes"),
        tx_bytes: stat("tx_bytes"),
        rx_packets: stat("rx_packets"),
        tx_packets: stat("tx_packets"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool() -> Arc<IpPool> {
        Arc::new(IpPool::new("10.69.0.0/24").unwrap())
    }

    fn ip_provider(internet: bool) -> (Arc<IpPool>, NetProvider) {
        let pool = test_pool();
        let slice = pool.allocate().unwrap();
        let provider = NetProvider::Ip(IpInterface::new(Arc::clone(&pool), slice, internet));
        (pool, provider)
    }

    #[test]
    fn test_loopback_startup_command() {
        let cmds = NetProvider::Loopback.silo_startup();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].cmd, "/bin/ifconfig");
        assert_eq!(cmds[0].args[0], "lo");
        assert!(cmds[0].wait_for_interface.is_none());
    }

    #[test]
    fn test_name_assignment_skips_loopback() {
        let (_pool, ip) = ip_provider(false);
        let mut providers = vec![ip, NetProvider::Loopback];
        NetProvider::assign_all_names(&mut providers, "deadbeef");

        let records = providers[0].wire_interfaces();
        assert_eq!(records[0].name, "b0-deadbeef");
        assert_eq!(records[1].name, "v0-deadbeefh");
        assert_eq!(records[2].name, "v0-deadbeefs");

        // Loopback contributed no names and consumed no index.
        assert_eq!(providers[1].wire_interfaces()[0].name, "lo");
    }

    #[test]
    fn test_internet_access_adds_default_route_with_wait() {
        let (_pool, mut provider) = ip_provider(true);
        provider.assign_names(0, "deadbeef");
        let cmds = provider.silo_startup();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].cmd, "/sbin/route");
        assert_eq!(cmds[0].args, vec!["add", "default", "gw", "10.69.0.1"]);
        assert_eq!(cmds[0].wait_for_interface.as_deref(), Some("v0-deadbeefs"));
    }

    #[test]
    fn test_no_internet_emits_wait_only_entry() {
        let (_pool, mut provider) = ip_provider(false);
        provider.assign_names(0, "deadbeef");
        let cmds = provider.silo_startup();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].cmd.is_empty());
        assert_eq!(cmds[0].wait_for_interface.as_deref(), Some("v0-deadbeefs"));
    }

    #[test]
    fn test_wire_records_carry_slice_addresses() {
        let (_pool, mut provider) = ip_provider(false);
        provider.assign_names(0, "deadbeef");
        let records = provider.wire_interfaces();
        assert_eq!(records[0].kind, InterfaceKind::Bridge);
        assert_eq!(records[0].address.as_deref(), Some("10.69.0.1"));
        assert_eq!(records[2].kind, InterfaceKind::SiloVeth);
        assert_eq!(records[2].address.as_deref(), Some("10.69.0.2"));
    }

    #[test]
    fn test_teardown_returns_slice_once() {
        let (pool, mut provider) = ip_provider(false);
        // No names assigned: nothing netlink-visible to delete.
        provider.teardown().unwrap();
        provider.teardown().unwrap();

        // The slice went back exactly once: the next two allocations are
        // the returned slice followed by a fresh block.
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(a.bridge, Ipv4Addr::new(10, 69, 0, 1));
        assert_eq!(b.bridge, Ipv4Addr::new(10, 69, 0, 5));
    }

    #[test]
    fn test_interface_stats_read_from_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        let stats_dir = dir.path().join("v0-deadbeefh/statistics");
        std::fs::create_dir_all(&stats_dir).unwrap();
        std::fs::write(stats_dir.join("rx_bytes"), "1024\n").unwrap();
        std::fs::write(stats_dir.join("tx_bytes"), "2048\n").unwrap();
        std::fs::write(stats_dir.join("rx_packets"), "10\n").unwrap();
        std::fs::write(stats_dir.join("tx_packets"), "20\n").unwrap();

        let stats = read_interface_stats_from(dir.path(), "v0-deadbeefh");
        assert_eq!(stats.rx_bytes, 1024);
        assert_eq!(stats.tx_bytes, 2048);
        assert_eq!(stats.rx_packets, 10);
        assert_eq!(stats.tx_packets, 20);

        let missing = read_interface_stats_from(dir.path(), "nope");
        assert_eq!(missing.rx_bytes, 0);
    }
}
