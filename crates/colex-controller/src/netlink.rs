//! Netlink operations for silo networking.
//!
//! A [`NetlinkSession`] owns a single-threaded tokio runtime plus an
//! rtnetlink connection, giving the otherwise-synchronous lifecycle code a
//! blocking facade over the async netlink stack.
//!
//! Configuring the silo side of a veth pair happens from a dedicated OS
//! thread that `setns(2)`s into the child's network namespace and opens a
//! fresh netlink connection there. setns changes the namespace of the
//! calling thread only, so the work is pinned to that thread and the
//! thread exits instead of restoring.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use futures::TryStreamExt;
use nix::sched::{CloneFlags, setns};
use rtnetlink::Handle;

use crate::error::ControllerError;

/// A blocking facade over an rtnetlink connection.
pub struct NetlinkSession {
    rt: tokio::runtime::Runtime,
    handle: Handle,
}

impl NetlinkSession {
    /// Open a session against the current network namespace.
    pub fn open() -> Result<Self, ControllerError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|e| ControllerError::io("build netlink runtime", e))?;
        let guard = rt.enter();
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| ControllerError::io("open netlink socket", e))?;
        drop(guard);
        rt.spawn(connection);
        Ok(NetlinkSession { rt, handle })
    }

    /// The interface index for `name`, or `None` if no such device.
    pub fn link_index(&self, name: &str) -> Result<Option<u32>, ControllerError> {
        let handle = self.handle.clone();
        let name = name.to_string();
        self.rt.block_on(async move {
            let mut links = handle.link().get().match_name(name).execute();
            match links.try_next().await {
                Ok(Some(link)) => Ok(Some(link.header.index)),
                Ok(None) => Ok(None),
                // match_name reports a missing device as a netlink error.
                Err(rtnetlink::Error::NetlinkError(_)) => Ok(None),
                Err(e) => Err(ControllerError::Netlink(e)),
            }
        })
    }

    /// Create a bridge named `name`, give it `ip/prefix`, and bring it up.
    /// Fails with [`ControllerError::DeviceExists`] if the name is taken.
    pub fn create_bridge(
        &self,
        name: &str,
        ip: Ipv4Addr,
        prefix: u8,
    ) -> Result<u32, ControllerError> {
        if self.link_index(name)?.is_some() {
            return Err(ControllerError::DeviceExists(name.to_string()));
        }
        let handle = self.handle.clone();
        let name_owned = name.to_string();
        self.rt.block_on(async move {
            handle
                .link()
                .add()
                .bridge(name_owned.clone())
                .execute()
                .await?;
            Ok::<_, rtnetlink::Error>(())
        })?;

        let index = self
            .link_index(name)?
            .ok_or_else(|| ControllerError::DeviceNotFound(name.to_string()))?;

        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle
                .address()
                .add(index, IpAddr::V4(ip), prefix)
                .execute()
                .await?;
            handle.link().set(index).up().execute().await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(index)
    }

    /// Create a veth pair and bring the host side up. Returns the host
    /// side's index.
    pub fn create_veth_pair(
        &self,
        host_name: &str,
        silo_name: &str,
    ) -> Result<u32, ControllerError> {
        if self.link_index(host_name)?.is_some() {
            return Err(ControllerError::DeviceExists(host_name.to_string()));
        }
        let handle = self.handle.clone();
        let host_owned = host_name.to_string();
        let silo_owned = silo_name.to_string();
        self.rt.block_on(async move {
            handle
                .link()
                .add()
                .veth(host_owned, silo_owned)
                .execute()
                .await?;
            Ok::<_, rtnetlink::Error>(())
        })?;

        let index = self
            .link_index(host_name)?
            .ok_or_else(|| ControllerError::DeviceNotFound(host_name.to_string()))?;

        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle.link().set(index).up().execute().await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(index)
    }

    /// Attach device `index` to the bridge at `bridge_index`.
    pub fn attach_to_bridge(
        &self,
        index: u32,
        bridge_index: u32,
    ) -> Result<(), ControllerError> {
        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle
                .link()
                .set(index)
                .master(bridge_index)
                .execute()
                .await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(())
    }

    /// Move the device into the network namespace `pid` lives in.
    pub fn move_to_netns(&self, name: &str, pid: i32) -> Result<(), ControllerError> {
        let index = self
            .link_index(name)?
            .ok_or_else(|| ControllerError::DeviceNotFound(name.to_string()))?;
        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle
                .link()
                .set(index)
                .setns_by_pid(pid as u32)
                .execute()
                .await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(())
    }

    /// Assign `ip/prefix` to the named device and bring it up.
    pub fn add_address_and_up(
        &self,
        name: &str,
        ip: Ipv4Addr,
        prefix: u8,
    ) -> Result<(), ControllerError> {
        let index = self
            .link_index(name)?
            .ok_or_else(|| ControllerError::DeviceNotFound(name.to_string()))?;
        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle
                .address()
                .add(index, IpAddr::V4(ip), prefix)
                .execute()
                .await?;
            handle.link().set(index).up().execute().await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(())
    }

    /// Delete the named device. A device that is already gone is success.
    pub fn delete_link(&self, name: &str) -> Result<(), ControllerError> {
        let Some(index) = self.link_index(name)? else {
            return Ok(());
        };
        let handle = self.handle.clone();
        self.rt.block_on(async move {
            handle.link().del(index).execute().await?;
            Ok::<_, rtnetlink::Error>(())
        })?;
        Ok(())
    }
}

/// Configure the silo-side veth from inside the child's network namespace.
///
/// Spawns a dedicated OS thread, moves it into `/proc/{pid}/ns/net`, and
/// performs the address assignment there.
pub fn configure_in_netns(
    pid: i32,
    device: &str,
    ip: Ipv4Addr,
    prefix: u8,
) -> Result<(), ControllerError> {
    let device = device.to_string();
    let ns_path = format!("/proc/{}/ns/net", pid);

    let joiner = std::thread::Builder::new()
        .name("netns-netlink".to_string())
        .spawn(move || -> Result<(), ControllerError> {
            let ns = File::open(Path::new(&ns_path))
                .map_err(|e| ControllerError::io(format!("open {}", ns_path), e))?;
            setns(ns, CloneFlags::CLONE_NEWNET)?;
            let session = NetlinkSession::open()?;
            session.add_address_and_up(&device, ip, prefix)
        })
        .map_err(|e| ControllerError::io("spawn netns thread", e))?;

    joiner.join().map_err(|_| {
        ControllerError::io(
            "netns thread panicked",
            std::io::Error::from(std::io::ErrorKind::Other),
        )
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    // Netlink mutation requires CAP_NET_ADMIN; these tests only exercise
    // what an unprivileged test runner can.

    #[test]
    fn test_session_opens_against_host_namespace() {
        let session = match NetlinkSession::open() {
            Ok(s) => s,
            // Sandboxed builders may deny netlink sockets entirely.
            Err(_) => return,
        };
        // Loopback always exists.
        let lo = session.link_index("lo").unwrap();
        assert!(lo.is_some());
        let missing = session.link_index("definitely-not-a-dev").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_delete_missing_link_is_noop() {
        let session = match NetlinkSession::open() {
            Ok(s) => s,
            Err(_) => return,
        };
        session.delete_link("b9-00000000").unwrap();
    }
}
