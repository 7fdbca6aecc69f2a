//! The silo lifecycle state machine.
//!
//! A silo moves `Setup → Pending → Running → Finished`, with
//! `InternalError` reachable from any state on an unrecoverable assembly
//! failure. `close` reclaims whatever exists regardless of how far the
//! silo got.

use std::collections::BTreeMap;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use colex_core::SiloId;
use colex_core::spec::Resources;
use colex_core::wire::Interface;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::warn;

use crate::bases::{BaseProvider, BindMount};
use crate::cgroups::{CgroupConfig, CgroupSet};
use crate::error::ControllerError;
use crate::interfaces::NetProvider;
use crate::namespaces::{CloneSpec, parent_to_root_spec, spawn_silo_child};
use crate::reexec::{InvocationInfo, write_invocation};

/// Used when no nameservers are configured for a silo.
const FALLBACK_NAMESERVER: &str = "8.8.8.8";

/// The states a silo may be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiloState {
    Setup,
    InternalError,
    Pending,
    Running,
    Finished,
}

/// Configuration of a silo, populated by the caller and then finalized.
#[derive(Debug, Default)]
pub struct SiloOptions {
    // metadata
    pub class: String,
    pub tags: Vec<String>,
    pub grants: BTreeMap<String, bool>,

    // filesystem
    pub bases: Vec<BaseProvider>,
    pub root: Option<PathBuf>,

    // accounts
    pub disable_user_namespace: bool,

    // network
    pub hostname: Option<String>,
    pub interfaces: Vec<NetProvider>,
    pub nameservers: Vec<String>,
    pub host_map: BTreeMap<String, String>,

    // resources
    pub resources: Resources,

    // invocation
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
}

impl SiloOptions {
    /// Register a filesystem provider.
    pub fn add_fs(&mut self, base: BaseProvider) {
        self.bases.push(base);
    }

    /// Apply defaults. Call once after the options are populated and
    /// before building the silo. When no nameservers are configured, a
    /// silo with a bridge resolves through the host first, then the
    /// public fallback.
    pub fn finalize(&mut self, bridge_ip: Option<Ipv4Addr>) {
        self.env.push("PS1=\\u@\\h:\\w> ".to_string());
        self.env.push(format!("CLASS={}", self.class));
        self.bases.push(BaseProvider::DevNodes);
        if self.nameservers.is_empty() {
            if let Some(bridge) = bridge_ip {
                self.nameservers.push(bridge.to_string());
            }
            self.nameservers.push(FALLBACK_NAMESERVER.to_string());
        }
        self.host_map
            .entry("localhost".to_string())
            .or_insert_with(|| "127.0.0.1".to_string());
    }
}

/// A silo and everything it owns.
#[derive(Debug)]
pub struct Silo {
    pub id: SiloId,
    pub id_hex: String,
    pub state: SiloState,

    pub name: String,
    pub class: String,
    pub tags: Vec<String>,
    pub grants: BTreeMap<String, bool>,

    root: Option<PathBuf>,
    should_delete_root: bool,
    no_user_ns: bool,

    hostname: String,
    pub interfaces: Vec<NetProvider>,
    nameservers: Vec<String>,
    host_map: BTreeMap<String, String>,

    bases: Vec<BaseProvider>,
    resources: Resources,

    cmd: String,
    args: Vec<String>,
    env: Vec<String>,

    clone_spec: Option<CloneSpec>,
    child: Option<Pid>,
    cgroups: Option<CgroupSet>,
    closed: bool,
}

impl Silo {
    /// Create a silo in the `Setup` state.
    pub fn new(name: impl Into<String>, opts: SiloOptions) -> Self {
        let id = SiloId::generate();
        let id_hex = id.hex();
        let hostname = opts.hostname.unwrap_or_else(|| id_hex.clone());
        Silo {
            id,
            id_hex,
            state: SiloState::Setup,
            name: name.into(),
            class: opts.class,
            tags: opts.tags,
            grants: opts.grants,
            root: opts.root,
            should_delete_root: false,
            no_user_ns: opts.disable_user_namespace,
            hostname,
            interfaces: opts.interfaces,
            nameservers: opts.nameservers,
            host_map: opts.host_map,
            bases: opts.bases,
            resources: opts.resources,
            cmd: opts.cmd,
            args: opts.args,
            env: opts.env,
            clone_spec: None,
            child: None,
            cgroups: None,
            closed: false,
        }
    }

    /// The silo's root directory, once one exists.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// The child's pid while the silo is running.
    pub fn pid(&self) -> Option<i32> {
        self.child.map(Pid::as_raw)
    }

    /// Wire-visible records for every interface.
    pub fn wire_interfaces(&self) -> Vec<Interface> {
        self.interfaces
            .iter()
            .flat_map(NetProvider::wire_interfaces)
            .collect()
    }

    /// Assemble the root filesystem and prepare the clone.
    /// `Setup → Pending`.
    pub fn init(&mut self) -> Result<(), ControllerError> {
        if self.state != SiloState::Setup {
            return Err(ControllerError::AlreadyRunning);
        }

        if self.root.is_none() {
            let dir = tempfile::Builder::new()
                .prefix(&format!("s{}", self.id_hex))
                .tempdir()
                .map_err(|e| ControllerError::io("create silo root", e))?;
            self.root = Some(dir.into_path());
            self.should_delete_root = true;
        }
        let root = self.root.clone().expect("root just ensured");

        NetProvider::assign_all_names(&mut self.interfaces, &self.id_hex);

        for base in &self.bases {
            if let Err(e) = base.setup(&root) {
                self.state = SiloState::InternalError;
                return Err(e);
            }
        }

        if let Err(e) = self.write_descriptor(&root) {
            self.state = SiloState::InternalError;
            return Err(e);
        }
        if let Err(e) = self.write_resolv_and_hosts(&root) {
            self.state = SiloState::InternalError;
            return Err(e);
        }

        self.clone_spec = Some(parent_to_root_spec(!self.no_user_ns));
        self.state = SiloState::Pending;
        Ok(())
    }

    /// Spawn the child and attach networking and cgroups.
    /// `Pending → Running`.
    pub fn start(&mut self) -> Result<(), ControllerError> {
        if self.state != SiloState::Pending {
            return Err(ControllerError::NotPending);
        }
        let root = self.root.clone().expect("pending silo has a root");
        let spec = self.clone_spec.clone().expect("pending silo has clone spec");

        self.state = SiloState::Running;
        let child = match spawn_silo_child(&root, &spec) {
            Ok(pid) => pid,
            Err(e) => {
                self.state = SiloState::InternalError;
                return Err(e);
            }
        };
        self.child = Some(child);

        for interface in &mut self.interfaces {
            if let Err(e) = interface.setup(child.as_raw()) {
                self.state = SiloState::InternalError;
                return Err(e);
            }
        }

        let cfg = CgroupConfig::from_resources(&self.resources);
        match CgroupSet::create(&self.id_hex, child.as_raw(), &cfg) {
            Ok(set) => self.cgroups = Some(set),
            Err(e) => {
                self.state = SiloState::InternalError;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Block until the child exits. Legal only in `Running`; returns the
    /// exit status (128+signal for signalled exits).
    pub fn wait(&self) -> Result<i32, ControllerError> {
        if self.state != SiloState::Running {
            return Err(ControllerError::NotRunning);
        }
        let pid = self.child.ok_or(ControllerError::NotRunning)?;
        wait_child(pid.as_raw())
    }

    /// Kill the child if needed and reclaim everything the silo owns.
    /// Callable from any state; calls after the first return Ok and do
    /// nothing.
    pub fn close(&mut self) -> Result<(), ControllerError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err: Option<ControllerError> = None;

        if self.state == SiloState::Running {
            if let Some(pid) = self.child {
                // kill(pid, 0) probes liveness without sending anything.
                if kill(pid, None).is_ok() {
                    if let Err(e) = kill(pid, Signal::SIGKILL) {
                        warn!(silo = %self.id_hex, error = %e, "SIGKILL failed");
                        first_err.get_or_insert(ControllerError::Sys(e));
                    }
                }
            }
        }
        self.state = SiloState::Finished;

        if let Some(root) = self.root.clone() {
            for base in &self.bases {
                if let Err(e) = base.teardown(&root) {
                    warn!(silo = %self.id_hex, error = %e, "base teardown failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        for interface in &mut self.interfaces {
            if let Err(e) = interface.teardown() {
                warn!(silo = %self.id_hex, error = %e, "interface teardown failed");
                first_err.get_or_insert(e);
            }
        }

        if let Some(mut cgroups) = self.cgroups.take() {
            if let Err(e) = cgroups.close() {
                warn!(silo = %self.id_hex, error = %e, "cgroup removal failed");
                first_err.get_or_insert(e);
            }
        }

        if self.should_delete_root {
            if let Some(root) = self.root.take() {
                match fs::remove_dir_all(&root) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(silo = %self.id_hex, error = %e, "root removal failed");
                        first_err.get_or_insert(ControllerError::io(
                            format!("remove {}", root.display()),
                            e,
                        ));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write_descriptor(&self, root: &Path) -> Result<(), ControllerError> {
        let startup = self
            .interfaces
            .iter()
            .flat_map(NetProvider::silo_startup)
            .collect();
        let binds: Vec<BindMount> = self
            .bases
            .iter()
            .filter_map(|b| b.bind_request().cloned())
            .collect();
        let info = InvocationInfo {
            id_hex: self.id_hex.clone(),
            hostname: self.hostname.clone(),
            startup,
            binds,
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        };
        write_invocation(root, &info)
    }

    fn write_resolv_and_hosts(&self, root: &Path) -> Result<(), ControllerError> {
        let etc = root.join("etc");
        fs::create_dir_all(&etc)
            .map_err(|e| ControllerError::io(format!("create {}", etc.display()), e))?;

        let resolv: String = self
            .nameservers
            .iter()
            .map(|ns| format!("nameserver {}\n", ns))
            .collect();
        fs::write(etc.join("resolv.conf"), resolv)
            .map_err(|e| ControllerError::io("write etc/resolv.conf", e))?;

        let hosts: String = self
            .host_map
            .iter()
            .map(|(host, ip)| format!("{}\t{}\n", ip, host))
            .collect();
        fs::write(etc.join("hosts"), hosts)
            .map_err(|e| ControllerError::io("write etc/hosts", e))?;
        Ok(())
    }
}

/// Block until the process exits and return its exit status
/// (128+signal for signalled exits). Usable from any thread of the
/// parent; the host's per-silo wait tasks call this directly.
pub fn wait_child(pid: i32) -> Result<i32, ControllerError> {
    let pid = Pid::from_raw(pid);
    loop {
        match waitpid(pid, None)? {
            WaitStatus::Exited(_, code) => return Ok(code),
            WaitStatus::Signaled(_, signal, _) => return Ok(128 + signal as i32),
            // Stopped/continued and the like: keep waiting for the exit.
            _ => continue,
        }
    }
}
