//! The second stage: what runs inside the fresh namespaces.
//!
//! `start` clones a child that re-execs this same binary with
//! [`SENTINEL`] as argv[1] and the silo root as argv[2]. Binaries call
//! [`dispatch`] before any argument parsing; when the sentinel is present
//! the process becomes the in-silo setup routine and never returns.
//!
//! Inside the namespaces the stage: reads the invocation descriptor,
//! mounts proc, performs bind mounts, pivots into the root, sets the
//! hostname, runs startup commands (waiting for interfaces where asked),
//! and finally execs the user command.

use std::ffi::CString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use nix::net::if_::InterfaceFlags;
use nix::unistd::execvpe;
use serde::{Deserialize, Serialize};

use crate::bases::{BindMount, silo_relative};
use crate::error::ControllerError;
use crate::interfaces::StartupCommand;
use crate::namespaces;

/// argv[1] marker for the in-namespace entry.
pub const SENTINEL: &str = "colex-silo-init";

/// Descriptor file written into the silo root during init.
pub const INVOCATION_FILE: &str = "invocation.json";

/// How long a startup command will wait for its interface.
pub const INTERFACE_WAIT: Duration = Duration::from_secs(10);

const INTERFACE_POLL: Duration = Duration::from_millis(100);

/// Everything the second stage needs, serialized into the silo root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationInfo {
    pub id_hex: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub startup: Vec<StartupCommand>,
    #[serde(default)]
    pub binds: Vec<BindMount>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

/// Write the descriptor into the silo root.
pub fn write_invocation(root: &Path, info: &InvocationInfo) -> Result<(), ControllerError> {
    let path = root.join(INVOCATION_FILE);
    let data = serde_json::to_vec(info)?;
    fs::write(&path, data)
        .map_err(|e| ControllerError::io(format!("write {}", path.display()), e))?;
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
        .map_err(|e| ControllerError::io(format!("chmod {}", path.display()), e))?;
    Ok(())
}

/// Read the descriptor back (from inside the namespaces).
pub fn read_invocation(root: &Path) -> Result<InvocationInfo, ControllerError> {
    let path = root.join(INVOCATION_FILE);
    let data = fs::read(&path)
        .map_err(|e| ControllerError::io(format!("read {}", path.display()), e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Check argv for the sentinel; if present, run the second stage and exit.
/// Must be called before any CLI parsing in every binary the controller
/// may re-exec.
pub fn dispatch() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 3 && args[1] == SENTINEL {
        // On success exec replaces the process; reaching here means failure.
        let err = second_stage(Path::new(&args[2]));
        eprintln!("silo setup failed: {}", err);
        std::process::exit(1);
    }
}

/// Run the in-namespace setup. Only returns on error: the tail call is
/// `execvpe` of the user command.
fn second_stage(root: &Path) -> ControllerError {
    match second_stage_inner(root) {
        Ok(infallible) => match infallible {},
        Err(e) => e,
    }
}

fn second_stage_inner(root: &Path) -> Result<std::convert::Infallible, ControllerError> {
    let info = read_invocation(root)?;

    namespaces::mount_proc(&root.join("proc"))?;

    // Bind sources resolve against the (still-visible) host tree, so the
    // mounts happen before the pivot.
    for bind in &info.binds {
        let target = silo_relative(root, &bind.silo_path);
        namespaces::bind_mount(&bind.host_path, &target, bind.is_file)?;
    }

    namespaces::set_root_fs(root)?;

    if !info.hostname.is_empty() {
        namespaces::set_hostname(&info.hostname)?;
    }

    for command in &info.startup {
        run_startup_command(command)?;
    }

    exec_user_command(&info)
}

fn run_startup_command(command: &StartupCommand) -> Result<(), ControllerError> {
    if let Some(device) = &command.wait_for_interface {
        wait_for_interface(device, INTERFACE_WAIT)?;
    }
    if command.cmd.is_empty() {
        return Ok(());
    }
    let status = Command::new(&command.cmd)
        .args(&command.args)
        .status()
        .map_err(|e| ControllerError::io(format!("spawn {}", command.cmd), e))?;
    if !status.success() {
        return Err(ControllerError::StartupCommand {
            cmd: command.cmd.clone(),
            status: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Poll until `device` is up with at least one address, bounded by
/// `timeout`.
pub fn wait_for_interface(device: &str, timeout: Duration) -> Result<(), ControllerError> {
    let deadline = Instant::now() + timeout;
    loop {
        if interface_ready(device) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(ControllerError::InterfaceTimeout(device.to_string()));
        }
        std::thread::sleep(INTERFACE_POLL);
    }
}

fn interface_ready(device: &str) -> bool {
    let Ok(addrs) = nix::ifaddrs::getifaddrs() else {
        return false;
    };
    let mut up = false;
    let mut has_address = false;
    for entry in addrs {
        if entry.interface_name != device {
            continue;
        }
        if entry.flags.contains(InterfaceFlags::IFF_UP) {
            up = true;
        }
        if let Some(addr) = entry.address {
            if addr.as_sockaddr_in().is_some() || addr.as_sockaddr_in6().is_some() {
                has_address = true;
            }
        }
    }
    up && has_address
}

fn exec_user_command(info: &InvocationInfo) -> Result<std::convert::Infallible, ControllerError> {
    let to_cstring = |s: &str| {
        CString::new(s.as_bytes()).map_err(|_| {
            ControllerError::io(
                format!("{:?} contains NUL", s),
                std::io::Error::from(std::io::ErrorKind::InvalidInput),
            )
        })
    };

    let cmd = to_cstring(&info.cmd)?;
    let mut argv = vec![cmd.clone()];
    for arg in &info.args {
        argv.push(to_cstring(arg)?);
    }
    let envp: Vec<CString> = info
        .env
        .iter()
        .map(|e| to_cstring(e))
        .collect::<Result<_, _>>()?;

    Ok(execvpe(&cmd, &argv, &envp)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let info = InvocationInfo {
            id_hex: "deadbeef".to_string(),
            hostname: "deadbeef".to_string(),
            startup: vec![StartupCommand {
                cmd: "/bin/ifconfig".to_string(),
                args: vec!["lo".to_string(), "up".to_string()],
                wait_for_interface: None,
            }],
            binds: vec![BindMount {
                host_path: "/srv/data".into(),
                silo_path: "/data".to_string(),
                is_file: false,
            }],
            cmd: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "true".to_string()],
            env: vec!["PATH=/bin".to_string()],
        };
        write_invocation(root.path(), &info).unwrap();

        let back = read_invocation(root.path()).unwrap();
        assert_eq!(back.id_hex, "deadbeef");
        assert_eq!(back.startup.len(), 1);
        assert_eq!(back.binds[0].silo_path, "/data");
        assert_eq!(back.cmd, "/bin/sh");
        assert_eq!(back.env, vec!["PATH=/bin"]);
    }

    #[test]
    fn test_invocation_file_is_descriptor_named() {
        let root = tempfile::tempdir().unwrap();
        let info = InvocationInfo {
            id_hex: "00000000".to_string(),
            hostname: String::new(),
            startup: Vec::new(),
            binds: Vec::new(),
            cmd: "/bin/true".to_string(),
            args: Vec::new(),
            env: Vec::new(),
        };
        write_invocation(root.path(), &info).unwrap();
        assert!(root.path().join("invocation.json").is_file());
    }

    #[test]
    fn test_wait_for_missing_interface_times_out() {
        let err = wait_for_interface("definitely-not-a-dev", Duration::from_millis(150));
        assert!(matches!(err, Err(ControllerError::InterfaceTimeout(_))));
    }

    #[test]
    fn test_startup_command_failure_reports_status() {
        let command = StartupCommand {
            cmd: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 3".to_string()],
            wait_for_interface: None,
        };
        match run_startup_command(&command) {
            Err(ControllerError::StartupCommand { status, .. }) => assert_eq!(status, 3),
            other => panic!("expected startup failure, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_empty_command_entries_are_wait_only() {
        let command = StartupCommand::default();
        run_startup_command(&command).unwrap();
    }
}
