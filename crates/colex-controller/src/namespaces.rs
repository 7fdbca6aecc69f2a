//! Namespace and clone primitives.
//!
//! A silo's child is produced by `clone(2)` with fresh user, uts, ipc,
//! pid, mount, and net namespaces. The child and parent synchronize over
//! a pipe: the child blocks until the parent has written its uid/gid maps
//! (which must happen from outside the new user namespace), then re-execs
//! this binary with the second-stage sentinel.

use std::ffi::CString;
use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::CloneFlags;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::waitpid;
use nix::unistd::{Pid, chdir, getgid, getuid, pipe, pivot_root, sethostname, write};

use crate::error::ControllerError;
use crate::reexec::SENTINEL;

/// Stack size for the cloned child. It only reads a byte and execs.
const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Where the old root is parked during the pivot.
const PUT_OLD: &str = ".temp_old";

/// One uid/gid mapping between the parent namespace and the silo.
#[derive(Debug, Clone, Copy)]
pub struct IdMap {
    /// ID inside the silo.
    pub inner: u32,
    /// ID in the parent namespace.
    pub host: u32,
    pub count: u32,
}

/// Everything `start` needs to clone the child.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub flags: CloneFlags,
    pub uid_maps: Vec<IdMap>,
    pub gid_maps: Vec<IdMap>,
}

/// The namespace set every silo gets. The user namespace is omitted when
/// the host is configured to run silos without one.
pub fn namespace_flags(user_namespace: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET;
    if user_namespace {
        flags |= CloneFlags::CLONE_NEWUSER;
    }
    flags
}

/// Map root inside the silo to the invoking user outside of it.
pub fn parent_to_root_spec(user_namespace: bool) -> CloneSpec {
    let (uid_maps, gid_maps) = if user_namespace {
        (
            vec![IdMap {
                inner: 0,
                host: getuid().as_raw(),
                count: 1,
            }],
            vec![IdMap {
                inner: 0,
                host: getgid().as_raw(),
                count: 1,
            }],
        )
    } else {
        (Vec::new(), Vec::new())
    };
    CloneSpec {
        flags: namespace_flags(user_namespace),
        uid_maps,
        gid_maps,
    }
}

/// Clone the second-stage child for the silo rooted at `root`.
///
/// Returns once the child is released past the uid/gid-map barrier; the
/// child is by then exec'ing the sentinel entry. On a map-writing failure
/// the child is killed and reaped before the error is returned.
pub fn spawn_silo_child(root: &Path, spec: &CloneSpec) -> Result<Pid, ControllerError> {
    let exe = CString::new("/proc/self/exe").expect("static path");
    let sentinel = CString::new(SENTINEL).expect("static sentinel");
    let root_arg = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| ControllerError::io(
            "silo root contains NUL",
            std::io::Error::from(ErrorKind::InvalidInput),
        ))?;
    let argv: Vec<*const libc::c_char> = vec![
        exe.as_ptr(),
        sentinel.as_ptr(),
        root_arg.as_ptr(),
        std::ptr::null(),
    ];

    let (sync_rd, sync_wr) = pipe()?;
    let sync_rd_fd = sync_rd.as_raw_fd();

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    // The parent is multi-threaded; between clone and exec the child may
    // only make async-signal-safe calls, so everything it touches is
    // prepared above and the raw libc entry points are used directly.
    let child_entry = Box::new(move || -> isize {
        let mut byte = [0u8; 1];
        let n = unsafe { libc::read(sync_rd_fd, byte.as_mut_ptr().cast(), 1) };
        if n != 1 {
            return 125;
        }
        unsafe {
            libc::execv(exe.as_ptr(), argv.as_ptr());
        }
        127
    });

    let child = unsafe {
        nix::sched::clone(
            child_entry,
            &mut stack,
            spec.flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }?;

    if let Err(e) = write_id_maps(child, spec) {
        let _ = kill(child, Signal::SIGKILL);
        let _ = write(sync_wr, b"x");
        let _ = waitpid(child, None);
        return Err(e);
    }

    // Release the child past the barrier.
    write(sync_wr, b"x")?;
    Ok(child)
}

fn write_id_maps(child: Pid, spec: &CloneSpec) -> Result<(), ControllerError> {
    if !spec.flags.contains(CloneFlags::CLONE_NEWUSER) {
        return Ok(());
    }
    let proc_dir = format!("/proc/{}", child.as_raw());

    let uid_map = render_id_maps(&spec.uid_maps);
    fs::write(format!("{}/uid_map", proc_dir), uid_map)
        .map_err(|e| ControllerError::io(format!("write {}/uid_map", proc_dir), e))?;

    // Writing gid_map from the parent requires setgroups to be denied first.
    fs::write(format!("{}/setgroups", proc_dir), "deny")
        .map_err(|e| ControllerError::io(format!("write {}/setgroups", proc_dir), e))?;

    let gid_map = render_id_maps(&spec.gid_maps);
    fs::write(format!("{}/gid_map", proc_dir), gid_map)
        .map_err(|e| ControllerError::io(format!("write {}/gid_map", proc_dir), e))?;
    Ok(())
}

fn render_id_maps(maps: &[IdMap]) -> String {
    maps.iter()
        .map(|m| format!("{} {} {}\n", m.inner, m.host, m.count))
        .collect()
}

/// Mount a fresh procfs at `target`, creating the directory if needed.
pub fn mount_proc(target: &Path) -> Result<(), ControllerError> {
    fs::create_dir_all(target)
        .map_err(|e| ControllerError::io(format!("create {}", target.display()), e))?;
    mount(
        Some("proc"),
        target,
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )?;
    Ok(())
}

/// Make `new_root` the root mount using the classic pivot_root dance.
pub fn set_root_fs(new_root: &Path) -> Result<(), ControllerError> {
    // pivot_root requires the new root to be a mount point.
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;

    let put_old = new_root.join(PUT_OLD);
    fs::create_dir_all(&put_old)
        .map_err(|e| ControllerError::io(format!("create {}", put_old.display()), e))?;

    pivot_root(new_root, &put_old)?;
    chdir("/")?;

    let old = Path::new("/").join(PUT_OLD);
    umount2(&old, MntFlags::MNT_DETACH)?;
    fs::remove_dir_all(&old)
        .map_err(|e| ControllerError::io(format!("remove {}", old.display()), e))?;
    Ok(())
}

/// Create the bind target (file or directory) if missing.
pub fn ensure_bind_target(target: &Path, is_file: bool) -> Result<(), ControllerError> {
    if target.exists() {
        return Ok(());
    }
    if is_file {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ControllerError::io(format!("create {}", parent.display()), e))?;
        }
        fs::File::create(target)
            .map_err(|e| ControllerError::io(format!("create {}", target.display()), e))?;
    } else {
        fs::create_dir_all(target)
            .map_err(|e| ControllerError::io(format!("create {}", target.display()), e))?;
    }
    Ok(())
}

/// Bind-mount `source` onto `target`, creating the target first.
pub fn bind_mount(source: &Path, target: &Path, is_file: bool) -> Result<(), ControllerError> {
    ensure_bind_target(target, is_file)?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}

/// Set the silo's hostname (UTS namespace is already ours).
pub fn set_hostname(name: &str) -> Result<(), ControllerError> {
    sethostname(name)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_flags_full_set() {
        let flags = namespace_flags(true);
        for f in [
            CloneFlags::CLONE_NEWUSER,
            CloneFlags::CLONE_NEWNS,
            CloneFlags::CLONE_NEWUTS,
            CloneFlags::CLONE_NEWIPC,
            CloneFlags::CLONE_NEWPID,
            CloneFlags::CLONE_NEWNET,
        ] {
            assert!(flags.contains(f));
        }
    }

    #[test]
    fn test_namespace_flags_without_user_ns() {
        let flags = namespace_flags(false);
        assert!(!flags.contains(CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn test_parent_to_root_spec_maps_current_ids() {
        let spec = parent_to_root_spec(true);
        assert_eq!(spec.uid_maps.len(), 1);
        assert_eq!(spec.uid_maps[0].inner, 0);
        assert_eq!(spec.uid_maps[0].host, getuid().as_raw());
        assert_eq!(spec.uid_maps[0].count, 1);
    }

    #[test]
    fn test_parent_to_root_spec_disabled() {
        let spec = parent_to_root_spec(false);
        assert!(spec.uid_maps.is_empty());
        assert!(spec.gid_maps.is_empty());
    }

    #[test]
    fn test_render_id_maps() {
        let rendered = render_id_maps(&[IdMap {
            inner: 0,
            host: 1000,
            count: 1,
        }]);
        assert_eq!(rendered, "0 1000 1\n");
    }

    #[test]
    fn test_ensure_bind_target_creates_file_and_dir() {
        let dir = tempfile::tempdir().unwrap();

        let file_target = dir.path().join("etc/config/app.conf");
        ensure_bind_target(&file_target, true).unwrap();
        assert!(file_target.is_file());

        let dir_target = dir.path().join("var/data");
        ensure_bind_target(&dir_target, false).unwrap();
        assert!(dir_target.is_dir());

        // Existing targets are left alone.
        ensure_bind_target(&file_target, true).unwrap();
        ensure_bind_target(&dir_target, false).unwrap();
    }
}
