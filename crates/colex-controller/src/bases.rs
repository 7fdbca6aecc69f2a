//! Root filesystem providers.
//!
//! A silo's root directory is assembled by applying providers in
//! registration order during init. Providers compose by appending to the
//! same tree; later providers may overwrite earlier files.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use nix::sys::stat::{Mode, SFlag, makedev, mknod};

use crate::error::ControllerError;

/// A bind mount performed by the second stage inside the mount namespace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub silo_path: String,
    pub is_file: bool,
}

/// A composable step contributing to the silo's root filesystem.
#[derive(Debug)]
pub enum BaseProvider {
    /// Extract the busybox tarball configured on the host.
    Busybox { tar_path: PathBuf },
    /// Extract an arbitrary on-disk tarball.
    Tarball { tar_path: PathBuf },
    /// Create `/dev/{null,zero,random,urandom}` character specials.
    DevNodes,
    /// Write a blob at a silo-relative path.
    FileRaw { silo_path: String, data: Vec<u8> },
    /// Unpack a blob (tar stream) at a silo-relative path.
    FileTar { silo_path: String, data: Vec<u8> },
    /// Record a bind mount for the second stage; no host-side setup
    /// because the mount namespace does not exist yet.
    Bind(BindMount),
}

impl BaseProvider {
    /// Apply this provider to the root directory.
    pub fn setup(&self, root: &Path) -> Result<(), ControllerError> {
        match self {
            BaseProvider::Busybox { tar_path } | BaseProvider::Tarball { tar_path } => {
                extract_tar_file(tar_path, root)
            }
            BaseProvider::DevNodes => make_dev_nodes(root),
            BaseProvider::FileRaw { silo_path, data } => {
                let target = silo_relative(root, silo_path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        ControllerError::io(format!("create {}", parent.display()), e)
                    })?;
                }
                fs::write(&target, data)
                    .map_err(|e| ControllerError::io(format!("write {}", target.display()), e))?;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o777))
                    .map_err(|e| ControllerError::io(format!("chmod {}", target.display()), e))
            }
            BaseProvider::FileTar { silo_path, data } => {
                let target = silo_relative(root, silo_path);
                fs::create_dir_all(&target)
                    .map_err(|e| ControllerError::io(format!("create {}", target.display()), e))?;
                extract_tar_stream(&data[..], &target)
            }
            BaseProvider::Bind(_) => Ok(()),
        }
    }

    /// Undo host-side effects. Providers currently leave extracted trees in
    /// place (the root directory's removal is the silo's responsibility)
    /// and bind mounts die with the mount namespace, so teardown has no
    /// work to do.
    pub fn teardown(&self, _root: &Path) -> Result<(), ControllerError> {
        Ok(())
    }

    /// The bind request this provider carries, if any.
    pub fn bind_request(&self) -> Option<&BindMount> {
        match self {
            BaseProvider::Bind(b) => Some(b),
            _ => None,
        }
    }
}

/// Resolve a silo path (`/etc/app.conf`) inside the root directory.
pub fn silo_relative(root: &Path, silo_path: &str) -> PathBuf {
    root.join(silo_path.trim_start_matches('/'))
}

fn extract_tar_file(tar_path: &Path, root: &Path) -> Result<(), ControllerError> {
    let file = fs::File::open(tar_path)
        .map_err(|e| ControllerError::io(format!("open {}", tar_path.display()), e))?;
    extract_tar_stream(file, root)
}

fn extract_tar_stream<R: Read>(reader: R, dest: &Path) -> Result<(), ControllerError> {
    let mut reader = std::io::BufReader::new(reader);
    let magic = peek_two(&mut reader).map_err(|e| ControllerError::io("read archive header", e))?;

    // Gzip magic: 0x1f 0x8b. Anything else is treated as a plain tar.
    let inner: Box<dyn Read> = if magic == [0x1f, 0x8b] {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    let mut archive = tar::Archive::new(inner);
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| ControllerError::io(format!("unpack into {}", dest.display()), e))
}

fn peek_two<R: std::io::BufRead>(reader: &mut R) -> std::io::Result<[u8; 2]> {
    let buf = reader.fill_buf()?;
    let mut out = [0u8; 2];
    let n = buf.len().min(2);
    out[..n].copy_from_slice(&buf[..n]);
    Ok(out)
}

fn make_dev_nodes(root: &Path) -> Result<(), ControllerError> {
    let dev_dir = root.join("dev");
    fs::create_dir_all(&dev_dir)
        .map_err(|e| ControllerError::io(format!("create {}", dev_dir.display()), e))?;

    let nodes: [(&str, u64, u64); 4] = [
        ("null", 1, 3),
        ("zero", 1, 5),
        ("random", 1, 8),
        ("urandom", 1, 9),
    ];
    for (name, major, minor) in nodes {
        let path = dev_dir.join(name);
        if path.exists() {
            continue;
        }
        mknod(
            &path,
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(major, minor),
        )?;
    }
    Ok(())
}
