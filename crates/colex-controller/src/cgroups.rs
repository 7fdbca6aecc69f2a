//! Per-silo cgroup (v1) management.
//!
//! Subsystem locations are discovered at runtime from `/proc/cgroups`
//! (which subsystems the kernel enables) and `/proc/self/mountinfo`
//! (where each is mounted). Each silo gets a `c{id}` directory under the
//! cpu and memory hierarchies with the silo's top pid attached.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use colex_core::spec::Resources;

use crate::error::ControllerError;

/// Caps applied to a silo's cgroups. Zero fields are left unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupConfig {
    pub cpu_period_us: u64,
    pub cpu_quota_us: u64,
    pub memory_max_bytes: u64,
}

impl CgroupConfig {
    /// Derive from the spec's resource block: the cpu quota percentage is
    /// against one CPU over a 100ms scheduling period.
    pub fn from_resources(res: &Resources) -> Self {
        let (period, quota) = if res.cpu_quota_percent > 0 {
            (100_000, u64::from(res.cpu_quota_percent) * 1_000)
        } else {
            (0, 0)
        };
        CgroupConfig {
            cpu_period_us: period,
            cpu_quota_us: quota,
            memory_max_bytes: res.memory_bytes,
        }
    }
}

/// A process within its cpu + memory cgroups.
#[derive(Debug)]
pub struct CgroupSet {
    pub id: String,
    pub pid: i32,
    cpu_path: Option<PathBuf>,
    memory_path: Option<PathBuf>,
}

impl CgroupSet {
    /// Create both groups for `id_hex`, attach `pid`, and apply caps.
    /// A failure while applying caps removes whatever was created.
    pub fn create(id_hex: &str, pid: i32, cfg: &CgroupConfig) -> Result<Self, ControllerError> {
        let mut set = CgroupSet {
            id: format!("c{}", id_hex),
            pid,
            cpu_path: None,
            memory_path: None,
        };

        match set.create_cpu_group(cfg) {
            Ok(()) => {}
            Err(e) => {
                let _ = set.close();
                return Err(e);
            }
        }
        match set.create_memory_group(cfg) {
            Ok(()) => {}
            Err(e) => {
                let _ = set.close();
                return Err(e);
            }
        }
        Ok(set)
    }

    /// The cpu group directory, if created.
    pub fn cpu_path(&self) -> Option<&Path> {
        self.cpu_path.as_deref()
    }

    /// The memory group directory, if created.
    pub fn memory_path(&self) -> Option<&Path> {
        self.memory_path.as_deref()
    }

    fn create_cpu_group(&mut self, cfg: &CgroupConfig) -> Result<(), ControllerError> {
        let mount = subsystem_mountpoint("cpu")?;
        let path = mount.join(&self.id);
        make_group_dir(&path)?;
        self.cpu_path = Some(path.clone());

        if cfg.cpu_period_us != 0 {
            write_value(&path, "cpu.cfs_period_us", &cfg.cpu_period_us.to_string())?;
        }
        if cfg.cpu_quota_us != 0 {
            write_value(&path, "cpu.cfs_quota_us", &cfg.cpu_quota_us.to_string())?;
        }
        write_value(&path, "cgroup.procs", &self.pid.to_string())
    }

    fn create_memory_group(&mut self, cfg: &CgroupConfig) -> Result<(), ControllerError> {
        let mount = subsystem_mountpoint("memory")?;
        let path = mount.join(&self.id);
        make_group_dir(&path)?;
        self.memory_path = Some(path.clone());

        if cfg.memory_max_bytes != 0 {
            write_value(
                &path,
                "memory.limit_in_bytes",
                &cfg.memory_max_bytes.to_string(),
            )?;
        }
        write_value(&path, "cgroup.procs", &self.pid.to_string())
    }

    /// Remove both group directories. A group that is already gone is not
    /// an error.
    pub fn close(&mut self) -> Result<(), ControllerError> {
        for path in [self.cpu_path.take(), self.memory_path.take()]
            .into_iter()
            .flatten()
        {
            match fs::remove_dir(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(ControllerError::io(
                        format!("remove cgroup {}", path.display()),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }
}

fn make_group_dir(path: &Path) -> Result<(), ControllerError> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(ControllerError::io(
            format!("create cgroup {}", path.display()),
            e,
        )),
    }
}

fn write_value(dir: &Path, file: &str, data: &str) -> Result<(), ControllerError> {
    let path = dir.join(file);
    fs::write(&path, data)
        .map_err(|e| ControllerError::io(format!("write {}", path.display()), e))
}

/// The control group subsystems the kernel has enabled, from `/proc/cgroups`.
pub fn enabled_subsystems() -> Result<HashMap<String, u32>, ControllerError> {
    let contents = fs::read_to_string("/proc/cgroups")
        .map_err(|e| ControllerError::io("read /proc/cgroups", e))?;
    Ok(parse_enabled_subsystems(&contents))
}

fn parse_enabled_subsystems(contents: &str) -> HashMap<String, u32> {
    let mut out = HashMap::new();
    // First line is the column-header comment.
    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let (Some(subsystem), Some(hierarchy), _, Some(enabled)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            continue;
        };
        if enabled == "1" {
            if let Ok(h) = hierarchy.parse() {
                out.insert(subsystem.to_string(), h);
            }
        }
    }
    out
}

/// Where the given cgroup subsystem is mounted, from `/proc/self/mountinfo`.
pub fn subsystem_mountpoint(subsystem: &str) -> Result<PathBuf, ControllerError> {
    let contents = fs::read_to_string("/proc/self/mountinfo")
        .map_err(|e| ControllerError::io("read /proc/self/mountinfo", e))?;
    parse_subsystem_mountpoint(&contents, subsystem)
        .ok_or_else(|| ControllerError::SubsystemNotMounted(subsystem.to_string()))
}

fn parse_subsystem_mountpoint(contents: &str, subsystem: &str) -> Option<PathBuf> {
    for line in contents.lines() {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 5 {
            continue;
        }
        // Super options are the last field; the mount point is field 4.
        let super_opts = fields[fields.len() - 1];
        if super_opts.split(',').any(|opt| opt == subsystem) {
            return Some(PathBuf::from(fields[4]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
25 20 0:22 / /sys/fs/cgroup ro,nosuid,nodev,noexec - tmpfs tmpfs ro,mode=755
26 25 0:23 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid - cgroup cgroup rw,cpu,cpuacct
27 25 0:24 / /sys/fs/cgroup/memory rw,nosuid - cgroup cgroup rw,memory
";

    const PROC_CGROUPS: &str = "\
#subsys_name\thierarchy\tnum_cgroups\tenabled
cpu\t2\t113\t1
cpuacct\t2\t113\t1
memory\t3\t220\t1
freezer\t8\t4\t0
";

    #[test]
    fn test_parse_subsystem_mountpoint() {
        assert_eq!(
            parse_subsystem_mountpoint(MOUNTINFO, "memory"),
            Some(PathBuf::from("/sys/fs/cgroup/memory"))
        );
        assert_eq!(
            parse_subsystem_mountpoint(MOUNTINFO, "cpu"),
            Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(parse_subsystem_mountpoint(MOUNTINFO, "pids"), None);
    }

    #[test]
    fn test_parse_enabled_subsystems() {
        let subs = parse_enabled_subsystems(PROC_CGROUPS);
        assert_eq!(subs.get("cpu"), Some(&2));
        assert_eq!(subs.get("memory"), Some(&3));
        assert!(!subs.contains_key("freezer"));
    }

    #[test]
    fn test_config_from_resources() {
        let cfg = CgroupConfig::from_resources(&Resources {
            cpu_quota_percent: 50,
            memory_bytes: 64 * 1024 * 1024,
        });
        assert_eq!(cfg.cpu_period_us, 100_000);
        assert_eq!(cfg.cpu_quota_us, 50_000);
        assert_eq!(cfg.memory_max_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn test_config_zero_resources_sets_nothing() {
        let cfg = CgroupConfig::from_resources(&Resources::default());
        assert_eq!(cfg.cpu_period_us, 0);
        assert_eq!(cfg.cpu_quota_us, 0);
        assert_eq!(cfg.memory_max_bytes, 0);
    }

    #[test]
    fn test_close_tolerates_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("cdeadbeef");
        let mut set = CgroupSet {
            id: "cdeadbeef".to_string(),
            pid: 1,
            cpu_path: Some(gone.clone()),
            memory_path: Some(gone),
        };
        set.close().unwrap();
        // Second close is a no-op: the paths were taken.
        set.close().unwrap();
    }
}
