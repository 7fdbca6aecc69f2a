//! Process memory accounting for silos.
//!
//! A silo's memory usage is the sum over every process sharing its pid
//! namespace. Processes that exit between the namespace scan and the
//! /proc read are skipped; the sum still succeeds.

use std::fs;
use std::path::Path;

use colex_core::wire::ProcMem;

/// Pids sharing the pid namespace of `pid`, found by comparing
/// `/proc/*/ns/pid` links.
pub fn pids_in_same_namespace(pid: i32) -> std::io::Result<Vec<i32>> {
    let target = fs::read_link(format!("/proc/{}/ns/pid", pid))?;

    let mut out = Vec::new();
    for entry in fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(candidate) = name.to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        // The process may be gone by now; skip rather than fail.
        match fs::read_link(format!("/proc/{}/ns/pid", candidate)) {
            Ok(ns) if ns == target => out.push(candidate),
            _ => {}
        }
    }
    Ok(out)
}

/// Memory counters for one process, from `/proc/<pid>/statm`.
/// `None` if the process is gone.
pub fn proc_mem(pid: i32) -> Option<ProcMem> {
    let statm = fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    parse_statm(&statm, page_size())
}

fn parse_statm(statm: &str, page_size: u64) -> Option<ProcMem> {
    let mut fields = statm.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    let share: u64 = fields.next()?.parse().ok()?;
    Some(ProcMem {
        size: size * page_size,
        resident: resident * page_size,
        share: share * page_size,
    })
}

fn page_size() -> u64 {
    // sysconf(_SC_PAGESIZE) cannot fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

/// Total memory usage of the silo whose top process is `pid`.
pub fn silo_mem(pid: i32) -> ProcMem {
    let pids = pids_in_same_namespace(pid).unwrap_or_default();
    let mut total = ProcMem::default();
    for pid in pids {
        if let Some(mem) = proc_mem(pid) {
            total.size += mem.size;
            total.resident += mem.resident;
            total.share += mem.share;
        }
    }
    total
}

/// Whether `/proc/<pid>` still exists.
pub fn pid_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_statm() {
        let mem = parse_statm("1000 200 50 12 0 300 0\n", 4096).unwrap();
        assert_eq!(mem.size, 1000 * 4096);
        assert_eq!(mem.resident, 200 * 4096);
        assert_eq!(mem.share, 50 * 4096);
    }

    #[test]
    fn test_parse_statm_garbage_is_none() {
        assert!(parse_statm("", 4096).is_none());
        assert!(parse_statm("a b c", 4096).is_none());
    }

    #[test]
    fn test_own_process_is_measurable() {
        let me = std::process::id() as i32;
        let mem = proc_mem(me).unwrap();
        assert!(mem.size > 0);
        assert!(mem.resident > 0);
    }

    #[test]
    fn test_own_namespace_contains_self() {
        let me = std::process::id() as i32;
        let pids = pids_in_same_namespace(me).unwrap();
        assert!(pids.contains(&me));
    }

    #[test]
    fn test_missing_pid_reports_none() {
        // Pid 0 has no /proc entry.
        assert!(proc_mem(0).is_none());
        assert!(!pid_alive(0));
    }
}
