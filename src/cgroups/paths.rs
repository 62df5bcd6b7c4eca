//! Path resolution for the v1 hierarchies, plus the small cgroupfs surface
//! this crate writes: pid enrollment, pid listing and directory removal.
//!
//! The on-disk location of a subsystem's group directory is
//!
//! ```text
//! <mountpoint>/<own ancestor path>/<expanded slice>/<unit name>
//! ```
//!
//! where the mountpoint comes from `/proc/self/mountinfo`, the ancestor
//! path from `/proc/self/cgroup` (with a trailing `init.scope` stripped,
//! for systemd >= 226 which places pid 1 in its own scope), and the slice
//! path from expanding the configured parent slice the way systemd nests
//! slice directories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::config::CgroupConfig;
use crate::error::{CgroupError, Result};

const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";
const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";
const CGROUP_PROCS: &str = "cgroup.procs";
const INIT_SCOPE: &str = "init.scope";

/// Slice used when the config does not name a parent.
pub const DEFAULT_SLICE: &str = "system.slice";

/// Compute the absolute group directory for one subsystem.
///
/// Returns [`CgroupError::SubsystemAbsent`] when the subsystem has no
/// mounted hierarchy on this host; callers other than the devices
/// subsystem tolerate that by skipping the subsystem.
pub fn subsystem_path(config: &CgroupConfig, subsystem: &str) -> Result<PathBuf> {
    let mountpoint = find_cgroup_mountpoint(subsystem)?;

    let own = own_cgroups()?;
    let init_path = own
        .get(subsystem)
        .ok_or_else(|| CgroupError::absent(subsystem))?;
    // systemd >= 226 puts pid 1 in init.scope instead of the hierarchy root.
    let init_path = init_path.trim_end_matches('/');
    let init_path = init_path.strip_suffix(INIT_SCOPE).unwrap_or(init_path);
    let init_path = init_path.trim_matches('/');

    let slice = if config.parent.is_empty() {
        DEFAULT_SLICE
    } else {
        &config.parent
    };
    let slice_path = expand_slice(slice)?;

    Ok(mountpoint
        .join(init_path)
        .join(slice_path)
        .join(config.unit_name()))
}

/// Find the mountpoint of a subsystem's v1 hierarchy from
/// `/proc/self/mountinfo`.
pub fn find_cgroup_mountpoint(subsystem: &str) -> Result<PathBuf> {
    let content = fs::read_to_string(PROC_SELF_MOUNTINFO)
        .map_err(|e| CgroupError::io(format!("reading {}", PROC_SELF_MOUNTINFO), e))?;
    parse_mountinfo(&content, subsystem).ok_or_else(|| CgroupError::absent(subsystem))
}

/// The calling process's own cgroup membership, subsystem name to
/// hierarchy-relative path, from `/proc/self/cgroup`.
pub fn own_cgroups() -> Result<HashMap<String, String>> {
    let content = fs::read_to_string(PROC_SELF_CGROUP)
        .map_err(|e| CgroupError::io(format!("reading {}", PROC_SELF_CGROUP), e))?;
    Ok(parse_cgroup_file(&content))
}

/// Parse `/proc/self/cgroup` content. Each line is
/// `hierarchy-id:controller-list:path`; the controller list is
/// comma-separated and empty for the v2 hierarchy.
pub(crate) fn parse_cgroup_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if controllers.is_empty() {
            // v2 hierarchy; keyed by the empty name.
            map.insert(String::new(), path.to_string());
            continue;
        }
        for name in controllers.split(',') {
            map.insert(name.to_string(), path.to_string());
        }
    }
    map
}

/// Parse `/proc/self/mountinfo` content, returning the mountpoint of the
/// cgroup mount whose super options carry `subsystem`.
pub(crate) fn parse_mountinfo(content: &str, subsystem: &str) -> Option<PathBuf> {
    for line in content.lines() {
        // mountinfo: "id parent maj:min root mountpoint opts ... - fstype source superopts"
        let Some(sep) = line.find(" - ") else {
            continue;
        };
        let (mount_fields, fs_fields) = line.split_at(sep);
        let fs_fields: Vec<&str> = fs_fields[3..].split_whitespace().collect();
        if fs_fields.first() != Some(&"cgroup") {
            continue;
        }
        let Some(super_opts) = fs_fields.get(2) else {
            continue;
        };
        if !super_opts.split(',').any(|opt| opt == subsystem) {
            continue;
        }
        let mount_fields: Vec<&str> = mount_fields.split_whitespace().collect();
        if let Some(mountpoint) = mount_fields.get(4) {
            return Some(PathBuf::from(mountpoint));
        }
    }
    None
}

/// Expand a slice name into the nested directory path systemd creates for
/// it: `a-b-c.slice` becomes `a.slice/a-b.slice/a-b-c.slice`, and the
/// root slice `-.slice` becomes the empty path.
pub fn expand_slice(slice: &str) -> Result<String> {
    let suffix = ".slice";
    let name = slice
        .strip_suffix(suffix)
        .ok_or_else(|| CgroupError::Translation(format!("invalid slice name {:?}", slice)))?;
    if name.is_empty() || slice.contains('/') {
        return Err(CgroupError::Translation(format!(
            "invalid slice name {:?}",
            slice
        )));
    }
    if slice == "-.slice" {
        return Ok(String::new());
    }

    let mut path = String::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        // Dashes nest; an empty segment ("a--b.slice") is malformed.
        if component.is_empty() {
            return Err(CgroupError::Translation(format!(
                "invalid slice name {:?}",
                slice
            )));
        }
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(&prefix);
        path.push_str(component);
        path.push_str(suffix);
        prefix.push_str(component);
        prefix.push('-');
    }
    Ok(path)
}

/// Enroll a pid into `cgroup.procs` beneath `dir`. A pid of -1 enrolls
/// nothing (used for slice-only creation).
pub fn write_cgroup_proc(dir: &Path, pid: i32) -> Result<()> {
    if pid == -1 {
        return Ok(());
    }
    let procs = dir.join(CGROUP_PROCS);
    fs::write(&procs, pid.to_string())
        .map_err(|e| CgroupError::io(format!("writing pid to {}", procs.display()), e))
}

/// Enroll a pid into every tracked subsystem path.
pub fn enter_pid(paths: &HashMap<String, PathBuf>, pid: i32) -> Result<()> {
    for dir in paths.values() {
        write_cgroup_proc(dir, pid)?;
    }
    Ok(())
}

/// The pids currently enrolled directly in `dir`.
pub fn get_pids(dir: &Path) -> Result<Vec<i32>> {
    let procs = dir.join(CGROUP_PROCS);
    let content = fs::read_to_string(&procs)
        .map_err(|e| CgroupError::io(format!("reading {}", procs.display()), e))?;
    let mut pids = Vec::new();
    for line in content.lines() {
        let pid = line
            .trim()
            .parse::<i32>()
            .map_err(|e| CgroupError::io(procs.display().to_string(), invalid_data(e)))?;
        pids.push(pid);
    }
    Ok(pids)
}

/// The pids enrolled in `dir` or any group nested beneath it.
pub fn get_all_pids(dir: &Path) -> Result<Vec<i32>> {
    let mut pids = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        pids.extend(get_pids(&current)?);
        let entries = fs::read_dir(&current)
            .map_err(|e| CgroupError::io(format!("reading {}", current.display()), e))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| CgroupError::io(format!("reading {}", current.display()), e))?;
            if entry.path().is_dir() {
                stack.push(entry.path());
            }
        }
    }
    Ok(pids)
}

/// Remove every tracked group directory, best effort. Directories that
/// were removed (or already gone) are dropped from the table; the first
/// failure is returned after all paths have been attempted.
pub fn remove_paths(paths: &mut HashMap<String, PathBuf>) -> Result<()> {
    let mut first_err: Option<CgroupError> = None;
    let mut remaining = HashMap::new();
    for (name, path) in paths.drain() {
        match fs::remove_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove cgroup directory");
                if first_err.is_none() {
                    first_err = Some(CgroupError::Cleanup {
                        path: path.clone(),
                        source: e,
                    });
                }
                remaining.insert(name, path);
            }
        }
    }
    *paths = remaining;
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn invalid_data(e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup_file_v1() {
        let content = "\
11:devices:/user.slice
10:cpu,cpuacct:/
9:freezer:/
1:name=systemd:/user.slice/user-1000.slice/session-1.scope
0::/user.slice/user-1000.slice/session-1.scope
";
        let map = parse_cgroup_file(content);
        assert_eq!(map.get("devices").unwrap(), "/user.slice");
        assert_eq!(map.get("cpu").unwrap(), "/");
        assert_eq!(map.get("cpuacct").unwrap(), "/");
        assert_eq!(
            map.get("name=systemd").unwrap(),
            "/user.slice/user-1000.slice/session-1.scope"
        );
        assert_eq!(
            map.get("").unwrap(),
            "/user.slice/user-1000.slice/session-1.scope"
        );
    }

    #[test]
    fn test_parse_mountinfo_finds_subsystem() {
        let content = "\
30 23 0:26 / /sys/fs/cgroup ro,nosuid,nodev,noexec shared:9 - tmpfs tmpfs ro,mode=755
33 30 0:29 / /sys/fs/cgroup/devices rw,nosuid,nodev,noexec,relatime shared:14 - cgroup cgroup rw,devices
34 30 0:30 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:15 - cgroup cgroup rw,cpu,cpuacct
35 30 0:31 / /sys/fs/cgroup/systemd rw,nosuid shared:16 - cgroup cgroup rw,xattr,name=systemd
";
        assert_eq!(
            parse_mountinfo(content, "devices"),
            Some(PathBuf::from("/sys/fs/cgroup/devices"))
        );
        assert_eq!(
            parse_mountinfo(content, "cpuacct"),
            Some(PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(
            parse_mountinfo(content, "name=systemd"),
            Some(PathBuf::from("/sys/fs/cgroup/systemd"))
        );
        assert_eq!(parse_mountinfo(content, "pids"), None);
    }

    #[test]
    fn test_parse_mountinfo_ignores_non_cgroup_mounts() {
        let content =
            "30 23 0:26 / /sys/fs/cgroup ro,nosuid shared:9 - tmpfs tmpfs ro,seclabel,devices";
        assert_eq!(parse_mountinfo(content, "devices"), None);
    }

    #[test]
    fn test_expand_slice_nesting() {
        assert_eq!(expand_slice("system.slice").unwrap(), "system.slice");
        assert_eq!(
            expand_slice("machine-test.slice").unwrap(),
            "machine.slice/machine-test.slice"
        );
        assert_eq!(
            expand_slice("user-1000-app.slice").unwrap(),
            "user.slice/user-1000.slice/user-1000-app.slice"
        );
    }

    #[test]
    fn test_expand_slice_root() {
        assert_eq!(expand_slice("-.slice").unwrap(), "");
    }

    #[test]
    fn test_expand_slice_rejects_invalid_names() {
        assert!(expand_slice("test.scope").is_err());
        assert!(expand_slice(".slice").is_err());
        assert!(expand_slice("a--b.slice").is_err());
        assert!(expand_slice("a/b.slice").is_err());
    }

    #[test]
    fn test_remove_paths_drops_missing_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let existing = tmp.path().join("memory");
        fs::create_dir(&existing).unwrap();

        let mut paths = HashMap::new();
        paths.insert("memory".to_string(), existing.clone());
        paths.insert("cpu".to_string(), tmp.path().join("does-not-exist"));

        remove_paths(&mut paths).unwrap();
        assert!(paths.is_empty());
        assert!(!existing.exists());
    }

    #[test]
    fn test_get_pids_parses_procs_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("cgroup.procs"), "12\n345\n").unwrap();
        let mut pids = get_pids(tmp.path()).unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![12, 345]);
    }

    #[test]
    fn test_get_all_pids_walks_nested_groups() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("cgroup.procs"), "1\n").unwrap();
        let child = tmp.path().join("child");
        fs::create_dir(&child).unwrap();
        fs::write(child.join("cgroup.procs"), "2\n3\n").unwrap();

        let mut pids = get_all_pids(tmp.path()).unwrap();
        pids.sort_unstable();
        assert_eq!(pids, vec![1, 2, 3]);
    }
}
