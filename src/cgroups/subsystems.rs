//! The per-resource subsystem contract and its v1 implementations.
//!
//! Each controller implements the same small capability: a name, a stats
//! collector, and a limit setter. The manager resolves the full set into a
//! path table once at apply time and dispatches through this table
//! afterwards. Controllers are deliberately thin; they write the handful
//! of v1 knob files this crate owns and read the basic usage counters.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;

use super::config::{FreezerState, Resources};
use super::paths::find_cgroup_mountpoint;
use super::stats::Stats;
use crate::error::{CgroupError, Result};

/// Capability contract implemented once per resource controller.
pub trait Subsystem: Send + Sync {
    /// Kernel name of the subsystem, e.g. `memory`.
    fn name(&self) -> &'static str;

    /// Collect this subsystem's counters from the group at `path` into the
    /// shared aggregate.
    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()>;

    /// Apply this subsystem's slice of the resource configuration to the
    /// group at `path`.
    fn set(&self, path: &Path, r: &Resources) -> Result<()>;
}

lazy_static! {
    /// Process-wide immutable registry of the v1 subsystems, in dispatch
    /// order. Built once and only ever read.
    pub static ref SUBSYSTEMS: Vec<Box<dyn Subsystem>> = vec![
        Box::new(CpusetController),
        Box::new(DevicesController),
        Box::new(MemoryController),
        Box::new(CpuController),
        Box::new(CpuAcctController),
        Box::new(PidsController),
        Box::new(BlkioController),
        Box::new(HugetlbController),
        Box::new(PerfEventController),
        Box::new(FreezerController),
        Box::new(NetPrioController),
        Box::new(NetClsController),
        Box::new(NamedController),
    ];
}

pub(crate) const DEVICES: &str = "devices";
pub(crate) const FREEZER: &str = "freezer";
pub(crate) const CPUSET: &str = "cpuset";
pub(crate) const NAME_SYSTEMD: &str = "name=systemd";

fn write_file(dir: &Path, file: &str, data: &str) -> Result<()> {
    let path = dir.join(file);
    fs::write(&path, data).map_err(|e| CgroupError::io(format!("writing {}", path.display()), e))
}

fn read_string(dir: &Path, file: &str) -> Result<Option<String>> {
    let path = dir.join(file);
    match fs::read_to_string(&path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CgroupError::io(format!("reading {}", path.display()), e)),
    }
}

/// Read a single-value counter file. Missing files read as `None` so stat
/// collection works across kernels that lack individual counters.
fn read_u64(dir: &Path, file: &str) -> Result<Option<u64>> {
    let Some(content) = read_string(dir, file)? else {
        return Ok(None);
    };
    let value = content.trim().parse::<u64>().map_err(|e| {
        CgroupError::io(
            dir.join(file).display().to_string(),
            io::Error::new(io::ErrorKind::InvalidData, e),
        )
    })?;
    Ok(Some(value))
}

pub(crate) struct CpusetController;

impl CpusetController {
    /// Create the group directory and enroll `pid`, first making sure every
    /// ancestor up to the hierarchy root has cpu and memory node
    /// assignments. New v1 cpuset directories start empty and reject pid
    /// enrollment until both files are populated, so each level inherits
    /// from its parent where unset.
    pub(crate) fn apply_dir(&self, path: &Path, r: &Resources, pid: i32) -> Result<()> {
        let root = find_cgroup_mountpoint(CPUSET)?;
        self.ensure_ancestry(path, &root)?;
        self.set(path, r)?;
        super::paths::write_cgroup_proc(path, pid)
    }

    fn ensure_ancestry(&self, path: &Path, root: &Path) -> Result<()> {
        let mut pending: Vec<PathBuf> = Vec::new();
        let mut current = path;
        while current.starts_with(root) && current != root {
            pending.push(current.to_path_buf());
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        // Walk top-down so each directory can copy from an initialized parent.
        for dir in pending.iter().rev() {
            fs::create_dir_all(dir)
                .map_err(|e| CgroupError::io(format!("creating {}", dir.display()), e))?;
            self.inherit_from_parent(dir)?;
        }
        Ok(())
    }

    fn inherit_from_parent(&self, dir: &Path) -> Result<()> {
        let Some(parent) = dir.parent() else {
            return Ok(());
        };
        for file in ["cpuset.cpus", "cpuset.mems"] {
            let current = read_string(dir, file)?.unwrap_or_default();
            if !current.trim().is_empty() {
                continue;
            }
            if let Some(inherited) = read_string(parent, file)? {
                if !inherited.trim().is_empty() {
                    write_file(dir, file, inherited.trim())?;
                }
            }
        }
        Ok(())
    }
}

impl Subsystem for CpusetController {
    fn name(&self) -> &'static str {
        CPUSET
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        if !r.cpuset_cpus.is_empty() {
            write_file(path, "cpuset.cpus", &r.cpuset_cpus)?;
        }
        if !r.cpuset_mems.is_empty() {
            write_file(path, "cpuset.mems", &r.cpuset_mems)?;
        }
        Ok(())
    }
}

pub(crate) struct DevicesController;

impl Subsystem for DevicesController {
    fn name(&self) -> &'static str {
        DEVICES
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    /// Write the rule list in source order. Rule ordering matters to the
    /// kernel: later rules refine earlier ones.
    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        for rule in &r.devices {
            let file = if rule.allow {
                "devices.allow"
            } else {
                "devices.deny"
            };
            write_file(path, file, &rule.cgroup_string())?;
        }
        Ok(())
    }
}

struct MemoryController;

impl Subsystem for MemoryController {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        if let Some(v) = read_u64(path, "memory.usage_in_bytes")? {
            stats.memory.usage = v;
        }
        if let Some(v) = read_u64(path, "memory.max_usage_in_bytes")? {
            stats.memory.max_usage = v;
        }
        if let Some(v) = read_u64(path, "memory.limit_in_bytes")? {
            stats.memory.limit = v;
        }
        if let Some(v) = read_u64(path, "memory.failcnt")? {
            stats.memory.failcnt = v;
        }
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        if r.memory != 0 {
            write_file(path, "memory.limit_in_bytes", &r.memory.to_string())?;
        }
        Ok(())
    }
}

struct CpuController;

impl Subsystem for CpuController {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        let Some(content) = read_string(path, "cpu.stat")? else {
            return Ok(());
        };
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value = value.parse::<u64>().unwrap_or(0);
            match key {
                "nr_periods" => stats.cpu.nr_periods = value,
                "nr_throttled" => stats.cpu.nr_throttled = value,
                "throttled_time" => stats.cpu.throttled_time = value,
                _ => {}
            }
        }
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        if r.cpu_shares != 0 {
            write_file(path, "cpu.shares", &r.cpu_shares.to_string())?;
        }
        if r.cpu_period != 0 {
            write_file(path, "cpu.cfs_period_us", &r.cpu_period.to_string())?;
        }
        if r.cpu_quota != 0 {
            write_file(path, "cpu.cfs_quota_us", &r.cpu_quota.to_string())?;
        }
        Ok(())
    }
}

struct CpuAcctController;

impl Subsystem for CpuAcctController {
    fn name(&self) -> &'static str {
        "cpuacct"
    }

    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        if let Some(v) = read_u64(path, "cpuacct.usage")? {
            stats.cpu.usage_total = v;
        }
        let Some(content) = read_string(path, "cpuacct.stat")? else {
            return Ok(());
        };
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let value = value.parse::<u64>().unwrap_or(0);
            match key {
                "user" => stats.cpu.usage_user = value,
                "system" => stats.cpu.usage_system = value,
                _ => {}
            }
        }
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}

struct PidsController;

impl Subsystem for PidsController {
    fn name(&self) -> &'static str {
        "pids"
    }

    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        if let Some(v) = read_u64(path, "pids.current")? {
            stats.pids.current = v;
        }
        if let Some(content) = read_string(path, "pids.max")? {
            // "max" reads back as limit 0 (unlimited).
            stats.pids.limit = content.trim().parse::<u64>().unwrap_or(0);
        }
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        if r.pids_limit > 0 {
            write_file(path, "pids.max", &r.pids_limit.to_string())?;
        } else if r.pids_limit == -1 {
            write_file(path, "pids.max", "max")?;
        }
        Ok(())
    }
}

struct BlkioController;

impl Subsystem for BlkioController {
    fn name(&self) -> &'static str {
        "blkio"
    }

    fn get_stats(&self, path: &Path, stats: &mut Stats) -> Result<()> {
        let Some(content) = read_string(path, "blkio.throttle.io_service_bytes")? else {
            return Ok(());
        };
        for line in content.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // "<major>:<minor> <op> <bytes>"; the trailing Total line has
            // only two fields and is skipped.
            if fields.len() != 3 {
                continue;
            }
            let bytes = fields[2].parse::<u64>().unwrap_or(0);
            match fields[1] {
                "Read" => stats.blkio.read_bytes += bytes,
                "Write" => stats.blkio.write_bytes += bytes,
                _ => {}
            }
        }
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        if r.blkio_weight != 0 {
            write_file(path, "blkio.weight", &r.blkio_weight.to_string())?;
        }
        Ok(())
    }
}

struct HugetlbController;

impl Subsystem for HugetlbController {
    fn name(&self) -> &'static str {
        "hugetlb"
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}

struct PerfEventController;

impl Subsystem for PerfEventController {
    fn name(&self) -> &'static str {
        "perf_event"
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}

pub(crate) struct FreezerController;

impl FreezerController {
    /// Kernel-observed freezer state of the group at `path`.
    pub(crate) fn state(&self, path: &Path) -> Result<FreezerState> {
        let Some(content) = read_string(path, "freezer.state")? else {
            return Ok(FreezerState::Undefined);
        };
        match content.trim() {
            "THAWED" => Ok(FreezerState::Thawed),
            // FREEZING is transient on the way to FROZEN.
            "FROZEN" | "FREEZING" => Ok(FreezerState::Frozen),
            other => Err(CgroupError::io(
                format!("{}/freezer.state", path.display()),
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown freezer state {:?}", other),
                ),
            )),
        }
    }
}

impl Subsystem for FreezerController {
    fn name(&self) -> &'static str {
        FREEZER
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, path: &Path, r: &Resources) -> Result<()> {
        match r.freezer {
            FreezerState::Frozen => write_file(path, "freezer.state", "FROZEN"),
            FreezerState::Thawed => write_file(path, "freezer.state", "THAWED"),
            FreezerState::Undefined => Ok(()),
        }
    }
}

struct NetPrioController;

impl Subsystem for NetPrioController {
    fn name(&self) -> &'static str {
        "net_prio"
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}

struct NetClsController;

impl Subsystem for NetClsController {
    fn name(&self) -> &'static str {
        "net_cls"
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}

/// Placeholder for the `name=systemd` hierarchy; systemd itself manages
/// that tree, so every operation is a no-op.
struct NamedController;

impl Subsystem for NamedController {
    fn name(&self) -> &'static str {
        NAME_SYSTEMD
    }

    fn get_stats(&self, _path: &Path, _stats: &mut Stats) -> Result<()> {
        Ok(())
    }

    fn set(&self, _path: &Path, _r: &Resources) -> Result<()> {
        Ok(())
    }
}
