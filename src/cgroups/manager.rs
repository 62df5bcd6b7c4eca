//! The legacy (cgroup v1) manager driving systemd-owned hierarchies.
//!
//! One [`LegacyManager`] owns one group: its configuration, the resolved
//! per-subsystem path table and a handle to the systemd client. Every
//! operation, readers included, holds the instance lock for its full
//! duration so concurrent callers observe whole transitions only. Calls
//! into the kernel and into systemd are synchronous and block the caller;
//! timeouts, if wanted, wrap the whole call externally.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::info;

use super::config::{CgroupConfig, FreezerState, Resources};
use super::paths::{self, DEFAULT_SLICE};
use super::properties::translate;
use super::stats::Stats;
use super::subsystems::{
    CpusetController, FreezerController, Subsystem, CPUSET, DEVICES, FREEZER, NAME_SYSTEMD,
    SUBSYSTEMS,
};
use crate::ebpf::{load_attach_device_filter, BpfInsn, DeviceFilterGuard};
use crate::error::{CgroupError, Result};
use crate::systemd::{prop, SystemdClient};

/// Manager for one systemd-backed v1 cgroup.
#[derive(Debug)]
pub struct LegacyManager {
    client: SystemdClient,
    state: Mutex<ManagerState>,
}

#[derive(Debug)]
struct ManagerState {
    config: CgroupConfig,
    paths: HashMap<String, PathBuf>,
}

impl LegacyManager {
    /// Create a manager for `config`. `paths` restores a previously
    /// resolved path table (e.g. from a state file); pass `None` for a
    /// fresh group. Nothing is contacted until the first operation.
    pub fn new(config: CgroupConfig, paths: Option<HashMap<String, PathBuf>>) -> Self {
        LegacyManager {
            client: SystemdClient::new(),
            state: Mutex::new(ManagerState {
                config,
                paths: paths.unwrap_or_default(),
            }),
        }
    }

    /// Create the group and enroll `pid` into every available hierarchy.
    ///
    /// With externally supplied paths the unit manager is bypassed: the
    /// paths are intersected with the hierarchies this process can see
    /// and the pid is enrolled directly. Otherwise the transient unit is
    /// started, every subsystem path is resolved (a host without a
    /// devices hierarchy is rejected before any directory is created;
    /// device isolation is not best-effort), and the pid joins each
    /// group. A pid of -1 creates the group without enrolling anyone.
    pub fn apply(&self, pid: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if state.config.resources.unified.is_some() {
            return Err(CgroupError::UnsupportedConfiguration(
                "unified resources are not supported by the v1 manager".to_string(),
            ));
        }

        if let Some(config_paths) = state.config.paths.clone() {
            let own = paths::own_cgroups()?;
            let mut joined = HashMap::new();
            for (name, path) in config_paths {
                if own.contains_key(&name) {
                    joined.insert(name, path);
                }
            }
            state.paths = joined;
            return paths::enter_pid(&state.paths, pid);
        }

        let unit = state.config.unit_name();
        let slice = if state.config.parent.is_empty() {
            DEFAULT_SLICE.to_string()
        } else {
            state.config.parent.clone()
        };

        let mut properties = vec![prop(
            "Description",
            format!("corral container {}", state.config.name),
        )];
        if unit.ends_with(".slice") {
            // Slices pull their parent in via a Wants= relation.
            properties.push(prop("Wants", slice));
        } else {
            properties.push(prop("Slice", slice));
        }
        if pid != -1 {
            properties.push(prop("PIDs", vec![pid as u32]));
        }
        if !unit.ends_with(".slice") {
            // Scopes always support delegation.
            properties.push(prop("Delegate", true));
        }
        // Accounting is forced on so every group gets the same counters
        // regardless of the host manager's defaults, and because joining
        // the memory hierarchy late is unreliable.
        properties.push(prop("MemoryAccounting", true));
        properties.push(prop("CPUAccounting", true));
        properties.push(prop("BlockIOAccounting", true));
        properties.push(prop("TasksAccounting", true));
        properties.push(prop("DefaultDependencies", false));
        properties.extend(state.config.systemd_props.iter().cloned());

        self.client.start_unit(&unit, &properties)?;

        // Resolve every path before creating anything, so a missing
        // mandatory hierarchy cannot leave a partial group behind.
        let mut resolved = HashMap::new();
        for sys in SUBSYSTEMS.iter() {
            match paths::subsystem_path(&state.config, sys.name()) {
                Ok(path) => {
                    resolved.insert(sys.name().to_string(), path);
                }
                Err(e) if sys.name() == DEVICES => return Err(e),
                Err(e) if e.is_subsystem_absent() => continue,
                Err(e) => return Err(e),
            }
        }
        state.paths = resolved;

        self.join_cgroups(&state, pid)
    }

    fn join_cgroups(&self, state: &ManagerState, pid: i32) -> Result<()> {
        for sys in SUBSYSTEMS.iter() {
            let Some(path) = state.paths.get(sys.name()) else {
                continue;
            };
            match sys.name() {
                // systemd manages its own named hierarchy.
                NAME_SYSTEMD => {}
                CPUSET => {
                    CpusetController.apply_dir(path, &state.config.resources, pid)?;
                }
                _ => {
                    fs::create_dir_all(path)
                        .map_err(|e| CgroupError::io(format!("creating {}", path.display()), e))?;
                    paths::write_cgroup_proc(path, pid)?;
                }
            }
        }
        Ok(())
    }

    /// Reconfigure the group's resource limits.
    ///
    /// The group is frozen while systemd applies the property set,
    /// because systemd rewrites device rules disruptively and running
    /// processes would observe spurious EPERM on common devices. The
    /// prior freezer state is restored even when property application
    /// fails; leaving a container frozen on error is worse than applying
    /// possibly-incomplete limits. Hosts without a freezer hierarchy skip
    /// the bracket with a log line.
    pub fn set(&self, r: &Resources) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        // Externally supplied paths are join-only; nothing to set.
        if state.config.paths.is_some() {
            return Ok(());
        }
        if r.unified.is_some() {
            return Err(CgroupError::UnsupportedConfiguration(
                "unified resources are not supported by the v1 manager".to_string(),
            ));
        }

        let properties = translate(r)?;

        let mut target_state = FreezerState::Undefined;
        if !state.config.skip_devices {
            target_state = Self::freezer_state_locked(&state)?;
            if target_state == FreezerState::Undefined {
                target_state = FreezerState::Thawed;
            }
            if let Err(e) = Self::freeze_locked(&mut state, FreezerState::Frozen) {
                info!(error = %e, "could not freeze group before applying unit properties");
            }
        }

        let unit = state.config.unit_name();
        let applied = self.client.set_unit_properties(&unit, &properties);

        // Restore the previous freezer state whether or not the
        // properties went through.
        if let Err(e) = Self::freeze_locked(&mut state, target_state) {
            info!(error = %e, "could not restore freezer state after applying unit properties");
        }
        applied?;

        for sys in SUBSYSTEMS.iter() {
            let Some(path) = state.paths.get(sys.name()) else {
                continue;
            };
            if state.config.skip_devices && sys.name() == DEVICES {
                continue;
            }
            sys.set(path, r)?;
        }
        Ok(())
    }

    /// Transition the freezer subsystem to `state`.
    pub fn freeze(&self, state: FreezerState) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        Self::freeze_locked(&mut guard, state)
    }

    fn freeze_locked(state: &mut ManagerState, target: FreezerState) -> Result<()> {
        let Some(path) = state.paths.get(FREEZER).cloned() else {
            return Err(CgroupError::absent(FREEZER));
        };
        let prev = state.config.resources.freezer;
        state.config.resources.freezer = target;
        if let Err(e) = FreezerController.set(&path, &state.config.resources) {
            // Keep the recorded desired state consistent with the kernel.
            state.config.resources.freezer = prev;
            return Err(e);
        }
        Ok(())
    }

    /// The kernel-observed freezer state, or `Undefined` when this host
    /// has no freezer hierarchy.
    pub fn get_freezer_state(&self) -> Result<FreezerState> {
        let state = self.state.lock().unwrap();
        Self::freezer_state_locked(&state)
    }

    fn freezer_state_locked(state: &ManagerState) -> Result<FreezerState> {
        match state.paths.get(FREEZER) {
            Some(path) => FreezerController.state(path),
            None => Ok(FreezerState::Undefined),
        }
    }

    /// Stop the unit and remove every directory this manager created.
    ///
    /// A manager over externally supplied paths owns nothing and returns
    /// immediately. Cleanup runs regardless of the stop result, and a
    /// cleanup failure outranks a stop failure: leaked directories are
    /// the lasting damage.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.config.paths.is_some() {
            return Ok(());
        }

        let unit = state.config.unit_name();
        let stopped = self.client.stop_unit(&unit);
        let cleaned = paths::remove_paths(&mut state.paths);

        match (stopped, cleaned) {
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    /// Collect statistics from every tracked subsystem into one result.
    /// The first collector failure aborts; partial stats are never
    /// returned.
    pub fn get_stats(&self) -> Result<Stats> {
        let state = self.state.lock().unwrap();
        let mut stats = Stats::default();
        for sys in SUBSYSTEMS.iter() {
            let Some(path) = state.paths.get(sys.name()) else {
                continue;
            };
            sys.get_stats(path, &mut stats)?;
        }
        Ok(stats)
    }

    /// Pids enrolled directly in the group, read from the devices
    /// hierarchy.
    pub fn get_pids(&self) -> Result<Vec<i32>> {
        let state = self.state.lock().unwrap();
        let Some(path) = state.paths.get(DEVICES) else {
            return Err(CgroupError::absent(DEVICES));
        };
        paths::get_pids(path)
    }

    /// Pids in the group or any nested group.
    pub fn get_all_pids(&self) -> Result<Vec<i32>> {
        let state = self.state.lock().unwrap();
        let Some(path) = state.paths.get(DEVICES) else {
            return Err(CgroupError::absent(DEVICES));
        };
        paths::get_all_pids(path)
    }

    /// Install a device filter program on the group's devices directory.
    /// Returns the revert guard from the attacher.
    pub fn install_device_filter(
        &self,
        insns: &[BpfInsn],
        license: &str,
    ) -> Result<DeviceFilterGuard> {
        let state = self.state.lock().unwrap();
        let Some(path) = state.paths.get(DEVICES) else {
            return Err(CgroupError::absent(DEVICES));
        };
        let dir = File::open(path)
            .map_err(|e| CgroupError::io(format!("opening {}", path.display()), e))?;
        load_attach_device_filter(insns, license, dir)
    }

    /// The resolved directory for one subsystem, if available.
    pub fn path(&self, subsystem: &str) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        state.paths.get(subsystem).cloned()
    }

    /// Snapshot of the full subsystem path table.
    pub fn get_paths(&self) -> HashMap<String, PathBuf> {
        let state = self.state.lock().unwrap();
        state.paths.clone()
    }

    /// Whether the group exists on disk, judged by its devices directory.
    pub fn exists(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .paths
            .get(DEVICES)
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}
