//! Configuration types describing a managed cgroup.
//!
//! A [`CgroupConfig`] is handed to the manager once and treated as
//! read-only apart from the freezer state, which tracks the desired state
//! across Freeze calls. [`Resources`] may be rebuilt by the caller between
//! `apply` and `set`.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::systemd::Property;

/// Descriptor for one managed cgroup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CgroupConfig {
    /// Container name; becomes part of the systemd unit name.
    pub name: String,

    /// Prefix for scope unit names, e.g. `corral` yields
    /// `corral-<name>.scope`.
    pub scope_prefix: String,

    /// Parent slice the unit is placed under. Empty means the default
    /// system slice.
    pub parent: String,

    /// Externally supplied subsystem paths. When set, the manager only
    /// joins these paths and never creates or destroys anything.
    pub paths: Option<HashMap<String, PathBuf>>,

    /// Resource limits applied to the group.
    pub resources: Resources,

    /// Skip writing device rules and the freeze/thaw bracket around
    /// reconfiguration.
    pub skip_devices: bool,

    /// Extra raw systemd properties merged into the unit start request.
    #[serde(skip)]
    pub systemd_props: Vec<Property>,
}

impl CgroupConfig {
    /// The systemd unit name for this group: slice names are used as-is,
    /// anything else becomes a transient scope.
    pub fn unit_name(&self) -> String {
        if self.name.ends_with(".slice") {
            self.name.clone()
        } else if self.scope_prefix.is_empty() {
            format!("{}.scope", self.name)
        } else {
            format!("{}-{}.scope", self.scope_prefix, self.name)
        }
    }
}

/// Resource limits for a cgroup, v1 semantics.
///
/// Zero means "not set" for every numeric field; `-1` is the explicit
/// "unlimited" sentinel where one exists (cpu quota, pids limit).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limit in bytes.
    pub memory: i64,

    /// CPU shares (relative weight).
    pub cpu_shares: u64,

    /// CPU hardcap quota in microseconds per period. `-1` is unlimited.
    pub cpu_quota: i64,

    /// CPU hardcap period in microseconds.
    pub cpu_period: u64,

    /// Block IO weight (10..1000).
    pub blkio_weight: u16,

    /// Maximum number of pids. `-1` is unlimited.
    pub pids_limit: i64,

    /// CPUs the group may run on, range-list form, e.g. `0-3,7`.
    pub cpuset_cpus: String,

    /// Memory nodes the group may allocate from, range-list form.
    pub cpuset_mems: String,

    /// Device access rules, evaluated in order.
    pub devices: Vec<DeviceRule>,

    /// Desired freezer state.
    pub freezer: FreezerState,

    /// cgroup v2 (unified) key/value limits. Not supported by this
    /// manager; a `Some` value fails fast.
    pub unified: Option<HashMap<String, String>>,
}

/// State of the freezer subsystem for a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreezerState {
    /// No freezer hierarchy, or state never read.
    #[default]
    Undefined,
    /// All processes in the group are stopped.
    Frozen,
    /// Processes run normally.
    Thawed,
}

/// Kind of device a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    /// `a` — every device; only meaningful with wildcard major/minor.
    All,
    /// `c` — character device.
    Char,
    /// `b` — block device.
    Block,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::All => "a",
            DeviceType::Char => "c",
            DeviceType::Block => "b",
        }
    }
}

/// One device access rule. `None` major/minor means wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    pub dev_type: DeviceType,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub read: bool,
    pub write: bool,
    pub mknod: bool,
    /// True for an allow rule, false for a deny rule.
    pub allow: bool,
}

impl DeviceRule {
    /// Access string in cgroup v1 form, e.g. `rwm`.
    pub fn permissions(&self) -> String {
        let mut s = String::new();
        if self.read {
            s.push('r');
        }
        if self.write {
            s.push('w');
        }
        if self.mknod {
            s.push('m');
        }
        s
    }

    /// The `devices.allow`/`devices.deny` line for this rule.
    pub fn cgroup_string(&self) -> String {
        let major = match self.major {
            Some(n) => n.to_string(),
            None => "*".to_string(),
        };
        let minor = match self.minor {
            Some(n) => n.to_string(),
            None => "*".to_string(),
        };
        format!("{} {}:{} {}", self.dev_type.as_str(), major, minor, self.permissions())
    }

    /// True for an `a *:* rwm` style rule covering every device.
    pub fn matches_all(&self) -> bool {
        self.dev_type == DeviceType::All && self.major.is_none() && self.minor.is_none()
    }
}
