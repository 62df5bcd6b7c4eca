//! Error type shared by the cgroup, systemd and eBPF layers.
//!
//! Every fallible operation in this crate returns [`CgroupError`]. The
//! variants map one-to-one onto the failure classes the surrounding runtime
//! has to tell apart: raw kernel syscall failures, the bounded-retry
//! exhaustion of the device-filter query, a missing hierarchy, a
//! configuration this legacy (v1) manager cannot express, unit-manager
//! failures, resource translation failures, and cleanup failures during
//! destroy.

use std::fmt;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, CgroupError>;

/// Error returned by cgroup management operations.
#[derive(Debug)]
pub enum CgroupError {
    /// A raw kernel call (bpf program query/load/attach/detach) failed.
    Syscall {
        /// Which kernel operation failed, e.g. `bpf_prog_load`.
        op: &'static str,
        errno: Errno,
    },
    /// The attached-program enumeration kept racing with concurrent
    /// attach/detach activity and never stabilized within the retry bound.
    EnumerationRace,
    /// A cgroup hierarchy is not mounted on this host. Fatal only for the
    /// devices subsystem; other subsystems are skipped when absent.
    SubsystemAbsent { subsystem: String },
    /// The configuration uses a feature the v1 manager does not support.
    UnsupportedConfiguration(String),
    /// A unit-manager (systemd D-Bus) call failed.
    UnitManager {
        op: &'static str,
        source: zbus::Error,
    },
    /// A unit-manager job completed with a result other than `done`.
    UnitJob { unit: String, result: String },
    /// A resource value could not be mapped to unit-manager properties.
    Translation(String),
    /// A cgroup directory could not be removed during destroy.
    Cleanup { path: PathBuf, source: io::Error },
    /// Filesystem access to the cgroup surface failed.
    Io { op: String, source: io::Error },
}

impl CgroupError {
    pub(crate) fn io(op: impl Into<String>, source: io::Error) -> Self {
        CgroupError::Io {
            op: op.into(),
            source,
        }
    }

    pub(crate) fn absent(subsystem: &str) -> Self {
        CgroupError::SubsystemAbsent {
            subsystem: subsystem.to_string(),
        }
    }

    /// True for the "hierarchy not mounted on this host" case, which most
    /// callers tolerate by skipping the subsystem.
    pub fn is_subsystem_absent(&self) -> bool {
        matches!(self, CgroupError::SubsystemAbsent { .. })
    }
}

impl fmt::Display for CgroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupError::Syscall { op, errno } => {
                write!(f, "{} failed: {}", op, errno)
            }
            CgroupError::EnumerationRace => {
                write!(f, "could not get complete list of attached device filter programs")
            }
            CgroupError::SubsystemAbsent { subsystem } => {
                write!(f, "cgroup subsystem {} does not exist", subsystem)
            }
            CgroupError::UnsupportedConfiguration(msg) => {
                write!(f, "unsupported configuration: {}", msg)
            }
            CgroupError::UnitManager { op, source } => {
                write!(f, "systemd {} failed: {}", op, source)
            }
            CgroupError::UnitJob { unit, result } => {
                write!(f, "systemd job for unit {} finished with result {:?}", unit, result)
            }
            CgroupError::Translation(msg) => {
                write!(f, "cannot translate resources: {}", msg)
            }
            CgroupError::Cleanup { path, source } => {
                write!(f, "removing cgroup {}: {}", path.display(), source)
            }
            CgroupError::Io { op, source } => {
                write!(f, "{}: {}", op, source)
            }
        }
    }
}

impl std::error::Error for CgroupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CgroupError::UnitManager { source, .. } => Some(source),
            CgroupError::Cleanup { source, .. } => Some(source),
            CgroupError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
