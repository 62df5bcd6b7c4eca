//! corral - systemd-backed cgroup v1 management for a container runtime
//!
//! This library drives the kernel resource-isolation groups a container
//! runs in, on hosts where systemd owns the cgroup v1 hierarchies. It
//! starts and stops the transient unit behind a group, resolves and joins
//! the per-subsystem directories, translates resource limits into systemd
//! properties, and installs in-kernel device-access filter programs.
//!
//! # Modules
//!
//! - `cgroups` - group lifecycle: apply, set, freeze, stats, destroy
//! - `systemd` - blocking D-Bus client for the unit-transaction API
//! - `ebpf` - device-filter program load/attach on cgroup directories
//! - `error` - the crate-wide error type
//!
//! # Quick Start
//!
//! ```ignore
//! use corral::{CgroupConfig, LegacyManager, Resources};
//!
//! let config = CgroupConfig {
//!     name: container_id.to_string(),
//!     scope_prefix: "corral".to_string(),
//!     ..Default::default()
//! };
//! let manager = LegacyManager::new(config, None);
//!
//! // Create the group and enroll the container's init process
//! manager.apply(init_pid)?;
//!
//! // Tighten limits later without restarting anything
//! manager.set(&resources)?;
//!
//! // Tear everything down when the container exits
//! manager.destroy()?;
//! ```

pub mod cgroups;
pub mod ebpf;
pub mod error;
pub mod systemd;

// Re-export commonly used types at crate root for convenience
pub use cgroups::{CgroupConfig, DeviceRule, DeviceType, FreezerState, LegacyManager, Resources, Stats};
pub use ebpf::{BpfInsn, DeviceFilterGuard};
pub use error::{CgroupError, Result};
