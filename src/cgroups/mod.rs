//! Lifecycle management for systemd-backed cgroup v1 hierarchies.
//!
//! On a v1 host each resource controller (memory, cpu, devices, freezer,
//! ...) is its own independently mounted hierarchy, and systemd owns the
//! directory layout. This module drives a group through
//! create / reconfigure / freeze / query / destroy:
//!
//! ```text
//! apply   → start transient unit, resolve per-subsystem paths,
//!           enroll the pid in every available hierarchy
//! set     → freeze, apply systemd properties, thaw, write direct
//!           per-subsystem limits
//! freeze  → transition the freezer hierarchy
//! destroy → stop the unit, remove created directories
//! ```
//!
//! The devices hierarchy is mandatory; a host without it cannot provide
//! device isolation and is rejected at apply time.

pub mod config;
pub mod manager;
pub mod paths;
pub mod properties;
pub mod stats;
pub mod subsystems;

pub use config::{CgroupConfig, DeviceRule, DeviceType, FreezerState, Resources};
pub use manager::LegacyManager;
pub use stats::Stats;
pub use subsystems::Subsystem;
